use super::*;
use crate::cache::ContentCache;
use crate::models::{RawCandidate, VerifyStatus};
use crate::testing::{MockBrowser, MockHttp, MockJudge, article_html, article_text};
use std::path::Path;
use std::time::{Duration, Instant};

const A: &str = "https://www.example.com/news/rates";
const B: &str = "https://www.example.com/news/other";
const REUTERS: &str = "https://www.reuters.com/world/rates-2025-05-06/";

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.cache.dir = dir.join("articles");
    config.fetch.proxy_prefix = None;
    config.fetch.archive_mirrors = Vec::new();
    config.fetch.wayback = false;
    config.cooldown.probe_interval_secs = None;
    config.verify.min_interval_ms = 0;
    config.candidates.search_min_interval_ms = 0;
    config.candidates.decode_min_interval_ms = 0;
    config.candidates.external_search = false;
    config
}

fn pipeline(
    config: &PipelineConfig,
    http: &MockHttp,
    browser: Option<MockBrowser>,
    judge: MockJudge,
) -> Pipeline<MockHttp, MockBrowser, MockJudge> {
    let verifier = MatchVerifier::new(judge, None, config.verify.clone());
    Pipeline::new(config, http.clone(), browser, verifier)
}

fn event(id: &str, url: &str) -> TargetEvent {
    TargetEvent {
        id: id.into(),
        url: Some(url.into()),
        title_en: Some("Central bank raises key rate".into()),
        source: Some("Example Times".into()),
        date: Some("2025-05-06".into()),
        ..Default::default()
    }
}

fn candidate(url: &str, source: &str) -> RawCandidate {
    RawCandidate {
        title: Some("Central bank lifts key rate".into()),
        url: Some(url.into()),
        source: Some(source.into()),
        ..Default::default()
    }
}

async fn cached_status(config: &PipelineConfig, url: &str) -> Option<CacheStatus> {
    ContentCache::new(&config.cache).probe(url).await.meta.map(|m| m.status)
}

#[tokio::test]
async fn test_happy_path_commits_direct_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    http.route(A, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.92));

    let mut ev = event("1", A);
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert!(outcome.failures.is_empty());
    assert_eq!(ev.text.as_deref(), Some(article_text(150).as_str()));
    assert_eq!(ev.text_method, Some(Method::Fetch));
    assert_eq!(ev.text_url.as_deref(), Some(A));
    assert_eq!(ev.fetch_status.as_deref(), Some("ok"));
    assert_eq!(ev.verify_status, Some(VerifyStatus::Ok));
    assert_eq!(cached_status(&config, A).await, Some(CacheStatus::Ok));
}

#[tokio::test]
async fn test_short_text_falls_back_to_wire_copy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    http.route(A, 200, &article_html(20));
    http.route(REUTERS, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));

    let mut ev = event("1", A);
    ev.related = vec![candidate(REUTERS, "Reuters")];
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert_eq!(outcome.failures[0].kind, FailureKind::ContentTooShort);
    assert_eq!(ev.text_url.as_deref(), Some(REUTERS));
    assert_eq!(ev.text_source.as_deref(), Some("Reuters"));
    assert_eq!(ev.fetch_status.as_deref(), Some("ok"));
    assert_eq!(cached_status(&config, A).await, Some(CacheStatus::Short));
}

#[tokio::test]
async fn test_mismatch_is_cached_as_evidence_then_candidate_wins() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    http.route(A, 200, &article_html(150));
    http.route(REUTERS, 200, &article_html(200));
    let p = pipeline(&config, &http, None, MockJudge::matching_url("reuters.com"));

    let mut ev = event("1", A);
    ev.related = vec![candidate(REUTERS, "Reuters")];
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert_eq!(outcome.failures[0].kind, FailureKind::VerificationMismatch);
    assert_eq!(ev.text.as_deref(), Some(article_text(200).as_str()));
    assert_eq!(ev.text_url.as_deref(), Some(REUTERS));

    let probe = ContentCache::new(&config.cache).probe(A).await;
    assert!(probe.has_body);
    assert_eq!(probe.meta.map(|m| m.status), Some(CacheStatus::Mismatch));
}

#[tokio::test]
async fn test_captcha_host_is_not_refetched_but_other_hosts_are() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    let walled = "https://www.xnews.com/story1";
    let walled_candidate = "https://www.xnews.com/story2";
    let open_candidate = "https://www.znews.com/story";
    http.route(
        walled,
        200,
        r#"<html><body><div class="g-recaptcha"></div><p>Please verify you are human</p></body></html>"#,
    );
    http.route(walled_candidate, 200, &article_html(150));
    http.route(open_candidate, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));

    let mut first = event("1", walled);
    first.source = Some("X News".into());
    p.acquire(&mut first).await.unwrap();
    assert_eq!(first.acquisition, AcquisitionStatus::Failed);
    assert_eq!(first.failure.as_ref().map(|f| f.kind), Some(FailureKind::Captcha));
    assert_eq!(cached_status(&config, walled).await, Some(CacheStatus::Blocked));
    assert!(p.cooldowns().is_in_cooldown("xnews.com").is_some());

    let mut second = event("2", B);
    second.related = vec![candidate(walled_candidate, "X News"), candidate(open_candidate, "Z News")];
    let outcome = p.acquire(&mut second).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert_eq!(http.count(walled_candidate), 0);
    assert_eq!(http.count(walled), 1);
    assert_eq!(second.text_url.as_deref(), Some(open_candidate));
}

#[tokio::test]
async fn test_cooling_candidate_host_gets_its_periodic_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cooldown.probe_interval_secs = Some(1);
    config.cooldown.probe_min_cooldown_secs = 0;
    let http = MockHttp::new();
    http.route(A, 200, &article_html(20));
    http.route(REUTERS, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));
    let earlier = Instant::now().checked_sub(Duration::from_secs(10)).unwrap();
    p.cooldowns()
        .set_cooldown_at(REUTERS, Duration::from_secs(6 * 3600), "status 403", earlier);

    let mut ev = event("1", A);
    ev.related = vec![candidate(REUTERS, "Reuters")];
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert_eq!(http.count(REUTERS), 1);
    assert_eq!(ev.text_url.as_deref(), Some(REUTERS));
}

#[tokio::test]
async fn test_judge_outage_is_fatal_unless_fail_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let http = MockHttp::new();
    http.route(A, 200, &article_html(150));

    let strict = pipeline(&config, &http, None, MockJudge::failing());
    let mut ev = event("1", A);
    let err = strict.acquire(&mut ev).await.unwrap_err();
    assert!(matches!(err, RunError::VerifierUnavailable(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(ev.acquisition, AcquisitionStatus::Pending);
    assert_eq!(ev.verify_status, Some(VerifyStatus::Error));
    assert!(ev.text.is_none());

    config.verify.fail_open = true;
    let lenient = pipeline(&config, &http, None, MockJudge::failing());
    let mut ev = event("1", A);
    let outcome = lenient.acquire(&mut ev).await.unwrap();
    assert_eq!(outcome.status, AcquisitionStatus::Accepted);
    assert_eq!(ev.verify_status, Some(VerifyStatus::Unverified));
}

#[tokio::test]
async fn test_closed_browser_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    let browser = MockBrowser::new();
    browser.crash_on(A);
    let p = pipeline(&config, &http, Some(browser.clone()), MockJudge::verdict(true, 0.9));

    let mut events = vec![event("1", A), event("2", B)];
    let mut ready = Vec::new();
    let run = p
        .run_all(&mut events, async |_: &[TargetEvent], i: usize| ready.push(i))
        .await;

    assert!(matches!(run.fatal, Some(RunError::BrowserClosed(_))));
    assert!(run.report.fatal.is_some());
    assert!(ready.is_empty());
    assert_eq!(browser.calls(), vec![A.to_string()]);
    assert!(browser.is_closed());
    assert_eq!(events[0].acquisition, AcquisitionStatus::Pending);
    assert_eq!(events[1].acquisition, AcquisitionStatus::Pending);
}

#[tokio::test]
async fn test_terminal_cache_status_skips_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let cache = ContentCache::new(&config.cache);
    cache
        .write_meta_only(A, &CacheMeta::new(A, CacheStatus::Mismatch, Some("fetch")))
        .await
        .unwrap();
    let http = MockHttp::new();
    http.route(A, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));

    let mut ev = event("1", A);
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Failed);
    assert_eq!(http.count(A), 0);
    assert_eq!(ev.failure.as_ref().map(|f| f.kind), Some(FailureKind::CacheTerminal));
    assert!(outcome.failures.iter().any(|f| f.kind == FailureKind::NoCandidates));
}

#[tokio::test]
async fn test_verified_cache_entry_is_reused_without_network_or_judge() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let cache = ContentCache::new(&config.cache);
    cache
        .write(
            A,
            &article_html(150),
            &article_text(150),
            &CacheMeta::new(A, CacheStatus::Ok, Some("archive")),
        )
        .await
        .unwrap();
    let http = MockHttp::new();
    let judge = MockJudge::verdict(true, 0.9);
    let p = pipeline(&config, &http, None, judge.clone());

    let mut ev = event("1", A);
    p.acquire(&mut ev).await.unwrap();

    assert_eq!(ev.acquisition, AcquisitionStatus::Accepted);
    assert_eq!(ev.text_method, Some(Method::Cache));
    assert!(http.calls().is_empty());
    assert!(judge.calls().is_empty());
}

#[tokio::test]
async fn test_unverified_cache_entry_is_marked_ok_once_judged() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let cache = ContentCache::new(&config.cache);
    cache
        .write(
            A,
            &article_html(150),
            &article_text(150),
            &CacheMeta::new(A, CacheStatus::Unset, Some("archive")),
        )
        .await
        .unwrap();
    let http = MockHttp::new();
    let judge = MockJudge::verdict(true, 0.9);
    let p = pipeline(&config, &http, None, judge.clone());

    let mut first = event("1", A);
    p.acquire(&mut first).await.unwrap();
    assert_eq!(first.acquisition, AcquisitionStatus::Accepted);
    assert_eq!(judge.calls().len(), 1);

    let meta = cache.probe(A).await.meta.unwrap();
    assert_eq!(meta.status, CacheStatus::Ok);
    assert_eq!(meta.method.as_deref(), Some("archive"));

    let mut again = event("2", A);
    p.acquire(&mut again).await.unwrap();
    assert_eq!(again.acquisition, AcquisitionStatus::Accepted);
    assert_eq!(judge.calls().len(), 1);
    assert!(http.calls().is_empty());
}

#[tokio::test]
async fn test_deferred_candidate_is_retried_once_after_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let redirect = "https://news.google.com/rss/articles/AU_yqLopaque?oc=5";
    let http = MockHttp::new();
    http.route(redirect, 429, "");
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));

    let mut ev = event("1", A);
    ev.related = vec![
        RawCandidate {
            title: Some("Wire copy".into()),
            redirect: Some(redirect.into()),
            source: Some("Associated Press".into()),
            ..Default::default()
        },
        candidate("https://www.bbc.com/news/rates", "BBC"),
    ];
    let outcome = p.acquire(&mut ev).await.unwrap();

    assert_eq!(outcome.status, AcquisitionStatus::Failed);
    assert_eq!(http.count(redirect), 1);
    assert!(http.called("https://www.bbc.com/news/rates"));
    let failure = ev.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::ResolveFailed);
    assert_eq!(failure.reason, "redirect decoding deferred twice");
}

#[tokio::test]
async fn test_run_reports_counts_and_signals_each_ready_row() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let http = MockHttp::new();
    http.route(A, 200, &article_html(150));
    let p = pipeline(&config, &http, None, MockJudge::verdict(true, 0.9));

    let mut done = event("0", "https://www.example.com/news/done");
    done.acquisition = AcquisitionStatus::Accepted;
    done.text = Some("already here".into());
    let mut events = vec![done, event("1", A), event("2", B)];
    let mut ready = Vec::new();
    let run = p
        .run_all(&mut events, async |rows: &[TargetEvent], i: usize| {
            ready.push((i, rows[i].acquisition))
        })
        .await;

    assert!(run.fatal.is_none());
    assert_eq!(run.report.total, 3);
    assert_eq!(run.report.skipped, 1);
    assert_eq!(run.report.accepted, 1);
    assert_eq!(run.report.failed, 1);
    assert_eq!(run.report.failures.len(), 1);
    assert_eq!(run.report.failures[0].id, "2");
    assert_eq!(
        ready,
        vec![
            (0, AcquisitionStatus::Accepted),
            (1, AcquisitionStatus::Accepted),
            (2, AcquisitionStatus::Failed),
        ]
    );
}
