//! # News Acquire
//!
//! Acquires the full text of news articles referenced by a file of event rows
//! and confirms with an AI judge that the text reports the same event.
//!
//! ## Features
//!
//! - Disk cache keyed by normalized URL, with terminal statuses for pages that
//!   were too short, mismatched or blocked
//! - Direct fetch, text proxy, archive mirrors and the web archive, then a
//!   headless browser as last resort
//! - Per-host cooldowns after blocks, captchas and timeouts
//! - Alternative sources from the embedded related-articles list and news
//!   search when the original cannot be used
//!
//! ## Usage
//!
//! ```sh
//! news_acquire --events rows.json --report-dir ./reports
//! ```
//!
//! ## Architecture
//!
//! Events are processed one at a time:
//! 1. **Cache**: reuse or skip what an earlier run already decided
//! 2. **Fetch**: mirror chain, then browser
//! 3. **Verify**: AI judge decides whether the page matches the event
//! 4. **Fallback**: ranked alternative candidates through the same chain
//! 5. **Output**: rows are checkpointed after every event, report at the end

use awful_aj::{config as aj_config, config_dir, template};
use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cache;
mod candidates;
mod cli;
mod config;
mod cooldown;
mod error;
mod extract;
mod fetchers;
mod models;
mod orchestrator;
mod outputs;
mod rate_limit;
#[cfg(test)]
mod testing;
mod utils;
mod verify;

use api::{AwfulJudge, RetryAsk};
use cli::Cli;
use config::{PipelineConfig, VerifyConfig};
use fetchers::browser::ChromeSession;
use fetchers::http::ReqwestClient;
use models::TargetEvent;
use orchestrator::Pipeline;
use outputs::json;
use utils::ensure_writable_dir;
use verify::MatchVerifier;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_acquire starting up");

    let args = Cli::parse();
    debug!(?args.events, ?args.output, ?args.config, "Parsed CLI arguments");

    let mut pipeline_config = PipelineConfig::load(args.config.as_deref())?;
    if args.no_browser {
        pipeline_config.browser.enabled = false;
    }

    // Early checks: report and cache dirs must be writable
    for dir in [
        args.report_dir.clone(),
        pipeline_config.cache.dir.to_string_lossy().into_owned(),
    ] {
        if let Err(e) = ensure_writable_dir(&dir).await {
            error!(path = %dir, error = %e, "Directory is not writable (fix perms or choose a different path)");
            return Err(e);
        }
    }

    // ---- Judges ----
    let primary = load_judge("primary", args.judge_config.as_deref(), &args.template, &pipeline_config.verify).await?;
    let fallback = match args.fallback_judge_config.as_deref() {
        Some(path) => Some(load_judge("fallback", Some(path), &args.template, &pipeline_config.verify).await?),
        None => None,
    };
    let verifier = MatchVerifier::new(primary, fallback, pipeline_config.verify.clone());

    // ---- Pipeline ----
    let http = ReqwestClient::new(&pipeline_config.fetch)?;
    let browser = pipeline_config
        .browser
        .enabled
        .then(|| ChromeSession::new(&pipeline_config.browser));
    let pipeline = Pipeline::new(&pipeline_config, http, browser, verifier);

    let mut events = json::read_events(&args.events).await?;
    let limit = args.limit.unwrap_or(events.len()).min(events.len());
    let output = args.output_path().clone();
    info!(total = events.len(), limit, output = %output.display(), "Starting acquisition");

    let run = {
        let (head, tail) = events.split_at_mut(limit);
        let tail: &[TargetEvent] = tail;
        let output = output.as_path();
        pipeline
            .run_all(head, async |rows: &[TargetEvent], i: usize| {
                if let Err(e) = json::write_events(rows.iter().chain(tail), output).await {
                    warn!(event = %rows[i].id, error = %e, "Checkpoint failed");
                }
            })
            .await
    };

    // Final flush, also after a fatal error
    if let Err(e) = json::write_events(&events, &output).await {
        error!(path = %output.display(), error = %e, "Failed to write events");
    }
    if let Err(e) = json::write_report(&run.report, &args.report_dir).await {
        error!(error = %e, "Failed to write run report");
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        accepted = run.report.accepted,
        failed = run.report.failed,
        cooling_hosts = pipeline.cooldowns().len(),
        "Execution complete"
    );

    if let Some(fatal) = run.fatal {
        error!(error = %fatal, exit_code = fatal.exit_code(), "Run aborted");
        std::process::exit(fatal.exit_code());
    }
    Ok(())
}

/// Load an `awful_aj` config plus the verification template and wrap them in
/// the retrying judge.
async fn load_judge(
    name: &str,
    config_path: Option<&Path>,
    template_name: &str,
    verify: &VerifyConfig,
) -> Result<RetryAsk<AwfulJudge>, Box<dyn Error>> {
    let conf_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_dir()?.join("config.yaml"),
    };
    let config_path = conf_file.to_str().ok_or("Not a valid config filename")?;
    let config = aj_config::load_config(config_path)?;
    info!(judge = name, config_path, "Loaded configuration");

    let template = template::load_template(template_name).await?;
    info!(judge = name, template = template_name, "Loaded template");

    Ok(RetryAsk::new(
        AwfulJudge {
            name: name.to_string(),
            config,
            template,
        },
        verify.max_retries,
        Duration::from_millis(verify.retry_base_ms),
    ))
}
