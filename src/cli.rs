//! Command-line interface definitions.
//!
//! All path options can also come from environment variables.

use clap::Parser;
use std::path::PathBuf;

/// Acquire and verify article text for a file of news events.
///
/// # Examples
///
/// ```sh
/// # Rows are updated in place
/// news_acquire --events rows.json
///
/// # Separate output, no headless browser, first 20 rows only
/// news_acquire --events rows.json --output done.json --no-browser --limit 20
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Input JSON array of event rows
    #[arg(short, long, env = "NEWS_ACQUIRE_EVENTS")]
    pub events: PathBuf,

    /// Where to write the updated rows (defaults to the input file)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for end-of-run reports
    #[arg(short, long, env = "NEWS_ACQUIRE_REPORT_DIR", default_value = "reports")]
    pub report_dir: String,

    /// Pipeline config YAML
    #[arg(short, long, env = "NEWS_ACQUIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// awful_aj config.yaml for the primary judge (defaults to the awful_aj config dir)
    #[arg(long, env = "NEWS_ACQUIRE_JUDGE_CONFIG")]
    pub judge_config: Option<PathBuf>,

    /// awful_aj config.yaml for the fallback judge
    #[arg(long, env = "NEWS_ACQUIRE_FALLBACK_JUDGE_CONFIG")]
    pub fallback_judge_config: Option<PathBuf>,

    /// awful_aj template name for the verification prompt
    #[arg(long, env = "NEWS_ACQUIRE_TEMPLATE", default_value = "news_match")]
    pub template: String,

    /// Never start the headless browser
    #[arg(long)]
    pub no_browser: bool,

    /// Process at most this many rows
    #[arg(long)]
    pub limit: Option<usize>,
}

impl Cli {
    pub fn output_path(&self) -> &PathBuf {
        self.output.as_ref().unwrap_or(&self.events)
    }
}
