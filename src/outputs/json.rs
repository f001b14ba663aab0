//! JSON storage adapter for event rows and run reports.
//!
//! The events file is a JSON array of rows. It is rewritten in place after
//! every ready row (tmp file, then rename) so an interrupted run loses at most
//! the event in flight.
//!
//! Reports are organized by date with edition names:
//! ```text
//! report_dir/
//! └── 2025-05-06/
//!     ├── morning.json
//!     ├── afternoon.json
//!     └── evening.json
//! ```

use chrono::Local;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

use crate::models::TargetEvent;
use crate::orchestrator::RunReport;
use crate::utils::time_of_day;

#[instrument(level = "info")]
pub async fn read_events(path: &Path) -> Result<Vec<TargetEvent>, Box<dyn Error>> {
    let raw = fs::read_to_string(path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to read events file");
        e
    })?;
    let events: Vec<TargetEvent> = serde_json::from_str(&raw)?;
    info!(count = events.len(), "Loaded events");
    Ok(events)
}

/// Write `events` to `path` via a sibling tmp file and a rename.
#[instrument(level = "debug", skip(events))]
pub async fn write_events<'a>(
    events: impl IntoIterator<Item = &'a TargetEvent>,
    path: &Path,
) -> Result<(), Box<dyn Error>> {
    let rows: Vec<&TargetEvent> = events.into_iter().collect();
    let json = serde_json::to_string_pretty(&rows)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Write the run report to `{report_dir}/{date}/{time_of_day}.json`.
///
/// Returns the path written.
#[instrument(level = "info", skip_all, fields(report_dir = %report_dir))]
pub async fn write_report(report: &RunReport, report_dir: &str) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(report)?;

    let local_date = Local::now().date_naive().to_string();
    let full_dir = PathBuf::from(report_dir).join(&local_date);

    info!(full_dir = %full_dir.display(), "Ensuring report directory exists");
    if let Err(e) = fs::create_dir_all(&full_dir).await {
        error!(full_dir = %full_dir.display(), error = %e, "Failed to create report dir");
        return Err(e.into());
    }

    let path = full_dir.join(format!("{}.json", time_of_day()));
    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run report");
    Ok(path)
}
