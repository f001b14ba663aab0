//! Output adapters.
//!
//! - [`json`]: reads and checkpoints the events file, writes the run report
//!
//! # Output Structure
//!
//! ```text
//! events.json                 # rows, rewritten after each ready event
//! report_dir/
//! └── 2025-05-06/
//!     └── morning.json        # run report
//! ```

pub mod json;
