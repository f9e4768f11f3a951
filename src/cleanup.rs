//! Best-effort removal of per-job scratch files.
//!
//! Failing to delete a temporary file must never fail a job or stop the
//! worker, so every removal goes through here: a missing file is fine, any
//! other error is logged and swallowed.

use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

/// Remove `path`, returning whether a file was actually deleted.
pub async fn remove_best_effort(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed scratch file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
            false
        }
    }
}

/// Remove every path in `paths`, ignoring failures.
pub async fn remove_all_best_effort<'a, I>(paths: I)
where
    I: IntoIterator<Item = &'a Path>,
{
    for path in paths {
        remove_best_effort(path).await;
    }
}
