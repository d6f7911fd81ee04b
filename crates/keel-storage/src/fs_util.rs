//! Shared helpers for the file-backed stores.

use std::io::Write;
use std::path::Path;

use crate::error::{StorageError, StorageResult};

/// Prefix of in-flight temp files. Listings skip anything starting with it.
pub(crate) const TEMP_PREFIX: &str = ".keel-tmp-";

/// Run blocking filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("blocking task failed: {e}")))?
}

/// Write `data` to a temp file next to `target`, fsync, then rename it over
/// `target`. With `replace = false` the rename refuses to clobber an existing
/// file and reports [`StorageError::AlreadyExists`].
pub(crate) fn write_atomic(target: &Path, data: &[u8], replace: bool) -> StorageResult<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    if replace {
        tmp.persist(target).map_err(|e| StorageError::Io(e.error))?;
    } else {
        tmp.persist_noclobber(target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists(target.display().to_string())
            } else {
                StorageError::Io(e.error)
            }
        })?;
    }
    Ok(())
}

/// Validate a single file-name segment (namespace or key) for on-disk use.
pub(crate) fn validate_segment(kind: &str, segment: &str) -> StorageResult<()> {
    if segment.is_empty() {
        return Err(StorageError::InvalidKey(format!("{kind} must not be empty")));
    }
    if segment.starts_with('.') {
        return Err(StorageError::InvalidKey(format!(
            "{kind} must not start with '.': {segment}"
        )));
    }
    if segment
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(StorageError::InvalidKey(format!(
            "{kind} contains a forbidden character: {segment:?}"
        )));
    }
    Ok(())
}
