use std::{fs, io::Write, path::Path};

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::AppError;

/// Serialize `value` to `path` through a temp file in the same directory,
/// then rename over the target. Falls back to a plain write when the rename
/// is not supported (e.g. cross-device temp dirs).
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let payload = serde_json::to_vec(value)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;

    if let Err(err) = tmp.persist(path) {
        warn!(path = %path.display(), error = %err.error, "atomic rename failed, falling back to plain write");
        fs::write(path, &payload)?;
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AppError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}
