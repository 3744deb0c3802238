//! Whole-file replacement that never leaves a torn file behind

use crate::StoreError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to `path` via a sibling temp file and rename.
///
/// `mode` sets unix permissions on the new file; ignored elsewhere.
pub fn write_atomic(path: &Path, data: &[u8], mode: Option<u32>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp = tmp_path(path);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    let result = options
        .open(&tmp)
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, path));

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Async variant of [`write_atomic`] for callers on the runtime
pub async fn write_atomic_async(
    path: &Path,
    data: Vec<u8>,
    mode: Option<u32>,
) -> Result<(), StoreError> {
    let path = path.to_path_buf();
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&path, &data, mode))
        .await
        .map_err(|e| StoreError::io(target, std::io::Error::other(e)))?
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
    mode: Option<u32>,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data, mode)
}
