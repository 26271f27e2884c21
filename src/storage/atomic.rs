use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Replace `path` with `content` without ever exposing a half-written file.
///
/// The bytes go to a temp file in the same directory which is fsynced and then
/// renamed over the target. If anything fails the previous file is untouched.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Async wrapper that moves the blocking write off the runtime threads
pub async fn write_atomic_async(path: PathBuf, content: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &content))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
