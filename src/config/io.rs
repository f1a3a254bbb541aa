//! File I/O shared by everything the kernel persists

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Global settings directory (`~/.testuniverse/`)
pub fn global_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".testuniverse")
}

/// Global settings file (`~/.testuniverse/config.toml`)
pub fn global_config_path() -> PathBuf {
    global_config_dir().join("config.toml")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write a file atomically under an exclusive lock.
///
/// The parent directory is created if needed. Content goes to
/// `<file>.tmp` first and is renamed over the destination, so readers see
/// either the old or the new file. Concurrent writers serialize on
/// `<file>.lock`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let lock_path = sibling(path, ".lock");
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))?;

    let temp_path = sibling(path, ".tmp");
    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    temp_file
        .write_all(content)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    temp_file
        .sync_all()
        .with_context(|| format!("Failed to sync {}", temp_path.display()))?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {} into place", path.display()))?;

    drop(lock_file);
    let _ = std::fs::remove_file(&lock_path);
    Ok(())
}
