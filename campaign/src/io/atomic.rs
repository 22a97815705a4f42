//! Crash-safe file replacement (temp file + fsync + rename).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Serialize `value` as pretty JSON with a trailing newline and replace `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Replace `path` with `contents` so readers see either the old or the new file.
///
/// The temp file is fsynced before the rename; on unix the parent directory is
/// fsynced afterwards so the rename itself is durable.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let tmp_path = temp_path(path);
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    path.with_extension(format!("{ext}.tmp"))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).with_context(|| format!("open directory {}", dir.display()))?;
    handle
        .sync_all()
        .with_context(|| format!("fsync directory {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_without_leaving_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");

        write_atomic(&path, b"first\n").expect("first write");
        write_atomic(&path, b"second\n").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn temp_path_keeps_original_extension() {
        let tmp = temp_path(Path::new("/x/campaign.plan.json"));
        assert_eq!(tmp, PathBuf::from("/x/campaign.plan.json.tmp"));
    }
}
