//! Atomic file writes shared by the snapshot and metadata stores.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Writes `data` to `path` so that readers see either the old file or the
/// complete new one.
///
/// The bytes go to a uniquely named sibling file which is synced and then
/// renamed over the target. The temp file is removed if any step fails.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = temp_path_for(path);

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Like [`write_atomic`], but fails with `ErrorKind::AlreadyExists` instead
/// of replacing an existing file.
///
/// The complete temp file is hard-linked into place, which refuses to
/// clobber the target, so two concurrent writers cannot both succeed.
pub async fn write_atomic_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = temp_path_for(path);

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::hard_link(&tmp_path, path).await
    }
    .await;

    let _ = fs::remove_file(&tmp_path).await;
    result
}

/// Returns true for the sibling files created by [`write_atomic`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp"))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}
