//! Attachment staging: a dedicated directory per task under the OS temp
//! root, written before spawn and removed on terminal transition.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

/// Staging directory for one task's attachments.
pub fn task_dir(task_id: &str) -> PathBuf {
    std::env::temp_dir()
        .join("taskbridge")
        .join(sanitize_component(task_id))
}

/// Write one attachment into the task's staging directory and return the
/// worker-local path.
pub fn stage_file(task_id: &str, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let dir = task_dir(task_id);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create staging dir {}", dir.display()))?;
    let path = dir.join(sanitize_component(file_name));
    std::fs::write(&path, bytes)
        .with_context(|| format!("Failed to write attachment {}", path.display()))?;
    Ok(path)
}

/// Remove the task's staging directory, success or not.
pub fn cleanup(task_id: &str) {
    let dir = task_dir(task_id);
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!("Failed to remove staging dir {}: {}", dir.display(), e);
        }
    }
}

/// Collapse anything that could escape the staging directory into a flat
/// file-name component.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}
