use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::protocol::FileDescriptor;

/// Walks `root` and queues every regular file beneath it, in directory
/// listing order. Unreadable directories are logged and skipped.
///
/// Symlinks to regular files are queued with the target's size. Links to
/// directories are not descended into, and dangling links are skipped.
pub fn enumerate(root: &Path, connection_id: Uuid) -> VecDeque<FileDescriptor> {
    let mut files = VecDeque::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                warn!("Skipping unreadable entry {}: {}", path, e);
                continue;
            }
        };
        let file_type = entry.file_type();
        let size = if file_type.is_file() {
            match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            }
        } else if file_type.is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => {
                    debug!("Skipping symlink {:?}: target is not a regular file", entry.path());
                    continue;
                }
                Err(e) => {
                    debug!("Skipping symlink {:?}: {}", entry.path(), e);
                    continue;
                }
            }
        } else {
            continue;
        };

        let relative_path = match entry.path().parent().and_then(|p| p.strip_prefix(root).ok()) {
            Some(dir) => dir
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            None => {
                warn!("Skipping {:?}: not under {:?}", entry.path(), root);
                continue;
            }
        };

        let file = FileDescriptor {
            id: Uuid::new_v4(),
            connection_id,
            name: entry.file_name().to_string_lossy().into_owned(),
            relative_path,
            size,
        };
        debug!("Queued {} ({} bytes)", file.display_path(), file.size);
        files.push_back(file);
    }

    files
}
