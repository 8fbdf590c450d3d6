//! Discovery of candidate agent sockets under the agents directory.
//!
//! sshd creates one `ssh-XXXXXXXX` directory per session with forwarding
//! enabled and places an `agent.<pid>` socket inside it. The root is usually a
//! shared temp directory, so anything that does not look exactly like that is
//! skipped quietly.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::DiscoveryConfig;

/// Find candidate backend sockets under `root`, in a stable order.
///
/// Never fails: unreadable roots, foreign or empty directories, and entries
/// that are not sockets are logged and skipped.
pub fn scan(root: &Path, rules: &DiscoveryConfig) -> Vec<PathBuf> {
    let our_uid = current_uid();
    let mut candidates = Vec::new();

    for dir in sorted_entries(root) {
        let Some(name) = file_name(&dir) else {
            continue;
        };
        if !name.starts_with(&rules.dir_prefix) {
            continue;
        }

        let metadata = match fs::metadata(&dir) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Ignoring entry: stat failed");
                continue;
            }
        };
        if !metadata.is_dir() {
            debug!(path = %dir.display(), "Ignoring entry: not a directory");
            continue;
        }
        if rules.require_same_owner && metadata.uid() != our_uid {
            debug!(
                path = %dir.display(),
                owner = metadata.uid(),
                uid = our_uid,
                "Ignoring directory: owned by another user"
            );
            continue;
        }

        let before = candidates.len();
        candidates.extend(sockets_in(&dir, rules));
        if candidates.len() == before {
            debug!(path = %dir.display(), "Ignoring directory: no agent socket");
        }
    }

    candidates
}

fn sockets_in(dir: &Path, rules: &DiscoveryConfig) -> Vec<PathBuf> {
    sorted_entries(dir)
        .into_iter()
        .filter(|path| {
            let Some(name) = file_name(path) else {
                return false;
            };
            if !name.starts_with(&rules.socket_prefix) {
                debug!(path = %path.display(), "Ignoring entry: name does not match");
                return false;
            }
            match fs::metadata(path) {
                Ok(metadata) if metadata.file_type().is_socket() => true,
                Ok(_) => {
                    debug!(path = %path.display(), "Ignoring entry: not a socket");
                    false
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Ignoring entry: stat failed");
                    false
                }
            }
        })
        .collect()
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot read directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    paths
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}
