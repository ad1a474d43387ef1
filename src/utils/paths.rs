// projectbackup/src/utils/paths.rs
use std::path::{Path, PathBuf};

/// Resolves a project path the same way for backups and restores:
/// `~` is the current user's home, `/...` is absolute, anything else is
/// relative to `base_dir`.
pub fn resolve_project_path(raw: &str, base_dir: &Path) -> PathBuf {
    resolve_with_home(raw, base_dir, dirs::home_dir().as_deref())
}

pub(crate) fn resolve_with_home(raw: &str, base_dir: &Path, home: Option<&Path>) -> PathBuf {
    let trimmed = raw.trim();
    let trimmed = if trimmed.len() > 1 {
        trimmed.trim_end_matches('/')
    } else {
        trimmed
    };

    if trimmed == "~" || trimmed.starts_with("~/") {
        match home {
            Some(home) => {
                let rest = trimmed.trim_start_matches('~').trim_start_matches('/');
                return if rest.is_empty() {
                    home.to_path_buf()
                } else {
                    home.join(rest)
                };
            }
            None => {
                tracing::warn!(path = trimmed, "home directory unknown, resolving against base directory");
                return base_dir.join(trimmed.trim_start_matches('~').trim_start_matches('/'));
            }
        }
    }

    let path = Path::new(trimmed);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
