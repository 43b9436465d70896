//! Shared utility functions

use std::path::{Path, PathBuf};

/// Expand a leading `~` component to the user's home directory.
///
/// Returns the input unchanged when there is no such component or `HOME` is
/// unset. Works on raw paths, so non-UTF-8 components survive.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Short id used to correlate log lines of one request.
pub fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_plain_paths_alone() {
        assert_eq!(expand_tilde(Path::new("/opt/models")), Path::new("/opt/models"));
        assert_eq!(expand_tilde(Path::new("models/~/x")), Path::new("models/~/x"));
        assert_eq!(expand_tilde(Path::new("~user/x")), Path::new("~user/x"));
    }

    #[test]
    fn expands_leading_tilde_component() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        assert_eq!(
            expand_tilde(Path::new("~/models")),
            PathBuf::from(&home).join("models")
        );
        assert_eq!(expand_tilde(Path::new("~")), PathBuf::from(home));
    }

    #[cfg(unix)]
    #[test]
    fn keeps_non_utf8_components() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = Path::new(OsStr::from_bytes(b"/srv/mod\xffels"));
        assert_eq!(expand_tilde(raw), raw);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, new_request_id());
    }
}
