//! Per-install paths and home-directory expansion.

use std::path::PathBuf;

pub const DOT_DIR: &str = ".agent-remote";

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// `~/.agent-remote`
pub fn dot_dir() -> PathBuf {
    home_dir().join(DOT_DIR)
}

/// Expand a leading `~` or `~/` against `$HOME`. The child process inherits
/// no shell, so this must happen before any user-supplied path reaches
/// spawn.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HomeGuard(Option<String>);

    impl HomeGuard {
        fn set(value: &str) -> Self {
            let prev = std::env::var("HOME").ok();
            // SAFETY: Test-only environment override.
            unsafe {
                std::env::set_var("HOME", value);
            }
            Self(prev)
        }
    }

    impl Drop for HomeGuard {
        fn drop(&mut self) {
            if let Some(home) = self.0.take() {
                // SAFETY: Test-only environment restoration.
                unsafe {
                    std::env::set_var("HOME", home);
                }
            } else {
                // SAFETY: Test-only environment cleanup.
                unsafe {
                    std::env::remove_var("HOME");
                }
            }
        }
    }

    #[test]
    fn expands_tilde_prefix() {
        let _home = HomeGuard::set("/home/u");
        assert_eq!(expand_home("~"), PathBuf::from("/home/u"));
        assert_eq!(expand_home("~/repo"), PathBuf::from("/home/u/repo"));
    }

    #[test]
    fn leaves_absolute_paths_alone() {
        let _home = HomeGuard::set("/home/u");
        assert_eq!(expand_home("/opt/x"), PathBuf::from("/opt/x"));
        assert_eq!(expand_home("relative/~x"), PathBuf::from("relative/~x"));
    }
}
