//! Activity classification from the target CLI's own on-disk state.
//!
//! The CLI writes session transcripts under
//! `~/.claude/projects/<munged cwd>/*.jsonl`; the mtimes of those files are
//! a usable proxy for whether an agent in that directory is currently
//! producing output. Advisory only: when the layout changes this degrades
//! to `unknown`, never to a wrong answer the server acts on.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use crate::domain::ActivityStatus;

use super::resolver::TargetCli;

pub const ACTIVITY_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ActivityDetector {
    projects_root: PathBuf,
    threshold: Duration,
}

impl ActivityDetector {
    pub fn new(cli: &TargetCli) -> Self {
        Self {
            projects_root: cli.state_dir().join("projects"),
            threshold: ACTIVITY_THRESHOLD,
        }
    }

    #[cfg(test)]
    fn with_root(root: PathBuf, threshold: Duration) -> Self {
        Self {
            projects_root: root,
            threshold,
        }
    }

    /// `busy` if any state file for this cwd was modified within the
    /// threshold, `idle` if files exist but are older, `unknown` when none
    /// can be found.
    pub fn status_for_cwd(&self, cwd: &Path) -> ActivityStatus {
        let dir = self.projects_root.join(munge_cwd(cwd));
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return ActivityStatus::Unknown;
        };

        let now = SystemTime::now();
        let mut saw_any = false;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            saw_any = true;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < self.threshold {
                return ActivityStatus::Busy;
            }
        }

        if saw_any {
            ActivityStatus::Idle
        } else {
            ActivityStatus::Unknown
        }
    }
}

/// `/Users/foo/bar` -> `-Users-foo-bar`, the CLI's own folder naming
/// convention for per-project state.
fn munge_cwd(cwd: &Path) -> String {
    cwd.to_string_lossy().replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn munges_paths_like_the_cli_does() {
        assert_eq!(munge_cwd(Path::new("/home/u/app")), "-home-u-app");
        assert_eq!(munge_cwd(Path::new("/")), "-");
    }

    #[test]
    fn missing_directory_is_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let detector =
            ActivityDetector::with_root(tmp.path().join("projects"), ACTIVITY_THRESHOLD);
        assert_eq!(
            detector.status_for_cwd(Path::new("/home/u/app")),
            ActivityStatus::Unknown
        );
    }

    #[test]
    fn fresh_state_file_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("-home-u-app");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("abc.jsonl"), "{}").unwrap();

        let detector = ActivityDetector::with_root(tmp.path().to_path_buf(), ACTIVITY_THRESHOLD);
        assert_eq!(
            detector.status_for_cwd(Path::new("/home/u/app")),
            ActivityStatus::Busy
        );
    }

    #[test]
    fn stale_state_file_is_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("-home-u-app");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("abc.jsonl"), "{}").unwrap();

        // A zero threshold makes even a just-written file stale.
        let detector = ActivityDetector::with_root(tmp.path().to_path_buf(), Duration::ZERO);
        assert_eq!(
            detector.status_for_cwd(Path::new("/home/u/app")),
            ActivityStatus::Idle
        );
    }

    #[test]
    fn non_jsonl_files_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("-home-u-app");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();

        let detector = ActivityDetector::with_root(tmp.path().to_path_buf(), ACTIVITY_THRESHOLD);
        assert_eq!(
            detector.status_for_cwd(Path::new("/home/u/app")),
            ActivityStatus::Unknown
        );
    }
}
