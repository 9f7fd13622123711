//! Locates the target CLI binary.
//!
//! Resolution order: explicit env override, then a PATH lookup, then a
//! fixed list of well-known install locations. A configured override that
//! points at a missing file is a hard failure rather than a silent
//! fall-through.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use super::paths::home_dir;

pub const DEFAULT_BINARY_NAME: &str = "claude";

/// The CLI this server drives. The name flows into env-var names, process
/// discovery and activity probing.
#[derive(Debug, Clone)]
pub struct TargetCli {
    name: String,
}

impl Default for TargetCli {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY_NAME)
    }
}

impl TargetCli {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `CLAUDE_PATH` for the default target.
    pub fn path_env(&self) -> String {
        format!("{}_PATH", self.name.to_uppercase())
    }

    /// `CLAUDE_REMOTE_TOKEN` for the default target.
    pub fn token_env(&self) -> String {
        format!("{}_REMOTE_TOKEN", self.name.to_uppercase())
    }

    /// The CLI's own state directory in the user's home (`~/.claude`).
    pub fn state_dir(&self) -> PathBuf {
        home_dir().join(format!(".{}", self.name))
    }

    pub fn resolve(&self) -> Result<PathBuf, ResolveError> {
        if let Ok(override_path) = std::env::var(self.path_env()) {
            let trimmed = override_path.trim();
            if !trimmed.is_empty() {
                let path = PathBuf::from(trimmed);
                if path.is_file() {
                    return Ok(path);
                }
                return Err(ResolveError::OverrideMissing {
                    var: self.path_env(),
                    path: trimmed.to_string(),
                });
            }
        }

        if let Some(found) = search_path(&self.name) {
            return Ok(found);
        }

        for candidate in self.fallback_locations() {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(ResolveError::NotFound {
            name: self.name.clone(),
            var: self.path_env(),
        })
    }

    fn fallback_locations(&self) -> Vec<PathBuf> {
        vec![
            home_dir().join(".local/bin").join(&self.name),
            PathBuf::from("/usr/local/bin").join(&self.name),
            PathBuf::from("/opt/homebrew/bin").join(&self.name),
            PathBuf::from("/usr/bin").join(&self.name),
        ]
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{var} is set to '{path}' but no such file exists")]
    OverrideMissing { var: String, path: String },
    #[error(
        "Could not find '{name}' on PATH or in the usual install locations. \
         Install it or set {var} to its full path."
    )]
    NotFound { name: String, var: String },
}
