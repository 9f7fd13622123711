//! On-disk run logs: `runs/<scheduleId>/<safeTimestamp>.log`.
//!
//! Each file carries a human-readable header, the child's interleaved
//! stdout+stderr, and a parseable footer. The footer is the authoritative
//! record of exit code and duration.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use tracing::debug;
use tracing::warn;

use super::store::ScheduleError;

pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// ISO-8601 with `:` replaced by `-`, safe for file names.
pub fn safe_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace(':', "-")
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub schedule_id: String,
    pub timestamp: String,
    /// `None` while the run is still in flight (no footer yet).
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunLogStore {
    runs_dir: PathBuf,
}

impl RunLogStore {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    fn schedule_dir(&self, schedule_id: &str) -> PathBuf {
        self.runs_dir.join(schedule_id)
    }

    fn log_path(&self, schedule_id: &str, timestamp: &str) -> PathBuf {
        self.schedule_dir(schedule_id)
            .join(format!("{timestamp}.log"))
    }

    /// Open the log for one run and write its header.
    pub fn create(
        &self,
        schedule_id: &str,
        timestamp: &str,
        name: &str,
        prompt: &str,
        cwd: &str,
        started_at: DateTime<Utc>,
    ) -> std::io::Result<RunLogFile> {
        let dir = self.schedule_dir(schedule_id);
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(schedule_id, timestamp))?;
        writeln!(
            file,
            "# Started: {}",
            started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        writeln!(file, "# Schedule: {name}")?;
        writeln!(file, "# Prompt: {prompt}")?;
        writeln!(file, "# Cwd: {cwd}")?;
        writeln!(file, "---")?;
        Ok(RunLogFile { file })
    }

    /// Runs for one schedule, newest first. Footer-less files show up with
    /// `exit_code: None`.
    pub fn list_runs(&self, schedule_id: &str) -> Vec<RunInfo> {
        let Ok(entries) = fs::read_dir(self.schedule_dir(schedule_id)) else {
            return Vec::new();
        };

        let mut runs: Vec<RunInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().map(|e| e != "log").unwrap_or(true) {
                    return None;
                }
                let timestamp = path.file_stem()?.to_string_lossy().to_string();
                let footer = fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| parse_footer(&text));
                Some(RunInfo {
                    schedule_id: schedule_id.to_string(),
                    timestamp,
                    exit_code: footer.map(|f| f.0),
                    duration_ms: footer.map(|f| f.1),
                })
            })
            .collect();

        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        runs
    }

    pub fn read_log(&self, schedule_id: &str, timestamp: &str) -> Result<String, ScheduleError> {
        // Timestamps come off the wire; refuse anything path-like.
        if timestamp.contains('/') || timestamp.contains("..") {
            return Err(ScheduleError::RunLogNotFound {
                schedule_id: schedule_id.to_string(),
                timestamp: timestamp.to_string(),
            });
        }
        fs::read_to_string(self.log_path(schedule_id, timestamp)).map_err(|_| {
            ScheduleError::RunLogNotFound {
                schedule_id: schedule_id.to_string(),
                timestamp: timestamp.to_string(),
            }
        })
    }

    /// Remove the whole run directory for a deleted schedule.
    pub fn delete_schedule_runs(&self, schedule_id: &str) {
        let dir = self.schedule_dir(schedule_id);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %err, "Failed to remove run log directory");
            }
        }
    }

    /// Delete log files whose mtime is older than `retention`; remove
    /// per-schedule directories the sweep empties.
    pub fn cleanup(&self, retention: Duration) {
        let Ok(schedules) = fs::read_dir(&self.runs_dir) else {
            return;
        };
        let now = SystemTime::now();

        for schedule_entry in schedules.flatten() {
            let dir = schedule_entry.path();
            if !dir.is_dir() {
                continue;
            }

            let mut removed = 0usize;
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                        continue;
                    };
                    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
                    if age > retention {
                        if fs::remove_file(&path).is_ok() {
                            removed += 1;
                        }
                    }
                }
            }

            let emptied = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if emptied {
                let _ = fs::remove_dir(&dir);
            }
            if removed > 0 {
                debug!(dir = %dir.display(), removed, "Run log retention sweep");
            }
        }
    }
}

pub struct RunLogFile {
    file: File,
}

impl RunLogFile {
    /// Append raw child output in arrival order.
    pub fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk)
    }

    pub fn write_footer(
        &mut self,
        finished_at: DateTime<Utc>,
        exit_code: i32,
        duration_ms: u64,
    ) -> std::io::Result<()> {
        writeln!(self.file, "\n---")?;
        writeln!(
            self.file,
            "# Finished: {}",
            finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        writeln!(self.file, "# Exit code: {exit_code}")?;
        writeln!(self.file, "# Duration: {duration_ms}ms")?;
        self.file.flush()
    }
}

/// Parse `(exit_code, duration_ms)` out of a run log footer.
pub fn parse_footer(text: &str) -> Option<(i32, u64)> {
    let mut exit_code = None;
    let mut duration_ms = None;
    // The footer is at the tail; scanning backwards keeps this robust
    // against bodies that themselves contain `# Exit code:` lines.
    for line in text.lines().rev().take(8) {
        if let Some(rest) = line.strip_prefix("# Exit code: ") {
            exit_code = rest.trim().parse::<i32>().ok();
        } else if let Some(rest) = line.strip_prefix("# Duration: ") {
            duration_ms = rest.trim().strip_suffix("ms")?.parse::<u64>().ok();
        }
        if exit_code.is_some() && duration_ms.is_some() {
            break;
        }
    }
    Some((exit_code?, duration_ms?))
}
