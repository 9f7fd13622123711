//! Schedule records and their JSON persistence.

use std::fs;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::infra::resolver::ResolveError;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Schedule not found: {0}")]
    NotFound(String),
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
    #[error("Invalid cron expression: {0}")]
    Cron(#[from] super::cron::CronParseError),
    #[error("Run log not found for schedule {schedule_id} at {timestamp}")]
    RunLogNotFound {
        schedule_id: String,
        timestamp: String,
    },
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("Schedule persistence failed ({operation}): {source}")]
    Persist {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub timestamp: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub cwd: String,
    pub preset_label: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_run: Option<LastRun>,
}

pub fn generate_schedule_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Atomic whole-array persistence of the schedule set.
#[derive(Debug)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Vec<Schedule> {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(schedules) => schedules,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "Schedules file corrupted, starting with empty set"
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn save(&self, schedules: &[Schedule]) -> Result<(), ScheduleError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ScheduleError::Persist {
                operation: "create_dir",
                source,
            })?;
        }

        let payload =
            serde_json::to_vec_pretty(schedules).map_err(|err| ScheduleError::Persist {
                operation: "encode",
                source: std::io::Error::other(err),
            })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(|source| ScheduleError::Persist {
            operation: "write_temp",
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| ScheduleError::Persist {
            operation: "rename",
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schedule {
        Schedule {
            id: "ab12cd34".to_string(),
            name: "nightly".to_string(),
            prompt: "summarize today".to_string(),
            cwd: "/repo".to_string(),
            preset_label: "Daily (evening)".to_string(),
            cron_expression: "0 17 * * *".to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
        }
    }

    #[test]
    fn generated_ids_are_eight_hex_chars() {
        let id = generate_schedule_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let mut schedule = sample();
        schedule.last_run = Some(LastRun {
            timestamp: "2026-08-02T15-00-00Z".to_string(),
            exit_code: 0,
            duration_ms: 1234,
        });
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(value["presetLabel"], "Daily (evening)");
        assert_eq!(value["cronExpression"], "0 17 * * *");
        assert_eq!(value["lastRun"]["exitCode"], 0);
        assert_eq!(value["lastRun"]["durationMs"], 1234);
    }

    #[test]
    fn round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(tmp.path().join("schedules.json"));

        let schedules = vec![sample()];
        store.save(&schedules).unwrap();
        assert_eq!(store.load(), schedules);
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(tmp.path().join("schedules.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupted_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("schedules.json");
        fs::write(&path, "[{broken").unwrap();
        let store = ScheduleStore::new(path);
        assert!(store.load().is_empty());
    }
}
