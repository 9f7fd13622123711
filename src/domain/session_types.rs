//! Core session types shared across the engine and the wire protocol.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Short opaque session identifier, unique within the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub fn generate_session_id() -> SessionId {
    SessionId::new(Uuid::new_v4().to_string()[..8].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// Coarse classification derived from output recency or external state
/// files. Advisory only; feeds the UI indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Busy,
    Idle,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub cwd: String,
    pub status: SessionStatus,
    pub activity_status: ActivityStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// A foreign running instance of the target CLI, discovered via the OS
/// process table. A snapshot only; nothing here is owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSession {
    pub pid: u32,
    pub cwd: String,
    pub command: String,
    pub args: Vec<String>,
    pub activity_status: ActivityStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn session_info_serializes_camel_case() {
        let info = SessionInfo {
            id: SessionId::new("a1b2c3d4"),
            cwd: "/tmp".to_string(),
            status: SessionStatus::Running,
            activity_status: ActivityStatus::Idle,
            created_at: Utc::now(),
            pid: Some(42),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["id"], "a1b2c3d4");
        assert_eq!(value["status"], "running");
        assert_eq!(value["activityStatus"], "idle");
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn absent_pid_is_omitted() {
        let info = SessionInfo {
            id: SessionId::new("deadbeef"),
            cwd: "/tmp".to_string(),
            status: SessionStatus::Stopped,
            activity_status: ActivityStatus::Idle,
            created_at: Utc::now(),
            pid: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("pid").is_none());
    }
}
