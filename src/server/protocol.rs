//! Wire shapes for the binary (JSON) control channel.
//!
//! Every control frame is a JSON object with a required string `type`
//! field; text frames are opaque terminal bytes and never appear here.

use serde::Deserialize;
use serde::Serialize;

use crate::domain::ExternalSession;
use crate::domain::SessionId;
use crate::domain::SessionInfo;
use crate::infra::prefs::Preferences;
use crate::scheduler::RunInfo;
use crate::scheduler::Schedule;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "preferences:set")]
    PreferencesSet { preferences: Preferences },

    #[serde(rename = "session:list")]
    SessionList,

    #[serde(rename = "session:discover")]
    SessionDiscover,

    #[serde(rename = "session:create")]
    SessionCreate { cwd: Option<String> },

    #[serde(rename = "session:attach", rename_all = "camelCase")]
    SessionAttach {
        session_id: String,
        #[serde(default)]
        has_cache: bool,
    },

    #[serde(rename = "session:adopt")]
    SessionAdopt { pid: u32, cwd: String },

    #[serde(rename = "session:destroy", rename_all = "camelCase")]
    SessionDestroy { session_id: String },

    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },

    #[serde(rename = "image:upload", rename_all = "camelCase")]
    ImageUpload {
        data: String,
        mime_type: String,
        #[serde(default)]
        filename: Option<String>,
    },

    #[serde(rename = "schedule:create")]
    ScheduleCreate {
        name: String,
        prompt: String,
        cwd: String,
        preset: String,
    },

    #[serde(rename = "schedule:update", rename_all = "camelCase")]
    ScheduleUpdate {
        schedule_id: String,
        #[serde(default)]
        enabled: Option<bool>,
    },

    #[serde(rename = "schedule:delete", rename_all = "camelCase")]
    ScheduleDelete { schedule_id: String },

    #[serde(rename = "schedule:trigger", rename_all = "camelCase")]
    ScheduleTrigger { schedule_id: String },

    #[serde(rename = "schedule:runs", rename_all = "camelCase")]
    ScheduleRuns { schedule_id: String },

    #[serde(rename = "schedule:log", rename_all = "camelCase")]
    ScheduleLog {
        schedule_id: String,
        timestamp: String,
    },

    #[serde(rename = "schedule:list")]
    ScheduleList,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "auth:success")]
    AuthSuccess { preferences: Preferences },

    #[serde(rename = "auth:failed")]
    AuthFailed { error: String },

    #[serde(rename = "session:list")]
    SessionList { sessions: Vec<SessionInfo> },

    #[serde(rename = "session:discovered")]
    SessionDiscovered { sessions: Vec<ExternalSession> },

    #[serde(rename = "session:created", rename_all = "camelCase")]
    SessionCreated {
        session: SessionInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_adopted: Option<bool>,
    },

    #[serde(rename = "session:attached")]
    SessionAttached { session: SessionInfo },

    #[serde(rename = "session:exit", rename_all = "camelCase")]
    SessionExit {
        session_id: SessionId,
        exit_code: i32,
    },

    #[serde(rename = "session:destroyed", rename_all = "camelCase")]
    SessionDestroyed { session_id: String },

    #[serde(rename = "session:status", rename_all = "camelCase")]
    SessionStatus {
        sessions: Vec<SessionInfo>,
        external_sessions: Vec<ExternalSession>,
    },

    #[serde(rename = "session:input_required", rename_all = "camelCase")]
    SessionInputRequired {
        session_id: SessionId,
        session_name: String,
        preview: String,
    },

    #[serde(rename = "image:uploaded")]
    ImageUploaded { path: String },

    #[serde(rename = "preferences:updated")]
    PreferencesUpdated { preferences: Preferences },

    #[serde(rename = "schedule:list")]
    ScheduleList { schedules: Vec<Schedule> },

    #[serde(rename = "schedule:updated")]
    ScheduleUpdated {
        #[serde(skip_serializing_if = "Option::is_none")]
        schedule: Option<Schedule>,
        #[serde(skip_serializing_if = "Option::is_none")]
        deleted: Option<String>,
    },

    #[serde(rename = "schedule:runs", rename_all = "camelCase")]
    ScheduleRuns {
        schedule_id: String,
        runs: Vec<RunInfo>,
    },

    #[serde(rename = "schedule:log", rename_all = "camelCase")]
    ScheduleLog {
        schedule_id: String,
        timestamp: String,
        content: String,
    },

    #[serde(rename = "schedule:triggered", rename_all = "camelCase")]
    ScheduleTriggered { schedule_id: String },

    #[serde(rename = "schedule:run_complete", rename_all = "camelCase")]
    ScheduleRunComplete {
        schedule_id: String,
        name: String,
        exit_code: i32,
        timestamp: String,
    },

    #[serde(rename = "error")]
    Error { error: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // ServerEvent contains nothing unserializable; this is a
            // last-resort frame rather than a panic in the send path.
            r#"{"type":"error","error":"internal serialization failure"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ClientCommand {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_auth_command() {
        let cmd = parse(r#"{"type":"auth","token":"abcd1234"}"#);
        assert!(matches!(cmd, ClientCommand::Auth { token } if token == "abcd1234"));
    }

    #[test]
    fn parses_attach_with_and_without_cache() {
        let cmd = parse(r#"{"type":"session:attach","sessionId":"a1b2c3d4","hasCache":true}"#);
        match cmd {
            ClientCommand::SessionAttach {
                session_id,
                has_cache,
            } => {
                assert_eq!(session_id, "a1b2c3d4");
                assert!(has_cache);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cmd = parse(r#"{"type":"session:attach","sessionId":"a1b2c3d4"}"#);
        assert!(matches!(
            cmd,
            ClientCommand::SessionAttach {
                has_cache: false,
                ..
            }
        ));
    }

    #[test]
    fn parses_adopt_and_resize() {
        let cmd = parse(r#"{"type":"session:adopt","pid":4242,"cwd":"/home/u/app"}"#);
        assert!(matches!(cmd, ClientCommand::SessionAdopt { pid: 4242, .. }));

        let cmd = parse(r#"{"type":"resize","cols":80,"rows":24}"#);
        assert!(matches!(
            cmd,
            ClientCommand::Resize { cols: 80, rows: 24 }
        ));
    }

    #[test]
    fn schedule_update_distinguishes_absent_from_false() {
        // Absent means "leave unchanged"; the scheduler only disarms on an
        // explicit false.
        let cmd = parse(r#"{"type":"schedule:update","scheduleId":"ab12cd34"}"#);
        assert!(matches!(
            cmd,
            ClientCommand::ScheduleUpdate {
                enabled: None,
                ref schedule_id,
            } if schedule_id == "ab12cd34"
        ));

        let cmd = parse(r#"{"type":"schedule:update","scheduleId":"ab12cd34","enabled":false}"#);
        assert!(matches!(
            cmd,
            ClientCommand::ScheduleUpdate {
                enabled: Some(false),
                ..
            }
        ));

        let cmd = parse(r#"{"type":"schedule:update","scheduleId":"ab12cd34","enabled":true}"#);
        assert!(matches!(
            cmd,
            ClientCommand::ScheduleUpdate {
                enabled: Some(true),
                ..
            }
        ));
    }

    #[test]
    fn parses_schedule_create() {
        let cmd = parse(
            r#"{"type":"schedule:create","name":"nightly","prompt":"summarize today","cwd":"/repo","preset":"Daily (evening)"}"#,
        );
        match cmd {
            ClientCommand::ScheduleCreate { name, preset, .. } => {
                assert_eq!(name, "nightly");
                assert_eq!(preset, "Daily (evening)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_with_unknown_variant() {
        let err = serde_json::from_str::<ClientCommand>(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn missing_type_fails() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"token":"x"}"#).is_err());
    }

    #[test]
    fn events_carry_type_tags() {
        let event = ServerEvent::AuthFailed {
            error: "Invalid token".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "auth:failed");
        assert_eq!(value["error"], "Invalid token");
    }

    #[test]
    fn exit_event_is_camel_case() {
        let event = ServerEvent::SessionExit {
            session_id: SessionId::new("a1b2c3d4"),
            exit_code: 0,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "session:exit");
        assert_eq!(value["sessionId"], "a1b2c3d4");
        assert_eq!(value["exitCode"], 0);
    }

    #[test]
    fn created_event_omits_adoption_flag_when_absent() {
        let event = ServerEvent::SessionCreated {
            session: SessionInfo {
                id: SessionId::new("a1b2c3d4"),
                cwd: "/tmp".to_string(),
                status: crate::domain::SessionStatus::Running,
                activity_status: crate::domain::ActivityStatus::Idle,
                created_at: chrono::Utc::now(),
                pid: Some(1),
            },
            is_adopted: None,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert!(value.get("isAdopted").is_none());

        let event = ServerEvent::SessionCreated {
            session: SessionInfo {
                id: SessionId::new("a1b2c3d4"),
                cwd: "/tmp".to_string(),
                status: crate::domain::SessionStatus::Running,
                activity_status: crate::domain::ActivityStatus::Idle,
                created_at: chrono::Utc::now(),
                pid: Some(1),
            },
            is_adopted: Some(true),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["isAdopted"], true);
    }

    #[test]
    fn schedule_updated_deletion_shape() {
        let event = ServerEvent::ScheduleUpdated {
            schedule: None,
            deleted: Some("ab12cd34".to_string()),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "schedule:updated");
        assert_eq!(value["deleted"], "ab12cd34");
        assert!(value.get("schedule").is_none());
    }
}
