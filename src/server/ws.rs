//! Per-connection state machine for the full-duplex channel.
//!
//! Frames are demultiplexed by WebSocket frame type: binary frames carry
//! UTF-8 JSON control traffic, text frames carry opaque terminal bytes.
//! A client is bound to at most one session; `session:create`,
//! `session:attach` and `session:adopt` all rebind, releasing the previous
//! tail deterministically before any frame of the new binding is queued.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::common::mutex_lock_or_recover;
use crate::domain::SessionId;
use crate::infra::paths::home_dir;
use crate::session::HistoryBuffer;
use crate::session::Session;
use crate::session::StreamCursor;

use super::AppState;
use super::broadcast::ClientHandle;
use super::broadcast::Outbound;
use super::protocol::ClientCommand;
use super::protocol::ServerEvent;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const TAIL_READ_TIMEOUT: Duration = Duration::from_millis(200);
const TAIL_MAX_CHUNK: usize = 64 * 1024;

pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);
    let (kill_tx, mut kill_rx) = watch::channel(false);
    let handle = ClientHandle::new(out_tx, Arc::new(kill_tx));
    let mut client = ClientState::new(handle);

    loop {
        tokio::select! {
            _ = kill_rx.changed() => {
                debug!("Connection killed (slow consumer or server-side close)");
                break;
            }
            maybe = out_rx.recv() => {
                let Some(frame) = maybe else { break };
                let message = match frame {
                    Outbound::Event(json) => Message::Binary(json.into_bytes()),
                    Outbound::Data(text) => Message::Text(text),
                };
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(payload))) => {
                        client.handle_control(&state, &payload).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        client.handle_terminal_input(&state, text.as_bytes());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    client.teardown(&state).await;
}

struct Attachment {
    session_id: SessionId,
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

struct ClientState {
    handle: ClientHandle,
    authenticated: bool,
    broadcaster_id: Option<u64>,
    attachment: Option<Attachment>,
}

impl ClientState {
    fn new(handle: ClientHandle) -> Self {
        Self {
            handle,
            authenticated: false,
            broadcaster_id: None,
            attachment: None,
        }
    }

    /// Raw terminal bytes from the client. Dropped silently before auth or
    /// without an attached session.
    fn handle_terminal_input(&self, state: &Arc<AppState>, bytes: &[u8]) {
        if !self.authenticated {
            return;
        }
        let Some(attachment) = self.attachment.as_ref() else {
            return;
        };
        if let Ok(session) = state.manager.get(attachment.session_id.as_str()) {
            mutex_lock_or_recover(&session, "session").write(bytes);
        }
    }

    async fn handle_control(&mut self, state: &Arc<AppState>, payload: &[u8]) {
        let command: ClientCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(err) => {
                let message = if err.to_string().contains("unknown variant") {
                    format!("Unknown command: {err}")
                } else {
                    format!("Invalid command: {err}")
                };
                self.handle.send_event(&ServerEvent::error(message));
                return;
            }
        };

        if !self.authenticated && !matches!(command, ClientCommand::Auth { .. }) {
            self.handle
                .send_event(&ServerEvent::error("Not authenticated"));
            return;
        }

        match command {
            ClientCommand::Auth { token } => self.handle_auth(state, &token),
            ClientCommand::PreferencesSet { preferences } => {
                match state.prefs.set(preferences) {
                    Ok(preferences) => {
                        self.handle
                            .send_event(&ServerEvent::PreferencesUpdated { preferences });
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to persist preferences");
                        self.handle
                            .send_event(&ServerEvent::error("Failed to save preferences"));
                    }
                }
            }
            ClientCommand::SessionList => {
                let sessions = state.manager.list();
                self.handle
                    .send_event(&ServerEvent::SessionList { sessions });
            }
            ClientCommand::SessionDiscover => {
                let manager = Arc::clone(&state.manager);
                let sessions = tokio::task::spawn_blocking(move || manager.discover_external())
                    .await
                    .unwrap_or_default();
                self.handle
                    .send_event(&ServerEvent::SessionDiscovered { sessions });
            }
            ClientCommand::SessionCreate { cwd } => {
                let cwd = cwd.unwrap_or_else(|| home_dir().to_string_lossy().to_string());
                self.create_and_bind(state, cwd, Vec::new(), false).await;
            }
            ClientCommand::SessionAdopt { pid, cwd } => {
                if cwd.is_empty() {
                    self.handle
                        .send_event(&ServerEvent::error("session:adopt requires pid and cwd"));
                    return;
                }
                self.adopt_and_bind(state, pid, cwd).await;
            }
            ClientCommand::SessionAttach {
                session_id,
                has_cache,
            } => {
                self.attach(state, &session_id, has_cache).await;
            }
            ClientCommand::SessionDestroy { session_id } => {
                if self
                    .attachment
                    .as_ref()
                    .is_some_and(|a| a.session_id.as_str() == session_id)
                {
                    self.detach().await;
                }
                let manager = Arc::clone(&state.manager);
                let id = session_id.clone();
                let _ = tokio::task::spawn_blocking(move || manager.destroy(&id)).await;
                state
                    .broadcaster
                    .broadcast(&ServerEvent::SessionDestroyed { session_id });
            }
            ClientCommand::Resize { cols, rows } => {
                // Resizes against a stopped or missing session are
                // swallowed, not an error.
                if let Some(attachment) = self.attachment.as_ref() {
                    if let Ok(session) = state.manager.get(attachment.session_id.as_str()) {
                        mutex_lock_or_recover(&session, "session").resize(cols, rows);
                    }
                }
            }
            ClientCommand::ImageUpload {
                data,
                mime_type,
                filename,
            } => {
                self.handle_image_upload(state, data, mime_type, filename)
                    .await;
            }
            ClientCommand::ScheduleCreate {
                name,
                prompt,
                cwd,
                preset,
            } => match state.scheduler.create(&name, &prompt, &cwd, &preset) {
                Ok(schedule) => state.broadcaster.broadcast(&ServerEvent::ScheduleUpdated {
                    schedule: Some(schedule),
                    deleted: None,
                }),
                Err(err) => {
                    self.handle.send_event(&ServerEvent::error(err.to_string()));
                }
            },
            ClientCommand::ScheduleUpdate {
                schedule_id,
                enabled,
            } => match state.scheduler.update(&schedule_id, enabled) {
                Ok(schedule) => state.broadcaster.broadcast(&ServerEvent::ScheduleUpdated {
                    schedule: Some(schedule),
                    deleted: None,
                }),
                Err(err) => {
                    self.handle.send_event(&ServerEvent::error(err.to_string()));
                }
            },
            ClientCommand::ScheduleDelete { schedule_id } => {
                match state.scheduler.delete(&schedule_id) {
                    Ok(()) => state.broadcaster.broadcast(&ServerEvent::ScheduleUpdated {
                        schedule: None,
                        deleted: Some(schedule_id),
                    }),
                    Err(err) => {
                        self.handle.send_event(&ServerEvent::error(err.to_string()));
                    }
                }
            }
            ClientCommand::ScheduleTrigger { schedule_id } => {
                match state.scheduler.trigger(&schedule_id) {
                    Ok(()) => {
                        self.handle
                            .send_event(&ServerEvent::ScheduleTriggered { schedule_id });
                    }
                    Err(err) => {
                        self.handle.send_event(&ServerEvent::error(err.to_string()));
                    }
                }
            }
            ClientCommand::ScheduleRuns { schedule_id } => {
                match state.scheduler.list_runs(&schedule_id) {
                    Ok(runs) => {
                        self.handle
                            .send_event(&ServerEvent::ScheduleRuns { schedule_id, runs });
                    }
                    Err(err) => {
                        self.handle.send_event(&ServerEvent::error(err.to_string()));
                    }
                }
            }
            ClientCommand::ScheduleLog {
                schedule_id,
                timestamp,
            } => match state.scheduler.run_log(&schedule_id, &timestamp) {
                Ok(content) => {
                    self.handle.send_event(&ServerEvent::ScheduleLog {
                        schedule_id,
                        timestamp,
                        content,
                    });
                }
                Err(err) => {
                    self.handle.send_event(&ServerEvent::error(err.to_string()));
                }
            },
            ClientCommand::ScheduleList => {
                let schedules = state.scheduler.list();
                self.handle
                    .send_event(&ServerEvent::ScheduleList { schedules });
            }
        }
    }

    fn handle_auth(&mut self, state: &Arc<AppState>, token: &str) {
        if !state.auth.verify(token) {
            self.handle.send_event(&ServerEvent::AuthFailed {
                error: "Invalid token".to_string(),
            });
            return;
        }
        self.authenticated = true;
        if self.broadcaster_id.is_none() {
            self.broadcaster_id = Some(state.broadcaster.register(self.handle.clone()));
        }
        self.handle.send_event(&ServerEvent::AuthSuccess {
            preferences: state.prefs.get(),
        });
    }

    async fn create_and_bind(
        &mut self,
        state: &Arc<AppState>,
        cwd: String,
        args: Vec<String>,
        is_adopted: bool,
    ) {
        let manager = Arc::clone(&state.manager);
        let result = tokio::task::spawn_blocking(move || manager.create(&cwd, args)).await;
        match result {
            Ok(Ok(session)) => {
                self.detach().await;
                let info = mutex_lock_or_recover(&session, "session").info();
                self.handle.send_event(&ServerEvent::SessionCreated {
                    session: info,
                    is_adopted: if is_adopted { Some(true) } else { None },
                });
                self.bind_tail(&session, true);
            }
            Ok(Err(err)) => {
                self.handle.send_event(&ServerEvent::error(err.to_string()));
            }
            Err(err) => {
                warn!(error = %err, "Session create task failed");
                self.handle
                    .send_event(&ServerEvent::error("Session create failed"));
            }
        }
    }

    async fn adopt_and_bind(&mut self, state: &Arc<AppState>, pid: u32, cwd: String) {
        let manager = Arc::clone(&state.manager);
        let result = tokio::task::spawn_blocking(move || manager.adopt(pid, &cwd)).await;
        match result {
            Ok(Ok(session)) => {
                self.detach().await;
                let info = mutex_lock_or_recover(&session, "session").info();
                self.handle.send_event(&ServerEvent::SessionCreated {
                    session: info,
                    is_adopted: Some(true),
                });
                self.bind_tail(&session, true);
            }
            Ok(Err(err)) => {
                self.handle.send_event(&ServerEvent::error(err.to_string()));
            }
            Err(err) => {
                warn!(error = %err, "Session adopt task failed");
                self.handle
                    .send_event(&ServerEvent::error("Session adopt failed"));
            }
        }
    }

    async fn attach(&mut self, state: &Arc<AppState>, session_id: &str, has_cache: bool) {
        let session = match state.manager.get(session_id) {
            Ok(session) => session,
            Err(err) => {
                self.handle.send_event(&ServerEvent::error(err.to_string()));
                return;
            }
        };

        // The previous tail must be fully stopped before any frame of the
        // new binding is queued, or stale bytes could interleave.
        self.detach().await;

        let info = mutex_lock_or_recover(&session, "session").info();
        self.handle
            .send_event(&ServerEvent::SessionAttached { session: info });
        self.bind_tail(&session, !has_cache);
    }

    /// Spawn the tail thread copying session output into this client's
    /// queue. With `replay`, the bounded history is sent first as one text
    /// frame; `session:exit` follows the last observed byte, at most once.
    fn bind_tail(&mut self, session: &Arc<std::sync::Mutex<Session>>, replay: bool) {
        let (session_id, history, exit_code) = {
            let sess = mutex_lock_or_recover(session, "session");
            (sess.id.clone(), sess.history(), sess.exit_code_handle())
        };

        let stop = Arc::new(AtomicBool::new(false));
        let handle = self.handle.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_id = session_id.clone();

        let join = thread::Builder::new()
            .name(format!("tail-{}", session_id.as_str()))
            .spawn(move || tail_loop(thread_id, history, exit_code, handle, thread_stop, replay))
            .ok();

        self.attachment = Some(Attachment {
            session_id,
            stop,
            join,
        });
    }

    async fn detach(&mut self) {
        let Some(mut attachment) = self.attachment.take() else {
            return;
        };
        attachment.stop.store(true, Ordering::SeqCst);
        if let Some(join) = attachment.join.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = join.join();
            })
            .await;
        }
    }

    async fn handle_image_upload(
        &mut self,
        state: &Arc<AppState>,
        data: String,
        mime_type: String,
        filename: Option<String>,
    ) {
        let uploads_dir = state.uploads_dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .map_err(|err| format!("Invalid image data: {err}"))?;
            let ext = extension_for(&mime_type, filename.as_deref());
            std::fs::create_dir_all(&uploads_dir)
                .map_err(|err| format!("Failed to create uploads directory: {err}"))?;
            let name = format!("{}.{ext}", uuid::Uuid::new_v4().simple());
            let path = uploads_dir.join(name);
            std::fs::write(&path, bytes).map_err(|err| format!("Failed to write image: {err}"))?;
            Ok::<String, String>(path.to_string_lossy().to_string())
        })
        .await;

        match result {
            Ok(Ok(path)) => {
                self.handle.send_event(&ServerEvent::ImageUploaded { path });
            }
            Ok(Err(message)) => {
                self.handle.send_event(&ServerEvent::error(message));
            }
            Err(err) => {
                warn!(error = %err, "Image upload task failed");
                self.handle
                    .send_event(&ServerEvent::error("Image upload failed"));
            }
        }
    }

    /// Unconditional cleanup on connection close: the tail and the
    /// broadcast registration are both released.
    async fn teardown(&mut self, state: &Arc<AppState>) {
        self.detach().await;
        if let Some(id) = self.broadcaster_id.take() {
            state.broadcaster.unregister(id);
        }
    }
}

fn extension_for(mime_type: &str, filename: Option<&str>) -> String {
    match mime_type {
        "image/png" => "png".to_string(),
        "image/jpeg" | "image/jpg" => "jpg".to_string(),
        "image/gif" => "gif".to_string(),
        "image/webp" => "webp".to_string(),
        "image/svg+xml" => "svg".to_string(),
        _ => filename
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_string()))
            .unwrap_or_else(|| "bin".to_string()),
    }
}

fn tail_loop(
    session_id: SessionId,
    history: Arc<HistoryBuffer>,
    exit_code: Arc<std::sync::OnceLock<i32>>,
    handle: ClientHandle,
    stop: Arc<AtomicBool>,
    replay: bool,
) {
    let mut carry: Vec<u8> = Vec::new();
    let mut cursor: StreamCursor;

    if replay {
        let (data, continue_from) = history.snapshot();
        cursor = continue_from;
        if !data.is_empty() {
            let text = utf8_frame(&mut carry, data);
            if !text.is_empty() && !handle.send(Outbound::Data(text)) {
                return;
            }
        }
    } else {
        cursor = history.latest_cursor();
    }

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let read = history.read(&mut cursor, TAIL_MAX_CHUNK, Some(TAIL_READ_TIMEOUT));
        // Never emit a frame read after detach was requested.
        if stop.load(Ordering::SeqCst) {
            return;
        }

        if !read.data.is_empty() {
            let text = utf8_frame(&mut carry, read.data);
            if !text.is_empty() && !handle.send(Outbound::Data(text)) {
                return;
            }
        }

        if read.closed && history.latest_cursor() == cursor {
            if !carry.is_empty() {
                let text = String::from_utf8_lossy(&carry).into_owned();
                if !handle.send(Outbound::Data(text)) {
                    return;
                }
            }
            let exit_code = exit_code.get().copied().unwrap_or(-1);
            handle.send_event(&ServerEvent::SessionExit {
                session_id,
                exit_code,
            });
            return;
        }
    }
}

/// Assemble a text frame from raw PTY bytes, holding back a trailing
/// incomplete UTF-8 sequence for the next frame so multi-byte characters
/// split across reads survive the text framing.
fn utf8_frame(carry: &mut Vec<u8>, chunk: Vec<u8>) -> String {
    let mut bytes = mem::take(carry);
    bytes.extend_from_slice(&chunk);

    match std::str::from_utf8(&bytes) {
        Ok(text) => text.to_string(),
        Err(err) => {
            let valid_up_to = err.valid_up_to();
            if err.error_len().is_none() {
                // Unexpected end of input: an incomplete sequence at the
                // tail. Carry it into the next frame.
                *carry = bytes[valid_up_to..].to_vec();
                String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned()
            } else {
                // Genuinely invalid bytes (e.g. replay starting
                // mid-sequence): terminal renderers resynchronize.
                String::from_utf8_lossy(&bytes).into_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_frame_passes_whole_strings_through() {
        let mut carry = Vec::new();
        assert_eq!(utf8_frame(&mut carry, b"hello".to_vec()), "hello");
        assert!(carry.is_empty());
    }

    #[test]
    fn utf8_frame_carries_split_multibyte_sequences() {
        // "é" is 0xC3 0xA9; split it across two chunks.
        let mut carry = Vec::new();
        let first = utf8_frame(&mut carry, vec![b'a', 0xC3]);
        assert_eq!(first, "a");
        assert_eq!(carry, vec![0xC3]);

        let second = utf8_frame(&mut carry, vec![0xA9, b'b']);
        assert_eq!(second, "éb");
        assert!(carry.is_empty());
    }

    #[test]
    fn utf8_frame_replaces_truly_invalid_bytes() {
        let mut carry = Vec::new();
        // 0xA9 alone is an invalid continuation byte mid-stream.
        let out = utf8_frame(&mut carry, vec![0xA9, b'x']);
        assert!(out.contains('x'));
        assert!(carry.is_empty());
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(extension_for("image/png", None), "png");
        assert_eq!(extension_for("image/jpeg", None), "jpg");
        assert_eq!(
            extension_for("application/octet-stream", Some("shot.webp")),
            "webp"
        );
        assert_eq!(extension_for("application/octet-stream", None), "bin");
    }

    #[test]
    fn tail_replays_history_then_exit_event() {
        let history = Arc::new(HistoryBuffer::new(1024));
        history.push(bytes::Bytes::from_static(b"scrollback"));
        history.close();
        let exit_code = Arc::new(std::sync::OnceLock::new());
        exit_code.set(0).unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (kill_tx, _kill_rx) = watch::channel(false);
        let handle = ClientHandle::new(out_tx, Arc::new(kill_tx));
        let stop = Arc::new(AtomicBool::new(false));

        tail_loop(
            SessionId::new("a1b2c3d4"),
            history,
            exit_code,
            handle,
            stop,
            true,
        );

        let first = out_rx.try_recv().unwrap();
        match first {
            Outbound::Data(text) => assert_eq!(text, "scrollback"),
            other => panic!("expected replay data, got {other:?}"),
        }
        let second = out_rx.try_recv().unwrap();
        match second {
            Outbound::Event(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "session:exit");
                assert_eq!(value["exitCode"], 0);
            }
            other => panic!("expected exit event, got {other:?}"),
        }
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn tail_with_cache_skips_replay() {
        let history = Arc::new(HistoryBuffer::new(1024));
        history.push(bytes::Bytes::from_static(b"scrollback"));
        history.close();
        let exit_code = Arc::new(std::sync::OnceLock::new());
        exit_code.set(7).unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (kill_tx, _kill_rx) = watch::channel(false);
        let handle = ClientHandle::new(out_tx, Arc::new(kill_tx));

        tail_loop(
            SessionId::new("a1b2c3d4"),
            history,
            exit_code,
            handle,
            Arc::new(AtomicBool::new(false)),
            false,
        );

        // No replay frame; only the exit event.
        match out_rx.try_recv().unwrap() {
            Outbound::Event(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["type"], "session:exit");
                assert_eq!(value["exitCode"], 7);
            }
            other => panic!("expected exit event, got {other:?}"),
        }
    }

    #[test]
    fn stopped_tail_emits_nothing_further() {
        let history = Arc::new(HistoryBuffer::new(1024));
        history.push(bytes::Bytes::from_static(b"data"));
        let exit_code = Arc::new(std::sync::OnceLock::new());

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (kill_tx, _kill_rx) = watch::channel(false);
        let handle = ClientHandle::new(out_tx, Arc::new(kill_tx));
        let stop = Arc::new(AtomicBool::new(true));

        tail_loop(
            SessionId::new("a1b2c3d4"),
            history,
            exit_code,
            handle,
            stop,
            false,
        );
        assert!(out_rx.try_recv().is_err());
    }
}
