//! One managed PTY session: a child process running the target CLI, a pump
//! thread draining its output into the bounded history, and derived state
//! (activity, exit code) for the multiplexer.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use crossbeam_channel as channel;
use tracing::warn;

use crate::common::mutex_lock_or_recover;
use crate::detection::ParsedEvent;
use crate::detection::ParsedEventKind;
use crate::detection::classify_chunk;
use crate::domain::ActivityStatus;
use crate::domain::SessionId;
use crate::domain::SessionInfo;
use crate::domain::SessionStatus;
use crate::infra::terminal::PtyHandle;
use crate::infra::terminal::ReadEvent;

use super::history::HISTORY_CAP_BYTES;
use super::history::HistoryBuffer;

/// Output older than this no longer counts as activity.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(30);

/// Out-of-band notification produced by the pump when output classification
/// finds something a detached user should hear about.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    InputRequired {
        session_id: SessionId,
        cwd: PathBuf,
        event: ParsedEvent,
    },
}

pub(super) enum PumpCommand {
    Shutdown,
}

pub struct Session {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    pub created_at: DateTime<Utc>,
    pty: PtyHandle,
    history: Arc<HistoryBuffer>,
    exit_code: Arc<OnceLock<i32>>,
    notice_tx: Option<channel::Sender<SessionNotice>>,
    pty_rx: Option<channel::Receiver<ReadEvent>>,
    pump_tx: Option<channel::Sender<PumpCommand>>,
    pump_join: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("args", &self.args)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(super) fn new(
        id: SessionId,
        cwd: PathBuf,
        args: Vec<String>,
        mut pty: PtyHandle,
        notice_tx: Option<channel::Sender<SessionNotice>>,
    ) -> Self {
        let pty_rx = pty.take_read_rx();
        Self {
            id,
            cwd,
            args,
            created_at: Utc::now(),
            pty,
            history: Arc::new(HistoryBuffer::new(HISTORY_CAP_BYTES)),
            exit_code: Arc::new(OnceLock::new()),
            notice_tx,
            pty_rx,
            pump_tx: None,
            pump_join: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    pub fn is_stopped(&self) -> bool {
        self.history.is_closed()
    }

    /// Shared handle for tail loops; reads never hold the session lock.
    pub fn history(&self) -> Arc<HistoryBuffer> {
        Arc::clone(&self.history)
    }

    pub fn exit_code_handle(&self) -> Arc<OnceLock<i32>> {
        Arc::clone(&self.exit_code)
    }

    /// Forward raw bytes to the PTY master. Silently no-ops once stopped.
    pub fn write(&self, data: &[u8]) {
        if self.is_stopped() {
            return;
        }
        if let Err(err) = self.pty.write(data) {
            if !err.is_transient() {
                warn!(session_id = %self.id, error = %err, "PTY write failed");
            }
        }
    }

    /// Resize attempts after stop are swallowed, not an error.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if self.is_stopped() {
            return;
        }
        if let Err(err) = self.pty.resize(cols, rows) {
            if !err.is_transient() {
                warn!(session_id = %self.id, error = %err, "PTY resize failed");
            }
        }
    }

    /// Terminate the child and tear down the master. Idempotent; the pump
    /// observes EOF and closes the history stream.
    pub fn stop(&mut self) {
        if let Err(err) = self.pty.kill() {
            warn!(session_id = %self.id, error = %err, "PTY kill failed");
        }
    }

    pub fn activity_status(&self) -> ActivityStatus {
        if self.is_stopped() {
            return ActivityStatus::Idle;
        }
        match self.history.last_output_instant() {
            Some(instant) if instant.elapsed() < ACTIVITY_WINDOW => ActivityStatus::Busy,
            _ => ActivityStatus::Idle,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            cwd: self.cwd.to_string_lossy().to_string(),
            status: if self.is_stopped() {
                SessionStatus::Stopped
            } else {
                SessionStatus::Running
            },
            activity_status: self.activity_status(),
            created_at: self.created_at,
            pid: self.pid(),
        }
    }

    fn handle_read_event(&mut self, event: ReadEvent) -> bool {
        match event {
            ReadEvent::Data(data) => {
                let parsed = classify_chunk(&data);
                self.history.push(Bytes::from(data));
                if parsed.kind == ParsedEventKind::AskUser {
                    if let Some(tx) = self.notice_tx.as_ref() {
                        let _ = tx.send(SessionNotice::InputRequired {
                            session_id: self.id.clone(),
                            cwd: self.cwd.clone(),
                            event: parsed,
                        });
                    }
                }
                true
            }
            ReadEvent::Eof | ReadEvent::Error(_) => {
                self.reap_and_close();
                false
            }
        }
    }

    fn reap_and_close(&mut self) {
        if self.exit_code.get().is_none() {
            // EOF with a still-running child (it closed its PTY side, or
            // the read errored) would make the wait below block while the
            // session lock is held. The stream is dead either way.
            if self.pty.is_running() {
                if let Err(err) = self.pty.kill() {
                    warn!(session_id = %self.id, error = %err, "Failed to kill child after stream end");
                }
            }
            let code = self.pty.wait_exit_code();
            let _ = self.exit_code.set(code);
        }
        self.history.close();
    }

    fn take_pty_rx(&mut self) -> Option<channel::Receiver<ReadEvent>> {
        self.pty_rx.take()
    }

    pub(super) fn attach_pump(
        &mut self,
        tx: channel::Sender<PumpCommand>,
        join: thread::JoinHandle<()>,
    ) {
        self.pump_tx = Some(tx);
        self.pump_join = Some(join);
    }

    pub(super) fn shutdown_pump(&mut self) -> Option<thread::JoinHandle<()>> {
        if let Some(tx) = self.pump_tx.take() {
            let _ = tx.send(PumpCommand::Shutdown);
        }
        self.pump_join.take()
    }
}

pub(super) fn spawn_pump(
    session: Arc<Mutex<Session>>,
    thread_name: String,
) -> (channel::Sender<PumpCommand>, thread::JoinHandle<()>) {
    const PUMP_COMMAND_CHANNEL_CAPACITY: usize = 8;
    let (tx, rx) = channel::bounded(PUMP_COMMAND_CHANNEL_CAPACITY);
    let pty_rx = {
        let mut sess = mutex_lock_or_recover(&session, "session");
        sess.take_pty_rx()
    }
    .unwrap_or_else(|| {
        let (_tx, rx) = channel::bounded(1);
        rx
    });

    let join = thread::Builder::new()
        .name(thread_name)
        .spawn(move || pump_loop(session, pty_rx, rx))
        .unwrap_or_else(|err| {
            warn!(error = %err, "Failed to spawn named session pump thread");
            thread::spawn(|| {})
        });
    (tx, join)
}

fn pump_loop(
    session: Arc<Mutex<Session>>,
    pty_rx: channel::Receiver<ReadEvent>,
    rx: channel::Receiver<PumpCommand>,
) {
    loop {
        channel::select! {
            recv(rx) -> cmd => match cmd {
                Ok(PumpCommand::Shutdown) | Err(_) => {
                    let mut sess = mutex_lock_or_recover(&session, "session");
                    // Drain whatever already arrived so the history is
                    // complete before the stream closes. Callers kill the
                    // child before shutting the pump down, so the reap
                    // below cannot hang.
                    while let Ok(event) = pty_rx.try_recv() {
                        if !sess.handle_read_event(event) {
                            return;
                        }
                    }
                    sess.reap_and_close();
                    return;
                }
            },
            recv(pty_rx) -> event => match event {
                Ok(event) => {
                    let mut sess = mutex_lock_or_recover(&session, "session");
                    if !sess.handle_read_event(event) {
                        return;
                    }
                }
                Err(_) => {
                    let sess = mutex_lock_or_recover(&session, "session");
                    sess.history.close();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::generate_session_id;
    use crate::session::StreamCursor;
    use std::path::Path;
    use std::time::Instant;

    fn spawn_session(script: &str) -> (Arc<Mutex<Session>>, channel::Receiver<SessionNotice>) {
        let (notice_tx, notice_rx) = channel::unbounded();
        let args = vec!["-c".to_string(), script.to_string()];
        let pty = PtyHandle::spawn(Path::new("sh"), &args, Path::new("/tmp"), 80, 24).unwrap();
        let session = Session::new(
            generate_session_id(),
            PathBuf::from("/tmp"),
            Vec::new(),
            pty,
            Some(notice_tx),
        );
        let session = Arc::new(Mutex::new(session));
        let (tx, join) = spawn_pump(Arc::clone(&session), "test-pump".to_string());
        session.lock().unwrap().attach_pump(tx, join);
        (session, notice_rx)
    }

    fn stop_session(session: &Arc<Mutex<Session>>) {
        let join = {
            let mut sess = session.lock().unwrap();
            sess.stop();
            sess.shutdown_pump()
        };
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    #[cfg(unix)]
    #[test]
    fn pump_streams_output_into_history_and_reaps_exit() {
        let (session, _notices) = spawn_session("printf 'hi'; exit 3");
        let history = session.lock().unwrap().history();
        let exit = session.lock().unwrap().exit_code_handle();

        let mut cursor = StreamCursor::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        let mut closed = false;
        while Instant::now() < deadline && !closed {
            let read = history.read(&mut cursor, 256, Some(Duration::from_millis(20)));
            collected.extend_from_slice(&read.data);
            closed = read.closed && read.data.is_empty();
        }

        assert!(String::from_utf8_lossy(&collected).contains("hi"));
        assert_eq!(exit.get().copied(), Some(3));
        assert!(session.lock().unwrap().is_stopped());

        stop_session(&session);
    }

    #[cfg(unix)]
    #[test]
    fn stopped_session_reports_idle_and_swallows_io() {
        let (session, _notices) = spawn_session("exit 0");
        let history = session.lock().unwrap().history();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !history.is_closed() {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(history.is_closed());

        let mut sess = session.lock().unwrap();
        assert_eq!(sess.activity_status(), ActivityStatus::Idle);
        assert_eq!(sess.info().status, SessionStatus::Stopped);
        // Neither of these may error or panic after stop.
        sess.write(b"ignored");
        sess.resize(80, 24);
        drop(sess);

        stop_session(&session);
    }

    #[cfg(unix)]
    #[test]
    fn ask_user_output_produces_notice() {
        let (session, notices) =
            spawn_session("printf 'Pick one?\\n1. red\\n2. blue\\n'; sleep 2");

        let notice = notices
            .recv_timeout(Duration::from_secs(5))
            .expect("expected an input-required notice");
        let SessionNotice::InputRequired {
            session_id, event, ..
        } = notice;
        assert_eq!(session_id, session.lock().unwrap().id);
        assert_eq!(event.options.len(), 2);

        stop_session(&session);
    }

    #[cfg(unix)]
    #[test]
    fn stop_is_idempotent() {
        let (session, _notices) = spawn_session("sleep 30");
        stop_session(&session);
        let mut sess = session.lock().unwrap();
        sess.stop();
        sess.stop();
    }
}
