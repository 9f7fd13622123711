//! Registry of live PTY sessions.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::common::mutex_lock_or_recover;
use crate::common::rwlock_read_or_recover;
use crate::common::rwlock_write_or_recover;
use crate::domain::ExternalSession;
use crate::domain::SessionId;
use crate::domain::SessionInfo;
use crate::domain::generate_session_id;
use crate::infra::activity::ActivityDetector;
use crate::infra::processes::ProcessDetector;
use crate::infra::processes::is_alive;
use crate::infra::resolver::ResolveError;
use crate::infra::resolver::TargetCli;
use crate::infra::terminal::PtyError;
use crate::infra::terminal::PtyHandle;

use super::session::Session;
use super::session::SessionNotice;
use super::session::spawn_pump;

pub const DEFAULT_MAX_SESSIONS: usize = 16;
const INITIAL_COLS: u16 = 120;
const INITIAL_ROWS: u16 = 40;
/// Grace period between terminating an adopted process and re-checking
/// that it is actually gone.
const ADOPT_SETTLE: Duration = Duration::from_millis(150);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session limit reached ({0})")]
    LimitReached(usize),
    #[error("Directory does not exist: {0}")]
    CwdMissing(String),
    #[error("Not a directory: {0}")]
    CwdNotDirectory(String),
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("{0}")]
    Spawn(#[from] PtyError),
    #[error("Process {0} is not running or already terminated")]
    NotDiscovered(u32),
    #[error("Failed to terminate process {0}")]
    TerminationRefused(u32),
}

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    cli: TargetCli,
    detector: ProcessDetector,
    activity: ActivityDetector,
    notice_tx: Option<channel::Sender<SessionNotice>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(cli: TargetCli, notice_tx: Option<channel::Sender<SessionNotice>>) -> Self {
        Self {
            detector: ProcessDetector::new(cli.clone()),
            activity: ActivityDetector::new(&cli),
            sessions: RwLock::new(HashMap::new()),
            cli,
            notice_tx,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Spawn the target CLI in `cwd` and register the session. On spawn
    /// failure nothing is registered and the error propagates to the
    /// caller.
    pub fn create(
        &self,
        cwd: &str,
        args: Vec<String>,
    ) -> Result<Arc<Mutex<Session>>, SessionError> {
        let cwd = crate::infra::paths::expand_home(cwd);
        validate_cwd(&cwd)?;

        {
            let sessions = rwlock_read_or_recover(&self.sessions, "session map");
            if sessions.len() >= self.max_sessions {
                return Err(SessionError::LimitReached(self.max_sessions));
            }
        }

        let binary = self.cli.resolve()?;
        let id = generate_session_id();
        let pty = PtyHandle::spawn(&binary, &args, &cwd, INITIAL_COLS, INITIAL_ROWS)?;

        let session = Session::new(id.clone(), cwd, args, pty, self.notice_tx.clone());
        let session = Arc::new(Mutex::new(session));

        {
            let mut sessions = rwlock_write_or_recover(&self.sessions, "session map");
            sessions.insert(id.clone(), Arc::clone(&session));
        }

        let thread_name = format!("session-pump-{}", id.as_str());
        let (pump_tx, pump_join) = spawn_pump(Arc::clone(&session), thread_name);
        {
            let mut sess = mutex_lock_or_recover(&session, "session");
            sess.attach_pump(pump_tx, pump_join);
        }

        info!(session_id = %id, "Session created");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        let sessions = rwlock_read_or_recover(&self.sessions, "session map");
        sessions
            .get(&SessionId::from(session_id))
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let session_refs: Vec<Arc<Mutex<Session>>> = {
            let sessions = rwlock_read_or_recover(&self.sessions, "session map");
            sessions.values().cloned().collect()
        };

        let mut infos: Vec<SessionInfo> = session_refs
            .iter()
            .map(|session| mutex_lock_or_recover(session, "session").info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn session_count(&self) -> usize {
        rwlock_read_or_recover(&self.sessions, "session map").len()
    }

    /// Destroy a session. Idempotent: destroying an unknown id is a no-op.
    pub fn destroy(&self, session_id: &str) {
        let session = {
            let mut sessions = rwlock_write_or_recover(&self.sessions, "session map");
            sessions.remove(&SessionId::from(session_id))
        };

        let Some(session) = session else {
            return;
        };

        let join = {
            let mut sess = mutex_lock_or_recover(&session, "session");
            sess.stop();
            sess.shutdown_pump()
        };
        if let Some(join) = join {
            let _ = join.join();
        }
        info!(session_id, "Session destroyed");
    }

    /// Shutdown hook.
    pub fn destroy_all(&self) {
        let ids: Vec<String> = {
            let sessions = rwlock_read_or_recover(&self.sessions, "session map");
            sessions.keys().map(|id| id.as_str().to_string()).collect()
        };
        for id in ids {
            self.destroy(&id);
        }
    }

    fn managed_pids(&self) -> HashSet<u32> {
        let sessions = rwlock_read_or_recover(&self.sessions, "session map");
        sessions
            .values()
            .filter_map(|session| mutex_lock_or_recover(session, "session").pid())
            .collect()
    }

    /// Foreign instances of the target CLI, excluding everything this
    /// server already manages.
    pub fn discover_external(&self) -> Vec<ExternalSession> {
        self.detector
            .discover(&self.managed_pids())
            .into_iter()
            .map(|proc| ExternalSession {
                activity_status: self.activity.status_for_cwd(&proc.cwd),
                pid: proc.pid,
                cwd: proc.cwd.to_string_lossy().to_string(),
                command: proc.command,
                args: proc.args,
            })
            .collect()
    }

    /// Take over a foreign instance: terminate it and start a managed
    /// replacement in the same working directory with `--continue`.
    ///
    /// The (pid, cwd) pair must appear in a freshly computed discovery
    /// snapshot; this is what keeps the command from being usable as an
    /// arbitrary kill primitive.
    pub fn adopt(&self, pid: u32, cwd: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        let snapshot = self.discover_external();
        let discovered = snapshot
            .iter()
            .any(|entry| entry.pid == pid && entry.cwd == cwd);
        if !discovered {
            return Err(SessionError::NotDiscovered(pid));
        }

        if !self.detector.kill(pid) {
            return Err(SessionError::TerminationRefused(pid));
        }

        std::thread::sleep(ADOPT_SETTLE);
        if is_alive(pid) {
            warn!(pid, "Adopted process still alive after termination grace");
            return Err(SessionError::TerminationRefused(pid));
        }

        self.create(cwd, vec!["--continue".to_string()])
    }
}

fn validate_cwd(cwd: &Path) -> Result<(), SessionError> {
    if !cwd.exists() {
        return Err(SessionError::CwdMissing(cwd.to_string_lossy().to_string()));
    }
    if !cwd.is_dir() {
        return Err(SessionError::CwdNotDirectory(
            cwd.to_string_lossy().to_string(),
        ));
    }
    Ok(())
}
