mod auth;
mod broadcast;
mod http;
mod protocol;
mod ws;

pub use auth::AuthGate;
pub use broadcast::Broadcaster;
pub use broadcast::ClientHandle;
pub use broadcast::Outbound;
pub use protocol::ClientCommand;
pub use protocol::ServerEvent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use crossbeam_channel as channel;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::infra::paths::dot_dir;
use crate::infra::prefs::PreferencesStore;
use crate::infra::resolver::TargetCli;
use crate::scheduler::Scheduler;
use crate::scheduler::SchedulerEvent;
use crate::session::SessionManager;
use crate::session::SessionNotice;

const DEFAULT_PORT: u16 = 3456;
const DEFAULT_MAX_CONNECTIONS: usize = 32;
const STATUS_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
    pub max_connections: usize,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_env("PORT", DEFAULT_PORT),
            dev_mode: env_truthy("DEV_MODE"),
            max_connections: parse_env("AGENT_REMOTE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            max_sessions: parse_env(
                "AGENT_REMOTE_MAX_SESSIONS",
                crate::session::DEFAULT_MAX_SESSIONS,
            ),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    let Ok(value) = std::env::var(key) else {
        return default;
    };
    if value.trim().is_empty() {
        return default;
    }
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = %value, key, "Invalid numeric config; using default");
            default
        }
    }
}

fn env_truthy(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Everything the HTTP and WebSocket handlers share.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub scheduler: Scheduler,
    pub broadcaster: Arc<Broadcaster>,
    pub prefs: Arc<PreferencesStore>,
    pub auth: AuthGate,
    pub dev_mode: bool,
    pub ws_limits: Arc<tokio::sync::Semaphore>,
    pub started_at: Instant,
    pub uploads_dir: PathBuf,
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let cli = TargetCli::default();
    let auth = AuthGate::from_env(&cli);
    let broadcaster = Arc::new(Broadcaster::new());

    let (notice_tx, notice_rx) = channel::unbounded::<SessionNotice>();
    let manager = Arc::new(
        SessionManager::new(cli.clone(), Some(notice_tx)).with_max_sessions(config.max_sessions),
    );

    let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel::<SchedulerEvent>();
    let scheduler = Scheduler::load(cli, dot_dir(), scheduler_tx);
    scheduler.start();

    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        scheduler: scheduler.clone(),
        broadcaster: Arc::clone(&broadcaster),
        prefs: Arc::new(PreferencesStore::load()),
        auth,
        dev_mode: config.dev_mode,
        ws_limits: Arc::new(tokio::sync::Semaphore::new(config.max_connections)),
        started_at: Instant::now(),
        uploads_dir: dot_dir().join("uploads"),
    });

    spawn_notice_bridge(notice_rx, Arc::clone(&broadcaster));
    spawn_scheduler_event_task(scheduler_rx, Arc::clone(&broadcaster));
    spawn_status_broadcast(Arc::clone(&state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;

    print_banner(config.port, state.auth.token());

    let app = http::build_router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server failed")?;

    info!("Shutting down: destroying sessions and stopping scheduler");
    scheduler.shutdown();
    manager.destroy_all();
    Ok(())
}

/// Session pumps report `ask_user` detections on a synchronous channel; a
/// dedicated thread turns them into `session:input_required` broadcasts.
fn spawn_notice_bridge(notice_rx: channel::Receiver<SessionNotice>, broadcaster: Arc<Broadcaster>) {
    let builder = std::thread::Builder::new().name("notice-bridge".to_string());
    let spawned = builder.spawn(move || {
        while let Ok(notice) = notice_rx.recv() {
            let SessionNotice::InputRequired {
                session_id,
                cwd,
                event,
            } = notice;
            let session_name = cwd
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| cwd.to_string_lossy().to_string());
            let preview: String = event.content.chars().take(150).collect();
            broadcaster.broadcast(&ServerEvent::SessionInputRequired {
                session_id,
                session_name,
                preview,
            });
        }
    });
    if let Err(err) = spawned {
        error!(error = %err, "Failed to spawn notice bridge thread");
    }
}

fn spawn_scheduler_event_task(
    mut rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    broadcaster: Arc<Broadcaster>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let SchedulerEvent::RunComplete {
                schedule_id,
                name,
                exit_code,
                timestamp,
            } = event;
            broadcaster.broadcast(&ServerEvent::ScheduleRunComplete {
                schedule_id,
                name,
                exit_code,
                timestamp,
            });
        }
    });
}

/// Point-in-time status of managed and external sessions, pushed to every
/// authenticated client on a fixed cadence.
fn spawn_status_broadcast(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_BROADCAST_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if state.broadcaster.client_count() == 0 {
                continue;
            }
            let manager = Arc::clone(&state.manager);
            let snapshot = tokio::task::spawn_blocking(move || {
                let sessions = manager.list();
                let external_sessions = manager.discover_external();
                (sessions, external_sessions)
            })
            .await;
            match snapshot {
                Ok((sessions, external_sessions)) => {
                    state.broadcaster.broadcast(&ServerEvent::SessionStatus {
                        sessions,
                        external_sessions,
                    });
                }
                Err(err) => warn!(error = %err, "Status snapshot task failed"),
            }
        }
    });
}

#[expect(clippy::print_stdout, reason = "Startup banner is CLI output")]
fn print_banner(port: u16, token: &str) {
    println!();
    println!("  agent-remote listening");
    println!();
    println!("  Local:  http://localhost:{port}/?token={token}");
    println!("  Token:  {token}");
    println!();
    println!("  Press Ctrl+C to stop");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            // SAFETY: Test-only environment override.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn remove(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            // SAFETY: Test-only environment override.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = self.prev.take() {
                // SAFETY: Test-only environment restoration.
                unsafe {
                    std::env::set_var(self.key, prev);
                }
            } else {
                // SAFETY: Test-only environment cleanup.
                unsafe {
                    std::env::remove_var(self.key);
                }
            }
        }
    }

    #[test]
    fn default_port_is_3456() {
        let _guard = EnvGuard::remove("PORT");
        assert_eq!(ServerConfig::from_env().port, DEFAULT_PORT);
    }

    #[test]
    fn port_env_overrides_default() {
        let _guard = EnvGuard::set("PORT", "8099");
        assert_eq!(ServerConfig::from_env().port, 8099);
    }

    #[test]
    fn invalid_port_falls_back() {
        let _guard = EnvGuard::set("PORT", "not-a-port");
        assert_eq!(ServerConfig::from_env().port, DEFAULT_PORT);
    }

    #[test]
    fn dev_mode_truthy_values() {
        let _guard = EnvGuard::set("DEV_MODE", "1");
        assert!(ServerConfig::from_env().dev_mode);

        let _guard = EnvGuard::set("DEV_MODE", "false");
        assert!(!ServerConfig::from_env().dev_mode);
    }
}
