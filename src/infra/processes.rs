//! Discovery and termination of foreign target-CLI processes.
//!
//! A snapshot of the OS process table is filtered down to instances of the
//! target CLI owned by the current user, with their working directories
//! resolved through the platform mechanism. Nothing here is owned by the
//! server; adoption builds on top of these snapshots.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use super::resolver::TargetCli;

#[derive(Debug, Clone)]
pub struct ForeignProcess {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone)]
struct PsLine {
    user: String,
    pid: u32,
    state: String,
    argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessDetector {
    cli: TargetCli,
    kill_budget: Duration,
}

pub const DEFAULT_KILL_BUDGET: Duration = Duration::from_millis(200);
const LIVENESS_POLL: Duration = Duration::from_millis(50);

impl ProcessDetector {
    pub fn new(cli: TargetCli) -> Self {
        Self {
            cli,
            kill_budget: DEFAULT_KILL_BUDGET,
        }
    }

    pub fn with_kill_budget(mut self, budget: Duration) -> Self {
        self.kill_budget = budget;
        self
    }

    /// Enumerate foreign instances of the target CLI owned by the current
    /// user, excluding `excluded_pids`. Entries whose working directory
    /// cannot be resolved are discarded.
    pub fn discover(&self, excluded_pids: &HashSet<u32>) -> Vec<ForeignProcess> {
        let user = current_user();
        process_snapshot()
            .into_iter()
            .filter(|line| !excluded_pids.contains(&line.pid))
            .filter(|line| line.pid != std::process::id())
            .filter(|line| !line.state.starts_with('Z'))
            .filter(|line| user.as_deref().is_none_or(|u| line.user == u))
            .filter(|line| self.matches_target(&line.argv))
            .filter_map(|line| {
                let cwd = cwd_for_pid(line.pid)?;
                Some(ForeignProcess {
                    pid: line.pid,
                    command: line.argv.first().cloned().unwrap_or_default(),
                    args: line.argv.into_iter().skip(1).collect(),
                    cwd,
                })
            })
            .collect()
    }

    fn matches_target(&self, argv: &[String]) -> bool {
        let Some(first) = argv.first() else {
            return false;
        };
        let name = self.cli.name();
        if first == name {
            return true;
        }
        first.ends_with(&format!("/{name}")) && !first.contains(".app")
    }

    /// Graceful terminate with escalation: SIGTERM, liveness polls every
    /// 50 ms, SIGKILL once the budget is exhausted. Returns whether the
    /// process is gone.
    pub fn kill(&self, pid: u32) -> bool {
        if !is_alive(pid) {
            return true;
        }

        signal(pid, libc::SIGTERM);
        let deadline = Instant::now() + self.kill_budget;
        while Instant::now() < deadline {
            if !is_alive(pid) {
                return true;
            }
            std::thread::sleep(LIVENESS_POLL);
        }

        debug!(pid, "Process survived SIGTERM budget, escalating to SIGKILL");
        signal(pid, libc::SIGKILL);
        std::thread::sleep(LIVENESS_POLL);
        !is_alive(pid)
    }
}

/// `kill(pid, 0)` probes process existence without sending a signal.
/// EPERM means the process exists but belongs to someone else.
pub fn is_alive(pid: u32) -> bool {
    let pid_t: libc::pid_t = match pid.try_into() {
        Ok(pid_t) => pid_t,
        Err(_) => return false,
    };
    // SAFETY: standard POSIX liveness probe; no signal is delivered.
    unsafe {
        if libc::kill(pid_t, 0) == 0 {
            return true;
        }
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::EPERM
    )
}

fn signal(pid: u32, sig: libc::c_int) {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: pid was validated; delivering a signal to a gone process is
    // harmless (ESRCH).
    unsafe {
        libc::kill(pid_t, sig);
    }
}

fn process_snapshot() -> Vec<PsLine> {
    let Ok(output) = Command::new("ps")
        .args(["-axo", "user=,pid=,stat=,command="])
        .output()
    else {
        debug!("Process discovery skipped (ps snapshot unavailable)");
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect()
}

fn parse_ps_line(line: &str) -> Option<PsLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let user = parts.next()?.to_string();
    let pid = parts.next()?.parse::<u32>().ok()?;
    let state = parts.next()?.to_string();
    let argv: Vec<String> = parts.map(str::to_string).collect();
    if argv.is_empty() {
        return None;
    }
    Some(PsLine {
        user,
        pid,
        state,
        argv,
    })
}

fn current_user() -> Option<String> {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return Some(user);
        }
    }
    if let Ok(user) = std::env::var("LOGNAME") {
        if !user.is_empty() {
            return Some(user);
        }
    }
    let output = Command::new("id").arg("-un").output().ok()?;
    let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if user.is_empty() { None } else { Some(user) }
}

#[cfg(target_os = "linux")]
fn cwd_for_pid(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd")).ok()
}

#[cfg(target_os = "macos")]
fn cwd_for_pid(pid: u32) -> Option<PathBuf> {
    let output = Command::new("lsof")
        .args(["-a", "-d", "cwd", "-p", &pid.to_string(), "-Fn"])
        .output()
        .ok()?;
    // -F output: lines prefixed with a field character; `n` is the name.
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n').map(PathBuf::from))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn cwd_for_pid(_pid: u32) -> Option<PathBuf> {
    None
}
