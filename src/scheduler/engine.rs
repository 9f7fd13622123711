//! Recurring, jittered, headless execution of the target CLI.
//!
//! Each enabled schedule owns exactly one armed tokio task that sleeps to
//! the next cron fire, sleeps a further uniform random delay, executes the
//! run, and re-arms. Manual triggers bypass both sleeps. Run finalization
//! (footer, `lastRun`, broadcast) happens exactly once per run even when
//! the spawn-failure and exit paths race.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::Local;
use chrono::Utc;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::common::mutex_lock_or_recover;
use crate::infra::paths::expand_home;
use crate::infra::resolver::TargetCli;

use super::cron::CronExpr;
use super::presets::find_preset;
use super::runlog::RETENTION;
use super::runlog::RunInfo;
use super::runlog::RunLogFile;
use super::runlog::RunLogStore;
use super::runlog::safe_timestamp;
use super::store::LastRun;
use super::store::Schedule;
use super::store::ScheduleError;
use super::store::ScheduleStore;
use super::store::generate_schedule_id;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    RunComplete {
        schedule_id: String,
        name: String,
        exit_code: i32,
        timestamp: String,
    },
}

struct SchedulerInner {
    cli: TargetCli,
    store: ScheduleStore,
    runlogs: RunLogStore,
    schedules: Mutex<HashMap<String, Schedule>>,
    registrations: Mutex<HashMap<String, JoinHandle<()>>>,
    retention_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Load persisted schedules from `<base_dir>/schedules.json`; run logs
    /// live under `<base_dir>/runs/`.
    pub fn load(
        cli: TargetCli,
        base_dir: PathBuf,
        events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        let store = ScheduleStore::new(base_dir.join("schedules.json"));
        let schedules: HashMap<String, Schedule> = store
            .load()
            .into_iter()
            .map(|schedule| (schedule.id.clone(), schedule))
            .collect();
        info!(count = schedules.len(), "Loaded schedules");

        Self {
            inner: Arc::new(SchedulerInner {
                cli,
                store,
                runlogs: RunLogStore::new(base_dir.join("runs")),
                schedules: Mutex::new(schedules),
                registrations: Mutex::new(HashMap::new()),
                retention_task: Mutex::new(None),
                events_tx,
            }),
        }
    }

    /// Arm every enabled schedule and start the retention sweeps. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        self.inner.runlogs.cleanup(RETENTION);

        let enabled_ids: Vec<String> = {
            let schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            schedules
                .values()
                .filter(|s| s.enabled)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in enabled_ids {
            arm(&self.inner, id);
        }

        let inner = Arc::clone(&self.inner);
        let sweeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETENTION_SWEEP_INTERVAL).await;
                inner.runlogs.cleanup(RETENTION);
            }
        });
        *mutex_lock_or_recover(&self.inner.retention_task, "retention sweeper") = Some(sweeper);
    }

    pub fn shutdown(&self) {
        let mut registrations = mutex_lock_or_recover(&self.inner.registrations, "cron registrations");
        for (_, handle) in registrations.drain() {
            handle.abort();
        }
        if let Some(handle) = mutex_lock_or_recover(&self.inner.retention_task, "retention sweeper").take() {
            handle.abort();
        }
    }

    pub fn create(
        &self,
        name: &str,
        prompt: &str,
        cwd: &str,
        preset_label: &str,
    ) -> Result<Schedule, ScheduleError> {
        let preset = find_preset(preset_label)
            .ok_or_else(|| ScheduleError::UnknownPreset(preset_label.to_string()))?;
        CronExpr::parse(preset.cron)?;

        let schedule = Schedule {
            id: generate_schedule_id(),
            name: name.to_string(),
            prompt: prompt.to_string(),
            cwd: cwd.to_string(),
            preset_label: preset.label.to_string(),
            cron_expression: preset.cron.to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
        };

        {
            let mut schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            schedules.insert(schedule.id.clone(), schedule.clone());
        }
        self.persist()?;
        arm(&self.inner, schedule.id.clone());
        info!(schedule_id = %schedule.id, name, "Schedule created");
        Ok(schedule)
    }

    pub fn update(&self, id: &str, enabled: Option<bool>) -> Result<Schedule, ScheduleError> {
        let updated = {
            let mut schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            let schedule = schedules
                .get_mut(id)
                .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
            if let Some(enabled) = enabled {
                schedule.enabled = enabled;
            }
            schedule.clone()
        };
        self.persist()?;

        if updated.enabled {
            arm(&self.inner, updated.id.clone());
        } else {
            disarm(&self.inner, id);
        }
        Ok(updated)
    }

    /// Delete a schedule, its cron registration and its run-log directory.
    pub fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        {
            let mut schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            if schedules.remove(id).is_none() {
                return Err(ScheduleError::NotFound(id.to_string()));
            }
        }
        self.persist()?;
        disarm(&self.inner, id);
        self.inner.runlogs.delete_schedule_runs(id);
        info!(schedule_id = id, "Schedule deleted");
        Ok(())
    }

    /// Immediate one-off execution, bypassing the cron wait and the jitter.
    pub fn trigger(&self, id: &str) -> Result<(), ScheduleError> {
        {
            let schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            if !schedules.contains_key(id) {
                return Err(ScheduleError::NotFound(id.to_string()));
            }
        }
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            run_once(inner, id).await;
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<Schedule> {
        let schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
        let mut list: Vec<Schedule> = schedules.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn list_runs(&self, id: &str) -> Result<Vec<RunInfo>, ScheduleError> {
        {
            let schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            if !schedules.contains_key(id) {
                return Err(ScheduleError::NotFound(id.to_string()));
            }
        }
        Ok(self.inner.runlogs.list_runs(id))
    }

    pub fn run_log(&self, id: &str, timestamp: &str) -> Result<String, ScheduleError> {
        self.inner.runlogs.read_log(id, timestamp)
    }

    #[cfg(test)]
    fn registration_count(&self) -> usize {
        mutex_lock_or_recover(&self.inner.registrations, "cron registrations").len()
    }

    fn persist(&self) -> Result<(), ScheduleError> {
        let snapshot: Vec<Schedule> = {
            let schedules = mutex_lock_or_recover(&self.inner.schedules, "schedule set");
            let mut list: Vec<Schedule> = schedules.values().cloned().collect();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            list
        };
        self.inner.store.save(&snapshot)
    }
}

fn disarm(inner: &Arc<SchedulerInner>, id: &str) {
    let mut registrations = mutex_lock_or_recover(&inner.registrations, "cron registrations");
    if let Some(handle) = registrations.remove(id) {
        handle.abort();
    }
}

/// Exactly one active registration per enabled schedule; re-arming
/// replaces any previous task.
fn arm(inner: &Arc<SchedulerInner>, id: String) {
    disarm(inner, &id);

    let task_inner = Arc::clone(inner);
    let task_id = id.clone();
    let handle = tokio::spawn(async move {
        loop {
            let Some((cron, max_delay)) = ({
                let schedules = mutex_lock_or_recover(&task_inner.schedules, "schedule set");
                schedules.get(&task_id).filter(|s| s.enabled).map(|s| {
                    (
                        s.cron_expression.clone(),
                        find_preset(&s.preset_label)
                            .map(|p| p.max_delay)
                            .unwrap_or(Duration::from_secs(3 * 60 * 60)),
                    )
                })
            }) else {
                break;
            };

            let cron = match CronExpr::parse(&cron) {
                Ok(cron) => cron,
                Err(err) => {
                    error!(schedule_id = %task_id, error = %err, "Unparseable cron expression; disarming");
                    break;
                }
            };

            let now = Local::now();
            let Some(next) = cron.next_after(now) else {
                error!(schedule_id = %task_id, "Cron expression never fires; disarming");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(schedule_id = %task_id, wait_secs = wait.as_secs(), "Armed until next fire");
            tokio::time::sleep(wait).await;

            // Spread automated runs through the window instead of landing
            // every install on the same minute.
            let jitter_secs = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..max_delay.as_secs().max(1))
            };
            tokio::time::sleep(Duration::from_secs(jitter_secs)).await;

            run_once(Arc::clone(&task_inner), task_id.clone()).await;
        }
    });

    let mut registrations = mutex_lock_or_recover(&inner.registrations, "cron registrations");
    registrations.insert(id, handle);
}

async fn run_once(inner: Arc<SchedulerInner>, id: String) {
    let Some(schedule) = ({
        let schedules = mutex_lock_or_recover(&inner.schedules, "schedule set");
        schedules.get(&id).cloned()
    }) else {
        return;
    };

    let started_at = Utc::now();
    let timestamp = safe_timestamp(started_at);
    let started = Instant::now();

    let log = match inner.runlogs.create(
        &schedule.id,
        &timestamp,
        &schedule.name,
        &schedule.prompt,
        &schedule.cwd,
        started_at,
    ) {
        Ok(log) => Arc::new(Mutex::new(log)),
        Err(err) => {
            error!(schedule_id = %id, error = %err, "Failed to open run log");
            return;
        }
    };

    let finalized = AtomicBool::new(false);
    let finalize = |exit_code: i32| {
        finalize_run(
            &inner, &schedule, &log, &timestamp, started, exit_code, &finalized,
        );
    };

    let binary = match inner.cli.resolve() {
        Ok(binary) => binary,
        Err(err) => {
            append_line(&log, &format!("spawn error: {err}"));
            finalize(-1);
            return;
        }
    };

    let cwd = expand_home(&schedule.cwd);
    let mut child = match tokio::process::Command::new(&binary)
        .arg("-p")
        .arg(&schedule.prompt)
        .current_dir(&cwd)
        .env("FORCE_COLOR", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            append_line(&log, &format!("spawn error: {err}"));
            finalize(-1);
            return;
        }
    };

    let stdout_task = child.stdout.take().map(|pipe| copy_to_log(pipe, Arc::clone(&log)));
    let stderr_task = child.stderr.take().map(|pipe| copy_to_log(pipe, Arc::clone(&log)));

    let status = child.wait().await;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            append_line(&log, &format!("wait error: {err}"));
            -1
        }
    };
    finalize(exit_code);
}

/// Footer write, `lastRun` update, persistence and broadcast: exactly
/// once per run, across the spawn-error and exit paths.
fn finalize_run(
    inner: &Arc<SchedulerInner>,
    schedule: &Schedule,
    log: &Arc<Mutex<RunLogFile>>,
    timestamp: &str,
    started: Instant,
    exit_code: i32,
    finalized: &AtomicBool,
) {
    if finalized.swap(true, Ordering::SeqCst) {
        return;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    {
        let mut log = mutex_lock_or_recover(log, "run log");
        if let Err(err) = log.write_footer(Utc::now(), exit_code, duration_ms) {
            warn!(schedule_id = %schedule.id, error = %err, "Failed to write run log footer");
        }
    }

    // A schedule deleted while the run was in flight gets neither a
    // lastRun update nor a completion broadcast.
    let still_exists = {
        let mut schedules = mutex_lock_or_recover(&inner.schedules, "schedule set");
        match schedules.get_mut(&schedule.id) {
            Some(entry) => {
                entry.last_run = Some(LastRun {
                    timestamp: timestamp.to_string(),
                    exit_code,
                    duration_ms,
                });
                true
            }
            None => false,
        }
    };
    if !still_exists {
        debug!(schedule_id = %schedule.id, "Schedule deleted mid-run; skipping finalize broadcast");
        return;
    }

    let snapshot: Vec<Schedule> = {
        let schedules = mutex_lock_or_recover(&inner.schedules, "schedule set");
        let mut list: Vec<Schedule> = schedules.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    };
    if let Err(err) = inner.store.save(&snapshot) {
        error!(schedule_id = %schedule.id, error = %err, "Failed to persist schedules after run");
    }

    info!(schedule_id = %schedule.id, exit_code, duration_ms, "Schedule run complete");
    let _ = inner.events_tx.send(SchedulerEvent::RunComplete {
        schedule_id: schedule.id.clone(),
        name: schedule.name.clone(),
        exit_code,
        timestamp: timestamp.to_string(),
    });
}

fn append_line(log: &Arc<Mutex<RunLogFile>>, line: &str) {
    let mut log = mutex_lock_or_recover(log, "run log");
    let _ = log.append(line.as_bytes());
    let _ = log.append(b"\n");
}

fn copy_to_log(
    mut pipe: impl AsyncReadExt + Unpin + Send + 'static,
    log: Arc<Mutex<RunLogFile>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut log = mutex_lock_or_recover(&log, "run log");
                    if log.append(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}
