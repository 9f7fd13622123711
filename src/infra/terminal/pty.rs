use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel as channel;
use libc::{POLLERR, POLLHUP, POLLOUT, poll, pollfd};
use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tracing::{debug, warn};

use crate::common::mutex_lock_or_recover;

use super::error::PtyError;
use super::error::SpawnErrorKind;

/// How long a client write may wait on a wedged child before it fails.
/// Session writes are fire-and-forget from the connection's point of view,
/// so an unwritable PTY turns into a bounded error rather than a stalled
/// client loop.
const WRITE_STALL_BUDGET: Duration = Duration::from_secs(5);
const WRITE_POLL_SLICE_MS: libc::c_int = 100;

const READ_BUF_BYTES: usize = 16 * 1024;
const READ_CHANNEL_CAPACITY: usize = 128;

pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    size: PtySize,
    read_rx: Option<channel::Receiver<ReadEvent>>,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill();
        }
    }
}

impl PtyHandle {
    /// Spawn `program args..` attached to a fresh PTY pair. The child
    /// inherits the parent environment plus `TERM=xterm-256color` and
    /// `FORCE_COLOR=1`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("FORCE_COLOR", "1");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            let kind = if let Some(io_err) = e.downcast_ref::<io::Error>() {
                match io_err.kind() {
                    io::ErrorKind::NotFound => SpawnErrorKind::NotFound,
                    io::ErrorKind::PermissionDenied => SpawnErrorKind::PermissionDenied,
                    _ => SpawnErrorKind::Other,
                }
            } else {
                SpawnErrorKind::Other
            };
            PtyError::Spawn {
                reason: e.to_string(),
                kind,
            }
        })?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let read_rx = spawn_reader(reader);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        Ok(Self {
            master: pair.master,
            child,
            writer: Arc::new(Mutex::new(writer)),
            size,
            read_rx: Some(read_rx),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Write the whole buffer, waiting (bounded) whenever the kernel-side
    /// PTY buffer is full. Fails once the stall budget is spent.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + WRITE_STALL_BUDGET;
        let mut writer = mutex_lock_or_recover(&self.writer, "pty writer");
        let mut remaining = data;
        while !remaining.is_empty() {
            match writer.write(remaining) {
                Ok(0) => return Err(PtyError::Write("PTY closed mid-write".to_string())),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.await_writable(deadline)?;
                }
                Err(e) => return Err(PtyError::Write(e.to_string())),
            }
        }
        Ok(())
    }

    /// Poll the master fd in short slices until it is writable, the peer
    /// hangs up, or the deadline passes.
    #[cfg(unix)]
    fn await_writable(&self, deadline: Instant) -> Result<(), PtyError> {
        let Some(fd) = self.master.as_raw_fd() else {
            return Ok(());
        };

        loop {
            if Instant::now() >= deadline {
                return Err(PtyError::Write(format!(
                    "child not accepting input within {}ms",
                    WRITE_STALL_BUDGET.as_millis()
                )));
            }

            let mut probe = pollfd {
                fd,
                events: POLLOUT,
                revents: 0,
            };
            // SAFETY: single pollfd on the master fd, which stays open for
            // the lifetime of &self.
            let rc = unsafe { poll(&mut probe, 1, WRITE_POLL_SLICE_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PtyError::Write(err.to_string()));
            }
            if rc == 0 {
                // Slice elapsed; loop re-checks the deadline.
                continue;
            }
            if probe.revents & (POLLHUP | POLLERR) != 0 {
                return Err(PtyError::Write("PTY peer closed".to_string()));
            }
            if probe.revents & POLLOUT != 0 {
                return Ok(());
            }
        }
    }

    #[cfg(not(unix))]
    fn await_writable(&self, _deadline: Instant) -> Result<(), PtyError> {
        Ok(())
    }

    /// Propagate new geometry to the kernel; the recorded size only
    /// changes when the kernel accepted it. Zero dimensions from a hidden
    /// browser viewport are clamped rather than rejected.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .resize(size)
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        self.size = size;
        Ok(())
    }

    /// Terminate the child. A child that already exited counts as success.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child.kill().map_err(|e| PtyError::Kill(e.to_string()))
    }

    /// Block until the child is reaped and return its exit code. Intended
    /// for the session pump after the reader reports EOF.
    pub fn wait_exit_code(&mut self) -> i32 {
        match self.child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        }
    }

    pub(crate) fn take_read_rx(&mut self) -> Option<channel::Receiver<ReadEvent>> {
        self.read_rx.take()
    }
}

pub enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

/// Reader thread: forward chunks until the stream ends, then deliver
/// exactly one terminal event (EOF or error) and exit.
fn spawn_reader(mut reader: Box<dyn Read + Send>) -> channel::Receiver<ReadEvent> {
    let (tx, rx) = channel::bounded(READ_CHANNEL_CAPACITY);
    let thread_tx = tx.clone();
    let spawned = std::thread::Builder::new()
        .name("pty-read".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUF_BYTES];
            let outcome = loop {
                match reader.read(&mut buf) {
                    Ok(0) => break ReadEvent::Eof,
                    Ok(n) => {
                        if thread_tx.send(ReadEvent::Data(buf[..n].to_vec())).is_err() {
                            // The session dropped its receiver; nobody is
                            // listening, so stop without a terminal event.
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break ReadEvent::Error(e.to_string()),
                }
            };
            match &outcome {
                ReadEvent::Eof => debug!("PTY stream ended"),
                ReadEvent::Error(reason) => warn!(reason, "PTY read failed"),
                ReadEvent::Data(_) => {}
            }
            let _ = thread_tx.send(outcome);
        });
    if let Err(err) = spawned {
        let _ = tx.send(ReadEvent::Error(format!(
            "failed to start reader thread: {err}"
        )));
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn spawn_streams_output_and_exits() {
        let args = vec!["-c".to_string(), "printf 'hi'".to_string()];
        let mut pty =
            PtyHandle::spawn(Path::new("sh"), &args, Path::new("/tmp"), 80, 24).unwrap();
        let rx = pty.take_read_rx().unwrap();

        let mut collected = Vec::new();
        let mut saw_eof = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                ReadEvent::Data(data) => collected.extend(data),
                ReadEvent::Eof => {
                    saw_eof = true;
                    break;
                }
                ReadEvent::Error(_) => break,
            }
        }

        assert!(String::from_utf8_lossy(&collected).contains("hi"));
        assert!(saw_eof);
        assert_eq!(pty.wait_exit_code(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn spawn_missing_binary_fails() {
        let err = PtyHandle::spawn(
            Path::new("/nonexistent/definitely-not-a-binary"),
            &[],
            Path::new("/tmp"),
            80,
            24,
        )
        .err()
        .expect("spawn should fail");
        assert_eq!(err.operation(), "spawn");
    }

    #[cfg(unix)]
    #[test]
    fn kill_of_exited_child_is_ok() {
        let args = vec!["-c".to_string(), "exit 0".to_string()];
        let mut pty =
            PtyHandle::spawn(Path::new("sh"), &args, Path::new("/tmp"), 80, 24).unwrap();
        assert_eq!(pty.wait_exit_code(), 0);
        assert!(pty.kill().is_ok());
        assert!(pty.kill().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn resize_clamps_zero_geometry() {
        let args = vec!["-c".to_string(), "sleep 2".to_string()];
        let mut pty =
            PtyHandle::spawn(Path::new("sh"), &args, Path::new("/tmp"), 80, 24).unwrap();
        pty.resize(0, 0).unwrap();
        assert_eq!((pty.size.cols, pty.size.rows), (1, 1));
        let _ = pty.kill();
        let _ = pty.wait_exit_code();
    }

    #[cfg(unix)]
    #[test]
    fn resize_after_kill_is_reported_not_panicking() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let mut pty =
            PtyHandle::spawn(Path::new("sh"), &args, Path::new("/tmp"), 80, 24).unwrap();
        pty.kill().unwrap();
        let _ = pty.wait_exit_code();
        // Either outcome is fine; callers swallow transient resize errors.
        let _ = pty.resize(100, 30);
    }
}
