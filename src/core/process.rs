//! Process launch and output capture
//!
//! Each started process gets one reader task per captured stream and one
//! waiter task that owns the child. Everything they observe is pushed into
//! the launcher's event channel:
//!
//! - `Output` for each line, in stream order
//! - `Exited` exactly once, after the readers have drained

use super::launch::LaunchSpec;
use crate::error::{LaunchError, TerminationError};
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pid reported when the OS did not hand one back
pub const UNTRACKED_PID: u32 = 0;

/// How long to keep draining output once the process has exited
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A reader gives up after this many failed reads in a row
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Raw events from running processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output {
        pid: u32,
        line: String,
        is_error: bool,
    },
    Exited {
        pid: u32,
        exit_code: Option<i32>,
    },
}

/// Starts processes and reports their output and exit over a channel
pub struct ProcessLauncher {
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    drain_grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher and the receiving end of its event stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                event_tx: tx,
                drain_grace: DEFAULT_DRAIN_GRACE,
            },
            rx,
        )
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Create the OS process without starting capture.
    ///
    /// Nothing is sent on the event channel until [`SpawnedProcess::supervise`]
    /// is called, which lets the caller announce the process first.
    pub fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, LaunchError> {
        if let Some(dir) = spec.dir() {
            if !dir.is_dir() {
                return Err(LaunchError::InvalidWorkingDir {
                    dir: dir.to_path_buf(),
                });
            }
        }

        let mut cmd = Command::new(spec.program());
        cmd.args(spec.arguments()).stdin(Stdio::null());

        if let Some(dir) = spec.dir() {
            cmd.current_dir(dir);
        }

        if spec.captures_output() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        #[cfg(windows)]
        {
            if !spec.shows_window() {
                cmd.creation_flags(CREATE_NO_WINDOW);
            }
        }

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                program: spec.program().to_string(),
            },
            _ => LaunchError::Spawn {
                program: spec.program().to_string(),
                source,
            },
        })?;

        let pid = child.id().unwrap_or(UNTRACKED_PID);
        log::debug!("Spawned {} as pid {}", spec, pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        Ok(SpawnedProcess {
            pid,
            child,
            stdout,
            stderr,
            kill_rx,
            handle: ProcessHandle {
                pid,
                kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
            },
            event_tx: self.event_tx.clone(),
            drain_grace: self.drain_grace,
        })
    }

    /// Spawn and immediately start capture
    pub fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        Ok(self.spawn(spec)?.supervise())
    }
}

/// A created process whose output is not being captured yet.
///
/// Dropping it without calling `supervise` closes the pipes but leaves the
/// process running.
pub struct SpawnedProcess {
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    kill_rx: oneshot::Receiver<()>,
    handle: ProcessHandle,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    drain_grace: Duration,
}

impl SpawnedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Start the stream readers and the exit waiter
    pub fn supervise(self) -> ProcessHandle {
        let SpawnedProcess {
            pid,
            mut child,
            stdout,
            stderr,
            kill_rx,
            handle,
            event_tx,
            drain_grace,
        } = self;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(read_lines(pid, stdout, false, event_tx.clone())));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(read_lines(pid, stderr, true, event_tx.clone())));
        }

        tokio::spawn(async move {
            let exit_code = wait_for_exit(pid, &mut child, kill_rx).await;
            drain_readers(pid, readers, drain_grace).await;

            match exit_code {
                Some(0) => log::info!("Process {} exited (code 0)", pid),
                Some(code) => log::warn!("Process {} exited (code {})", pid, code),
                None => log::warn!("Process {} exited without an exit code", pid),
            }

            let _ = event_tx.send(ProcessEvent::Exited { pid, exit_code });
        });

        handle
    }
}

/// Cloneable kill switch for one started process
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    kill_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request forced termination. The exit is still reported as usual.
    pub fn kill(&self) -> Result<(), TerminationError> {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            None => Err(TerminationError::AlreadyRequested { pid: self.pid }),
            Some(tx) => tx
                .send(())
                .map_err(|_| TerminationError::AlreadyExited { pid: self.pid }),
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

/// Wait for the child, honouring a kill request while waiting
async fn wait_for_exit(
    pid: u32,
    child: &mut Child,
    mut kill_rx: oneshot::Receiver<()>,
) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut kill_rx => {
            // Err means every handle was dropped: nobody can kill us any more.
            if request.is_ok() {
                log::info!("Killing process {}", pid);
                if let Err(e) = child.start_kill() {
                    log::debug!("Kill of process {} failed: {}", pid, e);
                }
            }
            child.wait().await
        }
    };
    drop(kill_rx);

    match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("Waiting for process {} failed: {}", pid, e);
            None
        }
    }
}

/// Let readers flush what is left, then abort the stragglers
async fn drain_readers(pid: u32, readers: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            log::debug!("Output of process {} still open after exit; closing", pid);
            reader.abort();
        }
    }
}

async fn read_lines<R>(
    pid: u32,
    stream: R,
    is_error: bool,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut failures = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                failures = 0;
                // Keep reading after the receiver is gone so the child never
                // blocks on a full pipe.
                let _ = event_tx.send(ProcessEvent::Output {
                    pid,
                    line: decode_line(&buf),
                    is_error,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                failures += 1;
                log::warn!("Read error on process {} output: {}", pid, e);
                if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                    break;
                }
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
