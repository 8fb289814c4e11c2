//! Script runner - launches batches of scripts and tracks them until exit
//!
//! A batch runs on its own task and walks its paths in order. Started
//! processes are tracked by pid; the event pump consumes the launcher's
//! output/exit stream, keeps the live table current and republishes
//! everything as [`RunnerEvent`]s.

use super::events::{Observers, RunnerEvent, SubscriptionId};
use super::launch::{DefaultResolver, Resolver};
use super::process::{ProcessEvent, ProcessHandle, ProcessLauncher, UNTRACKED_PID};
use super::record::ProcessRecord;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What happened to one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Processes created (tracked or not)
    pub started: usize,
    /// Blank, missing or unresolvable paths
    pub skipped: usize,
    /// Paths whose process could not be created
    pub failed: usize,
    /// The batch stopped early because of `cancel_all`
    pub cancelled: bool,
}

/// A running batch. Dropping it does not stop the batch.
pub struct BatchHandle {
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for every path in the batch to be processed
    pub async fn join(self) -> BatchReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Batch task did not complete: {}", e);
                BatchReport {
                    cancelled: true,
                    ..BatchReport::default()
                }
            }
        }
    }
}

struct TrackedProcess {
    record: ProcessRecord,
    handle: ProcessHandle,
}

enum LaunchOutcome {
    Started,
    Skipped,
    Failed,
}

/// State shared by the runner, its batch tasks and the event pump
struct RunnerCore {
    launcher: ProcessLauncher,
    default_resolver: DefaultResolver,
    live: Mutex<HashMap<u32, TrackedProcess>>,
    live_count: watch::Sender<usize>,
    observers: Observers<RunnerEvent>,
}

impl RunnerCore {
    fn live(&self) -> MutexGuard<'_, HashMap<u32, TrackedProcess>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The live count is tracked entries plus exits still being published.
    // Only ever moved by deltas.
    fn release_live(&self, n: usize) {
        if n > 0 {
            self.live_count.send_modify(|count| *count = count.saturating_sub(n));
        }
    }

    /// Start tracking `pid`. Returns the record it displaced, if the OS
    /// reused a pid whose exit has not been seen yet.
    fn track(&self, pid: u32, path: &Path, handle: ProcessHandle) -> Option<ProcessRecord> {
        let mut live = self.live();
        let replaced = live.insert(
            pid,
            TrackedProcess {
                record: ProcessRecord::new(pid, path.to_path_buf()),
                handle,
            },
        );
        match &replaced {
            Some(previous) => log::warn!(
                "pid {} reused while {} was still tracked; replacing it",
                pid,
                previous.record.path.display()
            ),
            None => self.live_count.send_modify(|count| *count += 1),
        }
        replaced.map(|tracked| tracked.record)
    }

    async fn run_batch(
        &self,
        paths: Vec<PathBuf>,
        resolver: Option<Resolver>,
        token: CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for path in paths {
            tokio::task::yield_now().await;
            if token.is_cancelled() {
                log::info!("Batch cancelled; remaining scripts not started");
                report.cancelled = true;
                break;
            }

            match self.launch_one(&path, resolver.as_ref()).await {
                LaunchOutcome::Started => report.started += 1,
                LaunchOutcome::Skipped => report.skipped += 1,
                LaunchOutcome::Failed => report.failed += 1,
            }
        }

        log::debug!("Batch finished: {:?}", report);
        report
    }

    async fn launch_one(&self, path: &Path, resolver: Option<&Resolver>) -> LaunchOutcome {
        if path.to_string_lossy().trim().is_empty() {
            return LaunchOutcome::Skipped;
        }

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            log::debug!("Skipping {}: file no longer exists", path.display());
            return LaunchOutcome::Skipped;
        }

        let spec = resolver
            .and_then(|resolve| (**resolve)(path))
            .or_else(|| self.default_resolver.resolve(path));
        let Some(spec) = spec else {
            log::debug!("Skipping {}: no launch specification", path.display());
            return LaunchOutcome::Skipped;
        };

        let spawned = match self.launcher.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                log::warn!("Failed to start {}: {}", path.display(), e);
                return LaunchOutcome::Failed;
            }
        };

        let pid = spawned.pid();
        if pid == UNTRACKED_PID {
            log::warn!("Started {} without a usable pid; not tracking it", path.display());
        } else {
            self.track(pid, path, spawned.handle());
        }

        log::info!("Started {} (pid {})", path.display(), pid);
        self.observers.publish(&RunnerEvent::Started {
            pid,
            path: path.to_path_buf(),
        });

        // Capture begins only now, so Started always precedes this
        // process's output and exit.
        spawned.supervise();
        LaunchOutcome::Started
    }

    fn handle_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output {
                pid,
                line,
                is_error,
            } => {
                self.observers.publish(&RunnerEvent::Output {
                    pid,
                    line,
                    is_error,
                });
            }
            ProcessEvent::Exited { pid, exit_code } => {
                let record = self.live().remove(&pid).map(|mut tracked| {
                    tracked.record.finish(exit_code);
                    tracked.record
                });
                let was_tracked = record.is_some();
                if !was_tracked {
                    log::debug!("Exit of untracked process {}", pid);
                }

                self.observers.publish(&RunnerEvent::Exited {
                    pid,
                    exit_code,
                    record,
                });
                if was_tracked {
                    self.release_live(1);
                }
            }
        }
    }
}

/// Launches scripts as child processes and republishes their lifecycle
pub struct ScriptRunner {
    core: Arc<RunnerCore>,
    batch_token: Mutex<CancellationToken>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ScriptRunner {
    /// Create a runner. Must be called from within a Tokio runtime.
    pub fn new(config: &RunnerConfig) -> Self {
        let (launcher, event_rx) = ProcessLauncher::new();
        let launcher = launcher.with_drain_grace(config.output_drain_grace());
        Self::with_launcher(launcher, event_rx, DefaultResolver::from_config(config))
    }

    pub fn with_launcher(
        launcher: ProcessLauncher,
        mut event_rx: mpsc::UnboundedReceiver<ProcessEvent>,
        default_resolver: DefaultResolver,
    ) -> Self {
        let (live_count, _) = watch::channel(0);
        let core = Arc::new(RunnerCore {
            launcher,
            default_resolver,
            live: Mutex::new(HashMap::new()),
            live_count,
            observers: Observers::new(),
        });

        let pump_core = core.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump_core.handle_process_event(event);
            }
        });

        Self {
            core,
            batch_token: Mutex::new(CancellationToken::new()),
            pump: Mutex::new(Some(pump)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Launch `paths` in order on a background task.
    ///
    /// `resolver` is consulted first for each path; the extension-based
    /// default is used when it is absent or declines the path.
    pub fn start_many<I, P>(
        &self,
        paths: I,
        resolver: Option<Resolver>,
    ) -> Result<BatchHandle, RunnerError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        if self.is_disposed() {
            return Err(RunnerError::Disposed);
        }

        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let token = self
            .batch_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let core = self.core.clone();

        log::info!("Starting batch of {} scripts", paths.len());
        let task = tokio::spawn(async move { core.run_batch(paths, resolver, token).await });

        Ok(BatchHandle { task })
    }

    /// Abandon pending batch paths and forget every tracked process.
    ///
    /// With `kill`, each tracked process is also force-terminated; processes
    /// that already exited are ignored. Exit events still follow.
    pub fn cancel_all(&self, kill: bool) {
        {
            let mut token = self
                .batch_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            token.cancel();
            *token = CancellationToken::new();
        }

        let tracked: Vec<TrackedProcess> = {
            let mut live = self.core.live();
            let drained: Vec<TrackedProcess> = live.drain().map(|(_, t)| t).collect();
            self.core.release_live(drained.len());
            drained
        };
        if !tracked.is_empty() {
            log::info!("Cancelling {} tracked processes (kill: {})", tracked.len(), kill);
        }

        if kill {
            for process in &tracked {
                if let Err(e) = process.handle.kill() {
                    log::debug!("Ignoring failed kill: {}", e);
                }
            }
        }
    }

    /// Copy of the currently tracked processes, oldest first
    pub fn running_processes(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self
            .core
            .live()
            .values()
            .map(|tracked| tracked.record.clone())
            .collect();
        records.sort_by_key(|r| (r.started_at, r.pid));
        records
    }

    pub fn running_count(&self) -> usize {
        self.core.live().len()
    }

    /// Resolve once no tracked process is alive and all their exits are
    /// published. Join the batch first, or this may resolve before it starts
    /// anything.
    pub async fn wait_idle(&self) {
        let mut rx = self.core.live_count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RunnerEvent) + Send + Sync + 'static,
    {
        self.core.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.observers.unsubscribe(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop batches and event delivery. Child processes keep running.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel_all(false);

        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }

        log::debug!("Script runner disposed");
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_all_without_processes_is_noop() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        runner.cancel_all(false);
        runner.cancel_all(true);
        assert_eq!(runner.running_count(), 0);
        assert!(runner.running_processes().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_dispose_fails() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        runner.dispose();
        runner.dispose();

        assert!(runner.is_disposed());
        assert!(matches!(
            runner.start_many(["a.bat"], None),
            Err(RunnerError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_blank_and_missing_paths_are_skipped() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        let report = runner
            .start_many(["", "   ", "/definitely/missing/x.bat"], None)
            .unwrap()
            .join()
            .await;

        assert_eq!(
            report,
            BatchReport {
                skipped: 3,
                ..BatchReport::default()
            }
        );
    }

    #[cfg(unix)]
    fn spawn_sleeper(runner: &ScriptRunner) -> crate::core::SpawnedProcess {
        let spec = crate::core::LaunchSpec::new("sh")
            .arg("-c")
            .arg("exec sleep 30");
        runner.core.launcher.spawn(&spec).unwrap()
    }

    fn live_count(runner: &ScriptRunner) -> usize {
        *runner.core.live_count.borrow()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_untracked_exit_does_not_clear_live_count() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        let spawned = spawn_sleeper(&runner);
        let pid = spawned.pid();
        runner.core.track(pid, Path::new("slow.bat"), spawned.handle());
        let handle = spawned.supervise();

        // An exit for a pid nobody tracks, racing the insert above.
        runner.core.handle_process_event(ProcessEvent::Exited {
            pid: u32::MAX,
            exit_code: Some(0),
        });

        assert_eq!(live_count(&runner), 1);
        assert_eq!(runner.running_count(), 1);
        let idle = tokio::time::timeout(Duration::from_millis(200), runner.wait_idle()).await;
        assert!(idle.is_err(), "wait_idle resolved with a live process");

        handle.kill().unwrap();
        tokio::time::timeout(Duration::from_secs(10), runner.wait_idle())
            .await
            .expect("killed process should be reported");
        assert_eq!(live_count(&runner), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_count_drops_after_exit_is_published() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        let spawned = spawn_sleeper(&runner);
        let pid = spawned.pid();
        runner.core.track(pid, Path::new("slow.bat"), spawned.handle());
        let handle = spawned.supervise();

        let during_publish = Arc::new(Mutex::new(None));
        {
            let seen = during_publish.clone();
            let core = Arc::downgrade(&runner.core);
            runner.subscribe(move |event| {
                if let (RunnerEvent::Exited { .. }, Some(core)) = (event, core.upgrade()) {
                    *seen.lock().unwrap() = Some(*core.live_count.borrow());
                }
            });
        }

        runner.core.handle_process_event(ProcessEvent::Exited {
            pid,
            exit_code: Some(0),
        });

        assert_eq!(*during_publish.lock().unwrap(), Some(1));
        assert_eq!(live_count(&runner), 0);
        assert_eq!(runner.running_count(), 0);

        // The real exit arrives later for an untracked pid and changes nothing.
        handle.kill().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(live_count(&runner), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reused_pid_replaces_stale_entry() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        let spawned = spawn_sleeper(&runner);
        let pid = spawned.pid();

        assert!(runner
            .core
            .track(pid, Path::new("first.bat"), spawned.handle())
            .is_none());
        let replaced = runner
            .core
            .track(pid, Path::new("second.bat"), spawned.handle())
            .expect("first entry should be displaced");

        assert_eq!(replaced.path, PathBuf::from("first.bat"));
        assert_eq!(live_count(&runner), 1);
        let running = runner.running_processes();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].path, PathBuf::from("second.bat"));

        spawned.supervise();
        runner.cancel_all(true);
        assert_eq!(live_count(&runner), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_with_nothing_running() {
        let runner = ScriptRunner::new(&RunnerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), runner.wait_idle())
            .await
            .expect("idle runner should resolve immediately");
    }
}
