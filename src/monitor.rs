//! Continuous probe monitor.
//!
//! A [`ProbeMonitor`] owns one [`ProbeState`] and one background tokio task.
//! The task runs the probe command, classifies each output line, records
//! success/failure timestamps, fires hooks, and restarts the command after a
//! fixed back-off whenever it exits. It never gives up on its own; only
//! [`ProbeMonitor::stop`] ends it.

use crate::classify::{LineClassifier, LineKind};
use crate::probe::{self, ProbeCommand, ProbeError};
use crate::state::{ProbeReader, ProbeState};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Longest probe output line; longer output is classified in chunks.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Lifecycle phase of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    /// Constructed, no background task yet.
    Idle,
    /// Background task is probing.
    Running,
    /// Stop requested, task is winding down.
    Stopping,
    /// Background task has exited.
    Stopped,
}

impl std::fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorPhase::Idle => "idle",
            MonitorPhase::Running => "running",
            MonitorPhase::Stopping => "stopping",
            MonitorPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to the owner of a monitor.
///
/// Probe failures are never reported here; they only show up as timestamps
/// and hook calls.
#[derive(Debug)]
pub enum MonitorError {
    /// `start()` was called on a monitor that is not idle.
    AlreadyStarted { phase: MonitorPhase },
    /// The background task panicked or was aborted.
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::AlreadyStarted { phase } => {
                write!(f, "probe monitor already started (phase: {})", phase)
            }
            MonitorError::Join { source } => {
                write!(f, "probe monitor task failed: {}", source)
            }
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::AlreadyStarted { .. } => None,
            MonitorError::Join { source } => Some(source),
        }
    }
}

/// Immutable settings for one monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub host: String,
    /// Passed to the probe command as `{timeout}`.
    pub timeout: Duration,
    /// Passed to the probe command as `{interval}`; also the restart back-off.
    pub interval: Duration,
    pub command: ProbeCommand,
    pub classifier: LineClassifier,
}

impl MonitorConfig {
    /// Config with the default `ping` command and markers.
    pub fn new(host: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
            interval,
            command: ProbeCommand::default(),
            classifier: LineClassifier::default(),
        }
    }

    pub fn with_command(mut self, command: ProbeCommand) -> Self {
        self.command = command;
        self
    }

    pub fn with_classifier(mut self, classifier: LineClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

type UpdateHook = Arc<dyn Fn() + Send + Sync>;
type RestartHook = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Optional observer callbacks. Absent hooks are skipped.
#[derive(Clone, Default)]
struct Hooks {
    on_update: Option<UpdateHook>,
    on_restart: Option<RestartHook>,
}

impl Hooks {
    fn update(&self) {
        if let Some(hook) = &self.on_update {
            hook();
        }
    }

    fn restart(&self, exit_code: Option<i32>) {
        if let Some(hook) = &self.on_restart {
            hook(exit_code);
        }
    }
}

/// Stop-request flag with its own lock, plus a wakeup for blocked waits.
#[derive(Debug, Default)]
struct StopFlag {
    requested: Mutex<bool>,
    notify: Notify,
}

impl StopFlag {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the flag. Returns `false` if it was already set.
    fn request(&self) -> bool {
        {
            let mut requested = self.lock();
            if *requested {
                return false;
            }
            *requested = true;
        }
        self.notify.notify_waiters();
        true
    }

    fn is_requested(&self) -> bool {
        *self.lock()
    }

    /// Resolves once the flag is set.
    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent request() is not missed
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

struct Shared {
    config: MonitorConfig,
    state: Arc<ProbeState>,
    stop: StopFlag,
    phase: Mutex<MonitorPhase>,
    /// Pid (and process group) of the probe currently running, if any.
    probe_pid: Mutex<Option<u32>>,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, MonitorPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe_pid(&self) -> MutexGuard<'_, Option<u32>> {
        self.probe_pid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publishes the running probe's pid for [`ProbeMonitor::kill_probe`] and
/// clears it when the cycle ends.
struct RunningProbe<'a>(&'a Shared);

impl<'a> RunningProbe<'a> {
    fn register(shared: &'a Shared, pid: Option<u32>) -> Self {
        *shared.probe_pid() = pid;
        Self(shared)
    }
}

impl Drop for RunningProbe<'_> {
    fn drop(&mut self) {
        *self.0.probe_pid() = None;
    }
}

/// Supervises one probe command against one host.
pub struct ProbeMonitor {
    shared: Arc<Shared>,
    hooks: Hooks,
}

impl ProbeMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Arc::new(ProbeState::new()),
                stop: StopFlag::default(),
                phase: Mutex::new(MonitorPhase::Idle),
                probe_pid: Mutex::new(None),
            }),
            hooks: Hooks::default(),
        }
    }

    /// Called after every state change: each classified line (banner
    /// included) and a non-zero probe exit.
    pub fn on_update(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_update = Some(Arc::new(hook));
        self
    }

    /// Called once per probe exit, after the back-off sleep, with the exit
    /// code (`None` if the probe was killed by a signal or never spawned).
    pub fn on_restart(mut self, hook: impl Fn(Option<i32>) + Send + Sync + 'static) -> Self {
        self.hooks.on_restart = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    /// Read-only handle to this monitor's state.
    pub fn reader(&self) -> ProbeReader {
        ProbeReader::new(Arc::clone(&self.shared.state))
    }

    pub fn phase(&self) -> MonitorPhase {
        *self.shared.phase()
    }

    /// Cloneable view of the phase, for status endpoints.
    pub fn phase_watch(&self) -> PhaseWatch {
        PhaseWatch {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the supervisor task. Must be called from within a tokio runtime.
    ///
    /// Only an idle monitor can be started; anything else returns
    /// [`MonitorError::AlreadyStarted`].
    pub fn start(&self) -> Result<MonitorHandle, MonitorError> {
        {
            let mut phase = self.shared.phase();
            if *phase != MonitorPhase::Idle {
                return Err(MonitorError::AlreadyStarted { phase: *phase });
            }
            *phase = MonitorPhase::Running;
        }

        let cfg = &self.shared.config;
        tracing::info!(
            host = %cfg.host,
            timeout_secs = cfg.timeout.as_secs_f64(),
            interval_secs = cfg.interval.as_secs_f64(),
            "starting probe monitor"
        );

        let join = tokio::spawn(supervise(Arc::clone(&self.shared), self.hooks.clone()));
        Ok(MonitorHandle { join: Some(join) })
    }

    /// Request cooperative shutdown. Kills a running probe command so a
    /// blocked line read unblocks. Idempotent; a no-op on idle or stopped
    /// monitors.
    pub fn stop(&self) {
        {
            let mut phase = self.shared.phase();
            match *phase {
                MonitorPhase::Running => *phase = MonitorPhase::Stopping,
                MonitorPhase::Stopping => {}
                MonitorPhase::Idle | MonitorPhase::Stopped => return,
            }
        }
        if self.shared.stop.request() {
            tracing::info!(host = %self.shared.config.host, "stop requested");
        }
    }

    /// SIGKILL the running probe's process group without waiting for it.
    ///
    /// For a hard exit where the supervisor task will not get to reap the
    /// probe. Returns `false` if no probe is running.
    pub fn kill_probe(&self) -> bool {
        match *self.shared.probe_pid() {
            Some(pid) => probe::kill_group(pid),
            None => false,
        }
    }
}

/// Read-only view of a monitor's phase.
#[derive(Clone)]
pub struct PhaseWatch {
    shared: Arc<Shared>,
}

impl PhaseWatch {
    pub fn get(&self) -> MonitorPhase {
        *self.shared.phase()
    }
}

/// Handle to the supervisor task returned by [`ProbeMonitor::start`].
#[derive(Debug)]
pub struct MonitorHandle {
    /// `None` once `join_timeout` has reaped the task.
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Wait for the task to finish.
    pub async fn join(self) -> Result<(), MonitorError> {
        match self.join {
            Some(join) => join.await.map_err(|e| MonitorError::Join { source: e }),
            None => Ok(()),
        }
    }

    /// Wait up to `limit`. Returns `Ok(true)` if the task finished in time,
    /// and on every call after that.
    pub async fn join_timeout(&mut self, limit: Duration) -> Result<bool, MonitorError> {
        let Some(join) = self.join.as_mut() else {
            return Ok(true);
        };
        let result = match tokio::time::timeout(limit, join).await {
            Ok(result) => result,
            Err(_) => return Ok(false),
        };
        self.join = None;
        result
            .map(|()| true)
            .map_err(|e| MonitorError::Join { source: e })
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Marks the monitor stopped when the supervisor task ends, including by
/// panic in a hook.
struct StoppedGuard<'a>(&'a Shared);

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        *self.0.phase() = MonitorPhase::Stopped;
    }
}

/// Outer loop: run probe cycles until stop is requested.
async fn supervise(shared: Arc<Shared>, hooks: Hooks) {
    let _stopped = StoppedGuard(&shared);
    let interval = shared.config.interval;
    let mut restarts: u64 = 0;

    while !shared.stop.is_requested() {
        let exit_code = probe_cycle(&shared, &hooks).await;
        if shared.stop.is_requested() {
            break;
        }

        tracing::info!(
            exit_code = ?exit_code,
            backoff_secs = interval.as_secs_f64(),
            "probe command stopped, restarting after back-off"
        );
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.stop.wait() => break,
        }

        restarts += 1;
        hooks.restart(exit_code);
    }

    tracing::info!(host = %shared.config.host, restarts, "probe monitor stopped");
}

/// How the line loop of a cycle ended.
enum CycleEnd {
    /// Probe closed its output.
    Eof,
    /// Stop was requested mid-cycle.
    Stopped,
}

/// Inner loop: one probe process from spawn to exit. Returns its exit code.
async fn probe_cycle(shared: &Shared, hooks: &Hooks) -> Option<i32> {
    let cfg = &shared.config;
    let mut child = match spawn_probe(cfg) {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(error = %e, host = %cfg.host, "probe command could not be started");
            shared.state.set_last_failure(Utc::now());
            hooks.update();
            return None;
        }
    };
    let _running = RunningProbe::register(shared, child.id());

    let end = match child.stdout.take() {
        Some(stdout) => read_lines(shared, hooks, stdout).await,
        None => {
            tracing::warn!(error = %ProbeError::MissingStdout, "probe output unavailable");
            CycleEnd::Eof
        }
    };

    let exit_code = match end {
        CycleEnd::Stopped => None,
        CycleEnd::Eof => wait_for_exit(shared, &mut child).await,
    };
    let exit_code = match exit_code {
        Some(code) => code,
        None => {
            let code = probe::terminate(&mut child).await;
            tracing::debug!(exit_code = ?code, "probe command terminated on stop");
            return code;
        }
    };

    if exit_code != Some(0) {
        tracing::debug!(exit_code = ?exit_code, "probe command exited unsuccessfully");
        shared.state.set_last_failure(Utc::now());
        hooks.update();
    }
    exit_code
}

fn spawn_probe(cfg: &MonitorConfig) -> Result<Child, ProbeError> {
    cfg.command.spawn(&cfg.host, cfg.timeout, cfg.interval)
}

/// Classify probe output line by line until EOF or stop.
async fn read_lines(
    shared: &Shared,
    hooks: &Hooks,
    stdout: tokio::process::ChildStdout,
) -> CycleEnd {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut first_line = true;

    loop {
        if shared.stop.is_requested() {
            return CycleEnd::Stopped;
        }

        buf.clear();
        let mut line_reader = (&mut reader).take(MAX_LINE_BYTES);
        let read = tokio::select! {
            read = line_reader.read_until(b'\n', &mut buf) => read,
            _ = shared.stop.wait() => return CycleEnd::Stopped,
        };

        match read {
            Ok(0) => return CycleEnd::Eof,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read probe output");
                return CycleEnd::Eof;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        let now = Utc::now();

        match shared.config.classifier.classify(line, first_line) {
            LineKind::Reply { rtt } => {
                tracing::debug!(rtt_ms = rtt.map(|d| d.as_secs_f64() * 1000.0), "probe reply");
                shared.state.set_last_success(now);
            }
            LineKind::Banner => {
                tracing::debug!(line, "probe banner");
            }
            LineKind::Failure => {
                tracing::debug!(line, "probe failure");
                shared.state.set_last_failure(now);
            }
        }
        first_line = false;
        hooks.update();
    }
}

/// Reap the probe after its output closed. Returns `None` if stop arrived
/// first (the probe closed stdout but kept running), otherwise the exit code.
async fn wait_for_exit(shared: &Shared, child: &mut Child) -> Option<Option<i32>> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shared.stop.wait() => return None,
    };
    match status {
        Ok(status) => {
            let code = status.code();
            tracing::info!(exit_code = ?code, "probe command exited");
            Some(code)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to wait for probe command");
            Some(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::is_never;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc;

    /// A fake probe: runs `script` with `sh -c`, `{host}` substituted.
    fn script_config(script: &str, interval: Duration) -> MonitorConfig {
        MonitorConfig::new("test-host", Duration::from_secs(1), interval).with_command(
            ProbeCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
        )
    }

    /// What the first `on_restart` call observed.
    #[derive(Debug)]
    struct RestartRecord {
        exit_code: Option<i32>,
        updates: usize,
        since_last_update: Duration,
    }

    struct Harness {
        monitor: ProbeMonitor,
        updates: Arc<AtomicUsize>,
        restarts: mpsc::UnboundedReceiver<RestartRecord>,
        update_events: mpsc::UnboundedReceiver<usize>,
    }

    fn harness(config: MonitorConfig) -> Harness {
        let updates = Arc::new(AtomicUsize::new(0));
        let last_update = Arc::new(Mutex::new(Instant::now()));
        let (restart_tx, restarts) = mpsc::unbounded_channel();
        let (update_tx, update_events) = mpsc::unbounded_channel();

        let monitor = ProbeMonitor::new(config)
            .on_update({
                let updates = Arc::clone(&updates);
                let last_update = Arc::clone(&last_update);
                move || {
                    let n = updates.fetch_add(1, Ordering::SeqCst) + 1;
                    *last_update.lock().unwrap() = Instant::now();
                    let _ = update_tx.send(n);
                }
            })
            .on_restart({
                let updates = Arc::clone(&updates);
                move |exit_code| {
                    let _ = restart_tx.send(RestartRecord {
                        exit_code,
                        updates: updates.load(Ordering::SeqCst),
                        since_last_update: last_update.lock().unwrap().elapsed(),
                    });
                }
            });

        Harness {
            monitor,
            updates,
            restarts,
            update_events,
        }
    }

    async fn shutdown(monitor: &ProbeMonitor, handle: MonitorHandle) {
        monitor.stop();
        tokio::time::timeout(Duration::from_secs(10), handle.join())
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(monitor.phase(), MonitorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_scenario_successful_replies_then_clean_exit() {
        let script = "echo 'PING {host} (127.0.0.1): 56 data bytes'; \
                      echo '64 bytes from 127.0.0.1: icmp_seq=0 time=10 ms'; \
                      echo '64 bytes from 127.0.0.1: icmp_seq=1 time=12 ms'; \
                      exit 0";
        let interval = Duration::from_millis(200);
        let mut h = harness(script_config(script, interval));
        let reader = h.monitor.reader();
        let started = Utc::now();

        let handle = h.monitor.start().unwrap();
        let record = tokio::time::timeout(Duration::from_secs(10), h.restarts.recv())
            .await
            .unwrap()
            .unwrap();

        // Banner + two replies; clean exit adds nothing
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.updates, 3);
        assert!(record.since_last_update >= interval);

        shutdown(&h.monitor, handle).await;
        assert!(reader.last_success() >= started);
        assert!(is_never(&reader.last_failure()));
    }

    #[tokio::test]
    async fn test_scenario_timeout_then_failing_exit() {
        let script = "echo 'PING {host}'; echo 'Request timeout for icmp_seq 0'; exit 1";
        let mut h = harness(script_config(script, Duration::from_millis(100)));
        let reader = h.monitor.reader();

        let handle = h.monitor.start().unwrap();
        let record = tokio::time::timeout(Duration::from_secs(10), h.restarts.recv())
            .await
            .unwrap()
            .unwrap();

        // Banner, timeout line, non-zero exit
        assert_eq!(record.exit_code, Some(1));
        assert_eq!(record.updates, 3);

        shutdown(&h.monitor, handle).await;
        assert!(is_never(&reader.last_success()));
        assert!(!is_never(&reader.last_failure()));
    }

    #[tokio::test]
    async fn test_exit_failure_updates_last_failure_after_lines() {
        // Reply line then a failing exit: the exit records a later failure
        let script = "echo '64 bytes time=1 ms'; sleep 0.05; exit 2";
        let mut h = harness(script_config(script, Duration::from_secs(30)));
        let reader = h.monitor.reader();

        let handle = h.monitor.start().unwrap();
        for expected in 1..=2 {
            let n = tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, expected);
        }

        // Sitting in the 30s back-off now
        let snap = reader.snapshot();
        assert!(snap.success().is_some());
        assert!(snap.failure().is_some());
        assert!(snap.last_failure >= snap.last_success);

        shutdown(&h.monitor, handle).await;
        assert!(h.restarts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restarts_forever_with_exact_exit_codes() {
        let mut h = harness(script_config("exit 3", Duration::from_millis(20)));
        let handle = h.monitor.start().unwrap();

        let mut previous_updates = 0;
        for _ in 0..3 {
            let record = tokio::time::timeout(Duration::from_secs(10), h.restarts.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.exit_code, Some(3));
            // One update per cycle, for the failing exit
            assert_eq!(record.updates, previous_updates + 1);
            previous_updates = record.updates;
        }

        shutdown(&h.monitor, handle).await;
    }

    #[tokio::test]
    async fn test_timestamps_are_monotonic_within_run() {
        let script = "echo PING; for i in 1 2 3 4 5; do echo 'time=1 ms'; echo 'lost'; done";
        let config = script_config(script, Duration::from_millis(20));
        let monitor = ProbeMonitor::new(config);
        let reader = monitor.reader();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let monitor = monitor.on_update({
            let seen = Arc::clone(&seen);
            let reader = reader.clone();
            move || seen.lock().unwrap().push(reader.snapshot())
        });

        let handle = monitor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown(&monitor, handle).await;

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 11);
        for pair in seen.windows(2) {
            assert!(pair[1].last_success >= pair[0].last_success);
            assert!(pair[1].last_failure >= pair[0].last_failure);
        }
    }

    #[tokio::test]
    async fn test_update_fires_after_mutation() {
        let monitor = ProbeMonitor::new(script_config(
            "echo 'time=5 ms'; sleep 30",
            Duration::from_secs(1),
        ));
        let reader = monitor.reader();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = monitor.on_update({
            let reader = reader.clone();
            move || {
                let _ = tx.send(reader.last_success());
            }
        });

        let handle = monitor.start().unwrap();
        let observed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!is_never(&observed));
        shutdown(&monitor, handle).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_counts_as_failed_exit() {
        let config = MonitorConfig::new("h", Duration::from_secs(1), Duration::from_millis(20))
            .with_command(ProbeCommand {
                program: "nonexistent-binary-xyz".to_string(),
                args: vec![],
            });
        let mut h = harness(config);
        let reader = h.monitor.reader();

        let handle = h.monitor.start().unwrap();
        let record = tokio::time::timeout(Duration::from_secs(10), h.restarts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.exit_code, None);
        assert_eq!(record.updates, 1);
        assert!(!is_never(&reader.last_failure()));

        // Still retrying
        let record = tokio::time::timeout(Duration::from_secs(10), h.restarts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.updates, 2);

        shutdown(&h.monitor, handle).await;
    }

    #[tokio::test]
    async fn test_stop_while_blocked_kills_probe() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("probe.pid");
        let script = format!(
            "echo $$ > {}; echo 'PING {{host}}'; exec sleep 30",
            pid_file.display()
        );
        let mut h = harness(script_config(&script, Duration::from_secs(1)));
        let reader = h.monitor.reader();

        let mut handle = h.monitor.start().unwrap();
        // Banner read; the probe now blocks without output
        let n = tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1);
        assert!(!handle.is_finished());

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let start = Instant::now();
        h.monitor.stop();
        assert!(handle.join_timeout(Duration::from_secs(5)).await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(h.monitor.phase(), MonitorPhase::Stopped);

        // Stopping is not a probe failure and does not restart
        assert!(is_never(&reader.last_failure()));
        assert_eq!(h.updates.load(Ordering::SeqCst), 1);
        assert!(h.restarts.try_recv().is_err());

        // Probe process was reaped
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
        assert!(alive.is_err());
    }

    #[tokio::test]
    async fn test_stop_during_backoff_skips_restart_hook() {
        let mut h = harness(script_config("exit 1", Duration::from_secs(30)));
        let mut handle = h.monitor.start().unwrap();

        // Exit update arrives, then the monitor sleeps the 30s back-off
        tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
            .await
            .unwrap()
            .unwrap();
        h.monitor.stop();

        assert!(handle.join_timeout(Duration::from_secs(5)).await.unwrap());
        assert!(h.restarts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(script_config("sleep 30", Duration::from_secs(1)));
        let handle = h.monitor.start().unwrap();
        assert_eq!(h.monitor.phase(), MonitorPhase::Running);

        h.monitor.stop();
        h.monitor.stop();
        let phase = h.monitor.phase();
        assert!(phase == MonitorPhase::Stopping || phase == MonitorPhase::Stopped);

        shutdown(&h.monitor, handle).await;
        h.monitor.stop();
        assert_eq!(h.monitor.phase(), MonitorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_idle_monitor_is_noop() {
        let monitor = ProbeMonitor::new(script_config("exit 0", Duration::from_secs(1)));
        monitor.stop();
        assert_eq!(monitor.phase(), MonitorPhase::Idle);

        // Still startable afterwards
        let handle = monitor.start().unwrap();
        shutdown(&monitor, handle).await;
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let monitor = ProbeMonitor::new(script_config("sleep 30", Duration::from_secs(1)));
        let handle = monitor.start().unwrap();

        let err = monitor.start().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::AlreadyStarted {
                phase: MonitorPhase::Running
            }
        ));
        assert!(err.to_string().contains("already started"));

        shutdown(&monitor, handle).await;
        assert!(matches!(
            monitor.start(),
            Err(MonitorError::AlreadyStarted {
                phase: MonitorPhase::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn test_join_timeout_reports_running_task() {
        let monitor = ProbeMonitor::new(script_config("sleep 30", Duration::from_secs(1)));
        let mut handle = monitor.start().unwrap();
        assert!(!handle.join_timeout(Duration::from_millis(50)).await.unwrap());
        shutdown(&monitor, handle).await;
    }

    #[tokio::test]
    async fn test_join_after_join_timeout_returns() {
        let monitor = ProbeMonitor::new(script_config("sleep 30", Duration::from_secs(1)));
        let mut handle = monitor.start().unwrap();
        monitor.stop();

        assert!(handle.join_timeout(Duration::from_secs(5)).await.unwrap());
        assert!(handle.is_finished());
        assert!(handle.join_timeout(Duration::from_millis(10)).await.unwrap());
        handle.join().await.unwrap();
        assert_eq!(monitor.phase(), MonitorPhase::Stopped);
    }

    #[tokio::test]
    async fn test_crlf_and_invalid_utf8_lines() {
        let script = r"printf 'PING {host}\r\n\377 64 bytes time=1 ms\r\n'; exec sleep 30";
        let mut h = harness(script_config(script, Duration::from_secs(1)));
        let reader = h.monitor.reader();

        let handle = h.monitor.start().unwrap();
        for expected in 1..=2 {
            let n = tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, expected);
        }

        // CRLF banner ignored, reply with a stray byte still a success
        assert!(!is_never(&reader.last_success()));
        assert!(is_never(&reader.last_failure()));
        shutdown(&h.monitor, handle).await;
    }

    #[tokio::test]
    async fn test_overlong_line_is_classified_in_chunks() {
        let script = r"printf 'PING {host}\n'; head -c 150000 /dev/zero | tr '\0' x; printf '\n64 bytes time=1 ms\n'; exec sleep 30";
        let mut h = harness(script_config(script, Duration::from_secs(1)));
        let reader = h.monitor.reader();

        let handle = h.monitor.start().unwrap();
        // Banner, three chunks of the 150000-byte line, then the reply
        for expected in 1..=5 {
            let n = tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, expected);
        }

        assert!(!is_never(&reader.last_failure()));
        assert!(reader.last_success() >= reader.last_failure());
        shutdown(&h.monitor, handle).await;
    }

    #[tokio::test]
    async fn test_kill_probe_takes_down_running_probe() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("probe.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let mut h = harness(script_config(&script, Duration::from_secs(30)));
        let reader = h.monitor.reader();
        assert!(!h.monitor.kill_probe());

        let handle = h.monitor.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let pid: i32 = loop {
            let content = std::fs::read_to_string(&pid_file).unwrap_or_default();
            if content.ends_with('\n') {
                break content.trim().parse().unwrap();
            }
            assert!(Instant::now() < deadline, "probe never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        assert!(h.monitor.kill_probe());

        // Killed by signal: recorded as a failed exit, then back-off
        let n = tokio::time::timeout(Duration::from_secs(10), h.update_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1);
        assert!(!is_never(&reader.last_failure()));
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
        assert!(alive.is_err());

        shutdown(&h.monitor, handle).await;
        assert!(!h.monitor.kill_probe());
    }

    #[tokio::test]
    async fn test_monitors_are_independent() {
        let ok = ProbeMonitor::new(script_config("echo 'time=1 ms'; sleep 30", Duration::from_secs(1)));
        let bad = ProbeMonitor::new(script_config("echo 'unreachable'; sleep 30", Duration::from_secs(1)));
        let (ok_reader, bad_reader) = (ok.reader(), bad.reader());

        let ok_handle = ok.start().unwrap();
        let bad_handle = bad.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while (is_never(&ok_reader.last_success()) || is_never(&bad_reader.last_failure()))
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!is_never(&ok_reader.last_success()));
        assert!(is_never(&ok_reader.last_failure()));
        assert!(is_never(&bad_reader.last_success()));
        assert!(!is_never(&bad_reader.last_failure()));

        shutdown(&ok, ok_handle).await;
        shutdown(&bad, bad_handle).await;
    }

    #[tokio::test]
    async fn test_monitor_without_hooks_runs() {
        let monitor = ProbeMonitor::new(script_config("echo 'time=1 ms'", Duration::from_millis(10)));
        let reader = monitor.reader();
        let handle = monitor.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while is_never(&reader.last_success()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!is_never(&reader.last_success()));
        shutdown(&monitor, handle).await;
    }

    #[tokio::test]
    async fn test_stop_flag_wait_after_request_returns() {
        let flag = StopFlag::default();
        assert!(flag.request());
        assert!(!flag.request());
        tokio::time::timeout(Duration::from_secs(1), flag.wait())
            .await
            .unwrap();
    }
}
