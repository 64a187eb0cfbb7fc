/// Probe command lifecycle: build the argument list from a template, spawn the
/// probe subprocess with piped stdout, and tear down its process group.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// How long a stopped probe gets to exit after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Program and argument template for the external probe.
///
/// Arguments may contain `{host}`, `{timeout}` and `{interval}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ProbeCommand {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
            args: vec![
                "-i".to_string(),
                "{interval}".to_string(),
                "-t".to_string(),
                "{timeout}".to_string(),
                "{host}".to_string(),
            ],
        }
    }
}

/// Errors that can occur when launching the probe.
#[derive(Debug)]
pub enum ProbeError {
    /// Failed to spawn the probe subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The child was spawned without a stdout pipe.
    MissingStdout,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Spawn { program, source } => {
                write!(f, "failed to spawn probe command {}: {}", program, source)
            }
            ProbeError::MissingStdout => write!(f, "probe command has no stdout pipe"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn { source, .. } => Some(source),
            ProbeError::MissingStdout => None,
        }
    }
}

/// Render a duration the way probe tools take it on the command line:
/// whole seconds as integers, sub-second values as decimals.
pub fn format_secs(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        let s = format!("{:.3}", d.as_secs_f64());
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

impl ProbeCommand {
    /// Build the argument list, substituting the placeholders.
    pub fn build_args(&self, host: &str, timeout: Duration, interval: Duration) -> Vec<String> {
        let timeout = format_secs(timeout);
        let interval = format_secs(interval);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{host}", host)
                    .replace("{timeout}", &timeout)
                    .replace("{interval}", &interval)
            })
            .collect()
    }

    /// Human-readable command line, for logs and `--dry-run`.
    pub fn render(&self, host: &str, timeout: Duration, interval: Duration) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.build_args(host, timeout, interval));
        parts.join(" ")
    }

    /// Spawn the probe with stdout piped and stderr discarded.
    ///
    /// The child gets its own process group so [`terminate`] can take down
    /// anything it forks, and is killed if its handle is dropped.
    pub fn spawn(
        &self,
        host: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Child, ProbeError> {
        let args = self.build_args(host, timeout, interval);
        tracing::debug!(command = %self.program, args = ?args, "spawning probe command");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        tracing::info!(pid = child.id().unwrap_or(0), host, "probe command started");
        Ok(child)
    }
}

/// SIGKILL the probe's process group. Returns `false` if the signal could
/// not be delivered (the group is already gone).
pub fn kill_group(pid: u32) -> bool {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            tracing::warn!(pid, "killed probe process group");
            true
        }
        Err(e) => {
            tracing::debug!(pid, error = %e, "failed to kill probe process group");
            false
        }
    }
}

/// Stop a running probe: SIGTERM its process group, wait briefly, then
/// SIGKILL. Returns the exit code once the child has been reaped.
pub async fn terminate(child: &mut Child) -> Option<i32> {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "failed to signal probe process group");
        }
    }

    let status = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("probe ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill probe command");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap probe command");
            None
        }
    }
}
