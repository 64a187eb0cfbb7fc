/// Last-ping file: `<last_success>\t<last_failure>` as Unix seconds.
///
/// Rewritten after every monitor hook. Writes go to a temp file in the same
/// directory which is then renamed over the target, so external readers never
/// see a partial record. The never-happened sentinel is written as `0`.
use crate::state::{is_never, ProbeSnapshot, NEVER};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Mode of a newly created last-ping file: readable by other users.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Errors from reading, writing or locking the last-ping file.
#[derive(Debug)]
pub enum OutputError {
    /// Failed to create or write the temp file.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to rename the temp file over the target.
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to read the file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// File contents are not a valid record.
    Parse { content: String },
    /// Another process holds the output lock.
    Locked { path: PathBuf },
    /// Failed to open or lock the lock file.
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::Write { path, source } => {
                write!(f, "failed to write temp file for {}: {}", path.display(), source)
            }
            OutputError::Persist { path, source } => {
                write!(f, "failed to replace {}: {}", path.display(), source)
            }
            OutputError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            OutputError::Parse { content } => {
                write!(f, "invalid last-ping record: {:?}", content)
            }
            OutputError::Locked { path } => {
                write!(
                    f,
                    "output is locked by another last-ping process ({})",
                    path.display()
                )
            }
            OutputError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Write { source, .. }
            | OutputError::Persist { source, .. }
            | OutputError::Read { source, .. }
            | OutputError::Lock { source, .. } => Some(source),
            OutputError::Parse { .. } | OutputError::Locked { .. } => None,
        }
    }
}

/// Format a timestamp as Unix seconds with a microsecond fraction.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    if is_never(ts) {
        return "0".to_string();
    }
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}

/// Parse a timestamp written by [`format_timestamp`] (or any decimal seconds).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let (secs, frac) = match s.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (s, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Right-pad / truncate the fraction to nanoseconds
    let mut digits: String = frac.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits.parse().ok()?;
    if secs == 0 && nanos == 0 {
        return Some(NEVER);
    }
    DateTime::from_timestamp(secs, nanos)
}

/// Render a record line.
pub fn format_record(snapshot: &ProbeSnapshot) -> String {
    format!(
        "{}\t{}",
        format_timestamp(&snapshot.last_success),
        format_timestamp(&snapshot.last_failure)
    )
}

/// Parse a record line.
pub fn parse_record(content: &str) -> Result<ProbeSnapshot, OutputError> {
    let parse_err = || OutputError::Parse {
        content: content.to_string(),
    };
    let mut fields = content.trim_end_matches(['\n', '\r']).split('\t');
    let success = fields.next().and_then(parse_timestamp).ok_or_else(parse_err)?;
    let failure = fields.next().and_then(parse_timestamp).ok_or_else(parse_err)?;
    if fields.next().is_some() {
        return Err(parse_err());
    }
    Ok(ProbeSnapshot {
        last_success: success,
        last_failure: failure,
    })
}

/// The last-ping output file.
#[derive(Debug, Clone)]
pub struct LastPingFile {
    path: PathBuf,
}

impl LastPingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically overwrite the file with `snapshot`.
    ///
    /// An existing file keeps its mode; a new one is created with
    /// [`DEFAULT_FILE_MODE`].
    pub fn write(&self, snapshot: &ProbeSnapshot) -> Result<(), OutputError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let write_err = |source| OutputError::Write {
            path: self.path.clone(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".last-ping.tmp.")
            .tempfile_in(dir)
            .map_err(write_err)?;
        tmp.write_all(format_record(snapshot).as_bytes())
            .map_err(write_err)?;
        tmp.flush().map_err(write_err)?;

        let mode = std::fs::metadata(&self.path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(DEFAULT_FILE_MODE);
        tmp.as_file()
            .set_permissions(Permissions::from_mode(mode))
            .map_err(write_err)?;

        tmp.persist(&self.path).map_err(|e| OutputError::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    pub fn read(&self) -> Result<ProbeSnapshot, OutputError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| OutputError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        parse_record(&content)
    }
}

/// Exclusive advisory lock on `<output>.lock`, held for the life of a
/// monitor so two processes never write the same file.
///
/// The lock file is never unlinked, only unlocked.
#[derive(Debug)]
pub struct OutputLock {
    file: File,
    path: PathBuf,
}

impl OutputLock {
    pub fn lock_path(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock without blocking.
    pub fn acquire(output: &Path) -> Result<Self, OutputError> {
        let path = Self::lock_path(output);
        let file = File::create(&path).map_err(|e| OutputError::Lock {
            path: path.clone(),
            source: e,
        })?;
        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                OutputError::Locked { path: path.clone() }
            } else {
                OutputError::Lock {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;
        tracing::debug!(path = %path.display(), "acquired output lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to release output lock");
        }
    }
}
