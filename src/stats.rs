//! Disk and network counter sampling.
//!
//! Counters are read into a [`CounterTree`]: branches are maps, leaves are
//! integer counts or text labels. Two samples of the same shape are
//! subtracted leaf by leaf with [`diff`] to get per-interval deltas.
//!
//! Disk counters come from `/proc/diskstats`, network counters from
//! `/sys/class/net/*/statistics/*`. Nothing here is used by the probe monitor.

use crate::config::StatsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Column names of `/proc/diskstats`, in order.
const DISK_STAT_FIELDS: [&str; 14] = [
    "major_number",
    "minor_number",
    "device_name",
    "reads_completed_successfully",
    "reads_merged",
    "sectors_read",
    "time_spent_reading",
    "writes_completed",
    "writes_merged",
    "sectors_written",
    "time_spent_writing",
    "ios_currently_in_progress",
    "time_spent_doing_ios",
    "weighted_time_spent_doing_ios",
];

const DEVICE_NAME_COLUMN: usize = 2;

pub type CounterTree = BTreeMap<String, CounterNode>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CounterNode {
    Branch(CounterTree),
    Count(i64),
    Label(String),
}

#[derive(Debug)]
pub enum StatsError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            StatsError::Parse {
                path,
                line,
                message,
            } => write!(f, "{}:{}: {}", path.display(), line, message),
            StatsError::Pattern { pattern, source } => {
                write!(f, "invalid glob pattern {}: {}", pattern, source)
            }
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Read { source, .. } => Some(source),
            StatsError::Pattern { source, .. } => Some(source),
            StatsError::Parse { .. } => None,
        }
    }
}

/// Element-wise `new - old`.
///
/// Branches are recursed into, integer leaves subtracted, and a count with no
/// counterpart in `old` yields 0. Labels (and any non-integer leaf) are copied
/// from `new`. A branch missing from `old` is diffed against an empty tree.
pub fn diff(old: &CounterTree, new: &CounterTree) -> CounterTree {
    let empty = CounterTree::new();
    new.iter()
        .map(|(key, value)| {
            let delta = match value {
                CounterNode::Branch(new_branch) => {
                    let old_branch = match old.get(key) {
                        Some(CounterNode::Branch(b)) => b,
                        _ => &empty,
                    };
                    CounterNode::Branch(diff(old_branch, new_branch))
                }
                CounterNode::Count(new_count) => match old.get(key) {
                    Some(CounterNode::Count(old_count)) => {
                        CounterNode::Count(new_count.wrapping_sub(*old_count))
                    }
                    _ => CounterNode::Count(0),
                },
                CounterNode::Label(label) => CounterNode::Label(label.clone()),
            };
            (key.clone(), delta)
        })
        .collect()
}

/// Parse `/proc/diskstats` contents into `device -> {field -> value}`.
pub fn parse_disk_stats(path: &Path, content: &str) -> Result<CounterTree, StatsError> {
    let mut devices = CounterTree::new();

    for (index, line) in content.lines().enumerate() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.is_empty() {
            continue;
        }
        if columns.len() <= DEVICE_NAME_COLUMN {
            return Err(StatsError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                message: format!("expected at least 3 columns, found {}", columns.len()),
            });
        }

        let mut device = CounterTree::new();
        for (column, value) in columns.iter().enumerate() {
            let name = DISK_STAT_FIELDS
                .get(column)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("field_{}", column));
            let node = if column == DEVICE_NAME_COLUMN {
                CounterNode::Label(value.to_string())
            } else {
                let count = value.parse::<i64>().map_err(|e| StatsError::Parse {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: format!("{}: {:?}: {}", name, value, e),
                })?;
                CounterNode::Count(count)
            };
            device.insert(name, node);
        }
        devices.insert(
            columns[DEVICE_NAME_COLUMN].to_string(),
            CounterNode::Branch(device),
        );
    }

    Ok(devices)
}

pub fn read_disk_stats(path: &Path) -> Result<CounterTree, StatsError> {
    let content = std::fs::read_to_string(path).map_err(|e| StatsError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_disk_stats(path, &content)
}

/// Read `<class_dir>/<iface>/statistics/<stat>` into `iface -> {stat -> value}`.
///
/// Stat files that cannot be read or parsed are skipped.
pub fn read_network_stats(class_dir: &Path) -> Result<CounterTree, StatsError> {
    let pattern = format!("{}/*/statistics/*", class_dir.display());
    let paths = glob::glob(&pattern).map_err(|e| StatsError::Pattern {
        pattern: pattern.clone(),
        source: e,
    })?;

    let mut interfaces = CounterTree::new();
    for entry in paths {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable network stat entry");
                continue;
            }
        };
        let (Some(stat), Some(iface)) = (
            path.file_name().and_then(|n| n.to_str()),
            path.parent()
                .and_then(|p| p.parent())
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str()),
        ) else {
            continue;
        };

        let value = match std::fs::read_to_string(&path) {
            Ok(content) => content.lines().next().unwrap_or("").trim().parse::<i64>(),
            Err(e) => {
                tracing::debug!(error = %e, path = %path.display(), "skipping network stat");
                continue;
            }
        };
        let value = match value {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, path = %path.display(), "skipping non-numeric network stat");
                continue;
            }
        };

        let entry = interfaces
            .entry(iface.to_string())
            .or_insert_with(|| CounterNode::Branch(CounterTree::new()));
        if let CounterNode::Branch(stats) = entry {
            stats.insert(stat.to_string(), CounterNode::Count(value));
        }
    }

    Ok(interfaces)
}

/// Read every configured counter source: `{"storage": .., "network": ..}`.
pub fn read_counters(config: &StatsConfig) -> Result<CounterTree, StatsError> {
    let mut tree = CounterTree::new();
    tree.insert(
        "storage".to_string(),
        CounterNode::Branch(read_disk_stats(&config.diskstats_path)?),
    );
    tree.insert(
        "network".to_string(),
        CounterNode::Branch(read_network_stats(&config.net_class_dir)?),
    );
    Ok(tree)
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub taken_at: DateTime<Utc>,
    pub values: CounterTree,
}

/// Keeps the latest and previous counter samples.
pub struct StatsSampler {
    config: StatsConfig,
    previous: Option<Sample>,
    current: Sample,
}

impl StatsSampler {
    /// Take the initial sample.
    pub fn new(config: StatsConfig) -> Result<Self, StatsError> {
        let current = Sample {
            taken_at: Utc::now(),
            values: read_counters(&config)?,
        };
        Ok(Self {
            config,
            previous: None,
            current,
        })
    }

    /// Take a new sample; the current one becomes the previous.
    pub fn update(&mut self) -> Result<(), StatsError> {
        let sample = Sample {
            taken_at: Utc::now(),
            values: read_counters(&self.config)?,
        };
        self.previous = Some(std::mem::replace(&mut self.current, sample));
        Ok(())
    }

    pub fn current(&self) -> &Sample {
        &self.current
    }

    /// Time between the two latest samples, `None` before the first update.
    pub fn time_delta(&self) -> Option<chrono::Duration> {
        self.previous
            .as_ref()
            .map(|prev| self.current.taken_at - prev.taken_at)
    }

    /// Counter deltas between the two latest samples. Before the first
    /// update every count is 0.
    pub fn values_delta(&self) -> CounterTree {
        match &self.previous {
            Some(prev) => diff(&prev.values, &self.current.values),
            None => diff(&CounterTree::new(), &self.current.values),
        }
    }
}
