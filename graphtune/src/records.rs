//! Append-only, human-readable record logs.
//!
//! A log is a file of JSON lines. Each [AppendLog::append] writes one whole line under a mutex
//! and syncs it before returning, so concurrent sessions may share a log and a reader never sees
//! part of a record. Malformed lines, including a final line with no newline, are reported as
//! [LogError::Corrupt] rather than skipped.

use crate::common::{unix_timestamp, Aggregation, CostSecs};
use crate::measure::MeasureResult;
use crate::space::ConfigIdx;
use crate::task::TaskSignature;

use log::info;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const TEMP_LOG_NAME: &str = "log.jsonl";

/// One kernel measurement, as persisted.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TuningRecord {
    pub task: TaskSignature,
    pub config: ConfigIdx,
    #[serde(flatten)]
    pub result: MeasureResult,
    pub timestamp: f64,
}

pub struct AppendLog<R> {
    location: LogLocation,
    file: Mutex<File>,
    _records: PhantomData<fn() -> R>,
}

/// The kernel-level log.
pub type KernelLog = AppendLog<TuningRecord>;

enum LogLocation {
    Persisted(PathBuf),
    TempDir(tempfile::TempDir),
}

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Corrupt record at {}:{line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Cannot serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TuningRecord {
    /// A record of `result`, stamped with the current time.
    pub fn new(task: TaskSignature, config: ConfigIdx, result: MeasureResult) -> Self {
        TuningRecord {
            task,
            config,
            result,
            timestamp: unix_timestamp(),
        }
    }

    pub fn cost(&self) -> Option<CostSecs> {
        self.result.cost()
    }
}

impl LogLocation {
    fn path(&self) -> PathBuf {
        match self {
            LogLocation::Persisted(path) => path.clone(),
            LogLocation::TempDir(dir) => dir.path().join(TEMP_LOG_NAME),
        }
    }
}

impl<R: Serialize + DeserializeOwned> AppendLog<R> {
    /// Open the log at `path`, creating it if needed. With no path, the log lives in a temporary
    /// directory removed when the log is dropped.
    ///
    /// Fails with [LogError::Corrupt] if an existing file ends in a partial record, since
    /// appending after it would merge two records into one line.
    pub fn open(path: Option<&Path>) -> Result<Self, LogError> {
        let location = match path {
            Some(path) => LogLocation::Persisted(path.to_owned()),
            None => LogLocation::TempDir(tempfile::tempdir().map_err(|source| LogError::Io {
                path: std::env::temp_dir(),
                source,
            })?),
        };
        let path = location.path();
        let io_err = |source| LogError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if len > 0 {
            let mut last = [0u8];
            file.seek(SeekFrom::Start(len - 1)).map_err(io_err)?;
            file.read_exact(&mut last).map_err(io_err)?;
            if last[0] != b'\n' {
                // Fails, naming the torn line.
                read_records::<R>(&path)?;
            }
        }
        info!("Opening log at: {}", path.display());

        Ok(AppendLog {
            location,
            file: Mutex::new(file),
            _records: PhantomData,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.location.path()
    }

    /// Append one record. The record is on disk when this returns.
    pub fn append(&self, record: &R) -> Result<(), LogError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock();
        let io_err = |source| LogError::Io {
            path: self.path(),
            source,
        };
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }

    /// Every record, in append order.
    pub fn load(&self) -> Result<Vec<R>, LogError> {
        // Holding the lock keeps concurrent appends from exposing half-written lines.
        let _guard = self.file.lock();
        read_records(&self.path())
    }
}

impl KernelLog {
    /// The records for one task, in append order.
    pub fn load_task(&self, task: &TaskSignature) -> Result<Vec<TuningRecord>, LogError> {
        let mut records = self.load()?;
        records.retain(|r| &r.task == task);
        Ok(records)
    }

    /// The successful record with the lowest cost, or `None` if no measurement succeeded.
    pub fn best(&self, task: &TaskSignature) -> Result<Option<TuningRecord>, LogError> {
        Ok(best_of(&self.load_task(task)?).cloned())
    }

    /// The configuration with the lowest cost after reducing its repeated measurements with
    /// `aggregation`.
    pub fn best_aggregated(
        &self,
        task: &TaskSignature,
        aggregation: Aggregation,
    ) -> Result<Option<(ConfigIdx, CostSecs)>, LogError> {
        let records = self.load_task(task)?;
        Ok(aggregate_by_config(&records, aggregation)
            .into_iter()
            .reduce(|best, c| if c.1 < best.1 { c } else { best }))
    }

    pub fn best_by_task(&self) -> Result<BTreeMap<TaskSignature, Option<TuningRecord>>, LogError> {
        Ok(best_by_task(&self.load()?))
    }
}

/// Read a log file without opening it for appending.
pub fn read_records<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, LogError> {
    let contents = fs::read_to_string(path).map_err(|source| LogError::Io {
        path: path.to_owned(),
        source,
    })?;
    let mut records = Vec::new();
    let mut rest = contents.as_str();
    let mut line_no = 0;
    while !rest.is_empty() {
        line_no += 1;
        let Some(end) = rest.find('\n') else {
            return Err(LogError::Corrupt {
                path: path.to_owned(),
                line: line_no,
                reason: "missing newline after final record".to_string(),
            });
        };
        let line = rest[..end].trim();
        rest = &rest[end + 1..];
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| LogError::Corrupt {
            path: path.to_owned(),
            line: line_no,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// The successful record with the lowest cost. Ties go to the earliest record.
pub fn best_of<'a, I>(records: I) -> Option<&'a TuningRecord>
where
    I: IntoIterator<Item = &'a TuningRecord>,
{
    records
        .into_iter()
        .filter_map(|r| r.cost().map(|c| (r, c)))
        .reduce(|best, next| if next.1 < best.1 { next } else { best })
        .map(|(r, _)| r)
}

/// The aggregated cost of every configuration with at least one success, in order of first
/// appearance.
pub fn aggregate_by_config(
    records: &[TuningRecord],
    aggregation: Aggregation,
) -> Vec<(ConfigIdx, CostSecs)> {
    let mut order = Vec::new();
    let mut samples: HashMap<ConfigIdx, Vec<CostSecs>> = HashMap::new();
    for record in records {
        if let Some(cost) = record.cost() {
            samples
                .entry(record.config)
                .or_insert_with(|| {
                    order.push(record.config);
                    Vec::new()
                })
                .push(cost);
        }
    }
    order
        .into_iter()
        .filter_map(|config| {
            let cost = aggregation.apply(&samples[&config])?;
            Some((config, cost))
        })
        .collect()
}

/// The best record of every task that appears in `records`; `None` for tasks with only failures.
pub fn best_by_task(records: &[TuningRecord]) -> BTreeMap<TaskSignature, Option<TuningRecord>> {
    let mut by_task: BTreeMap<&TaskSignature, Vec<&TuningRecord>> = BTreeMap::new();
    for record in records {
        by_task.entry(&record.task).or_default().push(record);
    }
    by_task
        .into_iter()
        .map(|(task, rs)| (task.clone(), best_of(rs).cloned()))
        .collect()
}
