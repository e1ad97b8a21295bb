//! The JSON job file: the tasks to tune and, optionally, the graph they belong to.

use crate::graph::GraphDef;
use crate::space::SpaceError;
use crate::task::{Task, TaskDef, TaskSignature};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Job {
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub graph: Option<GraphDef>,
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("Cannot read job {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot parse job {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Task {name}: {source}")]
    Task { name: String, source: SpaceError },
    #[error("Task name {0} appears more than once")]
    DuplicateTask(String),
}

impl Job {
    pub fn load(path: &Path) -> Result<Self, JobError> {
        let contents = std::fs::read_to_string(path).map_err(|source| JobError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| JobError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Materialize every task's configuration space, in job order.
    pub fn tasks(&self) -> Result<Vec<Task>, JobError> {
        let mut seen = HashMap::new();
        self.tasks
            .iter()
            .map(|def| {
                if seen.insert(def.name.as_str(), ()).is_some() {
                    return Err(JobError::DuplicateTask(def.name.clone()));
                }
                Task::new(def.clone()).map_err(|source| JobError::Task {
                    name: def.name.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Task names to signatures, for resolving the graph's candidates.
    pub fn signatures(&self) -> HashMap<String, TaskSignature> {
        self.tasks
            .iter()
            .map(|def| (def.name.clone(), def.signature()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"{
        "tasks": [
            {"name": "conv0", "op": "conv2d", "knobs": [{"name": "tile", "values": [1, 2]}]},
            {"name": "dense0", "op": "dense", "knobs": []}
        ],
        "graph": {
            "name": "net",
            "conversion": 1.0,
            "nodes": [
                {"name": "conv0", "candidates": [{"implementation": "direct", "layout": "NCHW", "task": "conv0"}]},
                {"name": "dense0", "candidates": [{"implementation": "gemm", "layout": "NC", "task": "dense0"}]}
            ],
            "edges": [{"from": "conv0", "to": "dense0"}]
        }
    }"#;

    #[test]
    fn test_load_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, JOB).unwrap();
        let job = Job::load(&path).unwrap();
        let tasks = job.tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].space().size(), 1);
        assert_eq!(job.signatures()["conv0"], *tasks[0].signature());
        assert_eq!(job.graph.unwrap().edges.len(), 1);
    }

    #[test]
    fn test_bad_job_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, "{\"tasks\": 3}").unwrap();
        let err = Job::load(&path).unwrap_err();
        assert!(matches!(err, JobError::Parse { .. }));
        assert!(err.to_string().contains("job.json"));
    }

    #[test]
    fn test_identical_tasks_share_a_signature() {
        let mut job: Job = serde_json::from_str(JOB).unwrap();
        let mut twin = job.tasks[0].clone();
        twin.name = "conv1".to_string();
        job.tasks.push(twin);
        let signatures = job.signatures();
        assert_eq!(job.tasks().unwrap().len(), 3);
        assert_eq!(signatures["conv0"], signatures["conv1"]);
        assert_ne!(signatures["conv0"], signatures["dense0"]);
    }

    #[test]
    fn test_empty_knob_is_reported_per_task() {
        let mut job: Job = serde_json::from_str(JOB).unwrap();
        job.tasks[0].knobs[0].values.clear();
        assert!(matches!(job.tasks(), Err(JobError::Task { name, .. }) if name == "conv0"));
    }
}
