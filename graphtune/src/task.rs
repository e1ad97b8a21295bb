use crate::common::TargetId;
use crate::space::{ConfigurationSpace, Knob, SpaceError};

use adler::Adler32;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Stable identity of a [Task], as written to the kernel log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TaskSignature(String);

/// The description of a kernel, as supplied by whatever partitioned the graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub shapes: Vec<Vec<u32>>,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default)]
    pub target: TargetId,
    pub knobs: Vec<Knob>,
    /// C source defining `void kernel(void)`. Knob values are visible to it as `KNOB_*` macros.
    #[serde(default)]
    pub source: Option<String>,
}

/// One kernel's tuning problem. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Task {
    name: String,
    signature: TaskSignature,
    space: ConfigurationSpace,
    target: TargetId,
    source: Option<String>,
}

impl TaskSignature {
    pub fn new(s: impl Into<String>) -> Self {
        TaskSignature(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TaskDef {
    /// The signature depends on everything that affects measured cost (op, shapes, dtype,
    /// target, knobs and source) but not on the human-readable name.
    ///
    /// The digest is the Adler-32 of the compact JSON array of those fields, so it is the same
    /// across builds and toolchains and can key records in a log that outlives the process.
    pub fn signature(&self) -> TaskSignature {
        let canonical = (
            &self.op,
            &self.shapes,
            &self.dtype,
            &self.target,
            &self.knobs,
            &self.source,
        );
        // Strings, integers and sequences always serialize.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Adler32::new();
        hasher.write_slice(&bytes);
        TaskSignature(format!("{}-{:08x}", self.op, hasher.checksum()))
    }
}

impl Task {
    pub fn new(def: TaskDef) -> Result<Self, SpaceError> {
        let signature = def.signature();
        let space = ConfigurationSpace::new(def.knobs)?;
        Ok(Task {
            name: def.name,
            signature,
            space,
            target: def.target,
            source: def.source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &TaskSignature {
        &self.signature
    }

    pub fn space(&self) -> &ConfigurationSpace {
        &self.space
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.signature)
    }
}

fn default_dtype() -> String {
    "float32".to_string()
}

#[cfg(test)]
pub(crate) fn test_task(name: &str, knobs: Vec<Knob>) -> Task {
    Task::new(TaskDef {
        name: name.to_string(),
        op: "conv2d".to_string(),
        shapes: vec![vec![1, 3, 224, 224], vec![32, 3, 3, 3]],
        dtype: default_dtype(),
        target: TargetId::X86,
        knobs,
        source: None,
    })
    .unwrap()
}
