//! Job descriptors: what a submission asks for.
//!
//! A [`JobSpec`] is the mutable, client-side form of a submission (it is what
//! the submit-file parser and the HTTP API produce). The scheduler validates
//! a spec and freezes it into a [`JobDescriptor`], which is never mutated
//! afterwards and is shared behind an `Arc`.

pub mod submit_file;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CondorError, Result};

pub use submit_file::{parse_size, parse_submit_file, SubmitFileError, MAX_PROCESSES_PER_FILE};

/// Key/value tags used both as worker labels and as job constraints.
pub type Labels = BTreeMap<String, String>;

/// The resource vocabulary shared by requests, grants and worker capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub disk_bytes: u64,
}

impl Resources {
    pub const fn new(gpus: u32, cpus: u32, memory_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            gpus,
            cpus,
            memory_bytes,
            disk_bytes,
        }
    }

    /// True if every dimension of `self` is no larger than `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.gpus <= other.gpus
            && self.cpus <= other.cpus
            && self.memory_bytes <= other.memory_bytes
            && self.disk_bytes <= other.disk_bytes
    }

    /// Per-dimension subtraction, `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            gpus: self.gpus.checked_sub(other.gpus)?,
            cpus: self.cpus.checked_sub(other.cpus)?,
            memory_bytes: self.memory_bytes.checked_sub(other.memory_bytes)?,
            disk_bytes: self.disk_bytes.checked_sub(other.disk_bytes)?,
        })
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            gpus: self.gpus.saturating_sub(other.gpus),
            cpus: self.cpus.saturating_sub(other.cpus),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            gpus: self.gpus.saturating_add(other.gpus),
            cpus: self.cpus.saturating_add(other.cpus),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
        }
    }

    /// Ordering key for "how much is left". GPUs are the scarcest dimension and
    /// compare first.
    pub fn headroom_key(&self) -> (u32, u32, u64, u64) {
        (self.gpus, self.cpus, self.memory_bytes, self.disk_bytes)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gpus={} cpus={} memory={}B disk={}B",
            self.gpus, self.cpus, self.memory_bytes, self.disk_bytes
        )
    }
}

/// A location inside the artifact store, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Store location of an output file produced by one process of a cluster.
    pub fn output(cluster_id: u64, process_id: u32, name: &str) -> Self {
        Self(format!("outputs/{}/{}/{}", cluster_id, process_id, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component, used as the file name inside a scratch directory.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true for non-empty relative paths that stay below their root.
pub fn is_contained_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// A submission before the scheduler accepts it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub input_artifact: Option<String>,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default)]
    pub stdout_artifact: Option<String>,
    #[serde(default)]
    pub stderr_artifact: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub labels: Labels,
    /// Filled in by the scheduler when absent.
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(default)]
    pub process_id: u32,
}

const CLUSTER_MACROS: [&str; 2] = ["$(Cluster)", "$(ClusterId)"];

impl JobSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, artifact: impl Into<String>) -> Self {
        self.input_artifact = Some(artifact.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_artifacts.push(name.into());
        self
    }

    pub fn with_batch(mut self, cluster_id: u64, process_id: u32) -> Self {
        self.cluster_id = Some(cluster_id);
        self.process_id = process_id;
        self
    }

    /// Bind the cluster id and substitute `$(Cluster)` everywhere it appears.
    pub fn bind_cluster(&mut self, cluster_id: u64) {
        self.cluster_id = Some(cluster_id);
        let id = cluster_id.to_string();
        let expand = |s: &mut String| {
            for m in CLUSTER_MACROS {
                if s.contains(m) {
                    *s = s.replace(m, &id);
                }
            }
        };

        for arg in &mut self.command {
            expand(arg);
        }
        for name in &mut self.output_artifacts {
            expand(name);
        }
        for value in self.labels.values_mut() {
            expand(value);
        }
        for slot in [
            &mut self.input_artifact,
            &mut self.stdout_artifact,
            &mut self.stderr_artifact,
        ] {
            if let Some(s) = slot.as_mut() {
                expand(s);
            }
        }
    }

    /// Check the spec against the configured per-job caps.
    pub fn validate(&self, caps: &Resources) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(CondorError::InvalidRequest("image must not be empty".into()));
        }

        let r = &self.resources;
        if r.cpus == 0 {
            return Err(CondorError::InvalidRequest("cpus must be positive".into()));
        }
        if r.memory_bytes == 0 {
            return Err(CondorError::InvalidRequest(
                "memory_bytes must be positive".into(),
            ));
        }
        if r.disk_bytes == 0 {
            return Err(CondorError::InvalidRequest(
                "disk_bytes must be positive".into(),
            ));
        }
        if !r.fits_within(caps) {
            return Err(CondorError::InvalidRequest(format!(
                "request ({}) exceeds configured caps ({})",
                r, caps
            )));
        }

        if let Some(input) = &self.input_artifact {
            if !is_contained_path(input) {
                return Err(CondorError::InvalidRequest(format!(
                    "input artifact {:?} must be a relative path inside the store",
                    input
                )));
            }
        }

        let named_outputs = self
            .output_artifacts
            .iter()
            .chain(self.stdout_artifact.iter())
            .chain(self.stderr_artifact.iter());
        let mut seen = std::collections::HashSet::new();
        for name in named_outputs {
            if !is_contained_path(name) {
                return Err(CondorError::InvalidRequest(format!(
                    "output artifact {:?} must be a relative path",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(CondorError::InvalidRequest(format!(
                    "output artifact {:?} is declared twice",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// The immutable, accepted form of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: Uuid,
    pub image: String,
    pub command: Vec<String>,
    pub input_artifact: Option<ArtifactRef>,
    pub output_artifacts: Vec<String>,
    pub stdout_artifact: Option<String>,
    pub stderr_artifact: Option<String>,
    pub resources: Resources,
    pub labels: Labels,
    pub cluster_id: u64,
    pub process_id: u32,
    pub submitted_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Freeze a validated spec. The spec must already be bound to a cluster.
    pub fn from_spec(id: Uuid, spec: JobSpec, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            image: spec.image,
            command: spec.command,
            input_artifact: spec.input_artifact.map(ArtifactRef::new),
            output_artifacts: spec.output_artifacts,
            stdout_artifact: spec.stdout_artifact,
            stderr_artifact: spec.stderr_artifact,
            resources: spec.resources,
            labels: spec.labels,
            cluster_id: spec.cluster_id.unwrap_or_default(),
            process_id: spec.process_id,
            submitted_at,
        }
    }

    pub fn output_ref(&self, name: &str) -> ArtifactRef {
        ArtifactRef::output(self.cluster_id, self.process_id, name)
    }

    /// `cluster.process`, the way batch schedulers print job ids.
    pub fn batch_id(&self) -> String {
        format!("{}.{}", self.cluster_id, self.process_id)
    }
}
