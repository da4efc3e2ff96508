use bincode::Options;
use common::config::engine::MAX_RESULT_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Blob, TAG_BATCH_DONE};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed protocol record: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("record tag {0:#x} collides with the batch-done marker")]
    ReservedTag(u64),
}

/// one input to execute, tagged with its batch sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub seq: u64,
    pub input: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStats {
    pub wall_micros: u64,
    pub cpu_micros: u64,
    pub peak_rss: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Crash,
    Hang,
    Oom,
    Leak,
    /// synthetic marker for inputs swallowed by a mid-batch target death
    CrashOrHang,
}

impl FailureKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Crash => "crash",
            Self::Hang => "hang",
            Self::Oom => "oom",
            Self::Leak => "leak",
            Self::CrashOrHang => "crash-or-hang",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub diagnostic: String,
}

/// per-input outcome: encoded feature set, resource stats and an optional
/// failure marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub seq: u64,
    /// feature set in its wire encoding, decoded by the engine
    pub features: Vec<u8>,
    pub stats: ExecStats,
    pub failure: Option<Failure>,
}

impl ExecutionResult {
    /// synthetic result for an input whose real result never arrived
    pub fn synthetic_failure(seq: u64, kind: FailureKind, diagnostic: impl Into<String>) -> Self {
        Self {
            seq,
            features: vec![],
            stats: ExecStats::default(),
            failure: Some(Failure {
                kind,
                diagnostic: diagnostic.into(),
            }),
        }
    }
}

/// outcome of one batch: the results that arrived, plus the reason the
/// batch ended early if the target died before acknowledging every input
#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ExecutionResult>,
    pub fault: Option<Failure>,
}

/// seam between the engine loop and whatever runs the target: the process
/// driver in production, scripted executors in tests
pub trait BatchExecutor {
    /// execute a batch of requests; may return fewer results than requests
    /// when the target crashes or hangs mid-batch
    fn execute_batch(&mut self, batch: &[ExecutionRequest]) -> anyhow::Result<BatchOutcome>;
}

fn codec() -> impl Options {
    bincode::options().with_limit(MAX_RESULT_SIZE)
}

impl ExecutionRequest {
    pub fn to_blob(&self) -> Result<Blob, ProtocolError> {
        if self.seq == TAG_BATCH_DONE {
            return Err(ProtocolError::ReservedTag(self.seq));
        }

        Ok(Blob {
            tag: self.seq,
            data: codec().serialize(self)?,
        })
    }

    pub fn from_blob(blob: &Blob) -> Result<Self, ProtocolError> {
        Ok(codec().deserialize(&blob.data)?)
    }
}

impl ExecutionResult {
    pub fn to_blob(&self) -> Result<Blob, ProtocolError> {
        if self.seq == TAG_BATCH_DONE {
            return Err(ProtocolError::ReservedTag(self.seq));
        }

        Ok(Blob {
            tag: self.seq,
            data: codec().serialize(self)?,
        })
    }

    pub fn from_blob(blob: &Blob) -> Result<Self, ProtocolError> {
        Ok(codec().deserialize(&blob.data)?)
    }
}
