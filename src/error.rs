//! Error types for pipeline-harness
//!
//! This module defines the error hierarchy for the coordinator and workers:
//! - Configuration and policy errors
//! - Bootstrap errors (capacity discovery, worker spawn)
//! - Command framing errors
//! - Collective operation errors on the control channel
//! - Worker-side stage callback errors
//!
//! Every error raised after bootstrap is fatal for the whole run. The
//! hierarchy exists so the top-level runner can decide the exit code and
//! log the failing stage, not so callers can retry.

use crate::fleet::RunState;
use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a clean shutdown
pub const EXIT_CLEAN: u8 = 0;

/// Exit code when the run never got a working fleet
pub const EXIT_BOOTSTRAP_FAILURE: u8 = 1;

/// Exit code when a fleet was running and a collective or stage failed
pub const EXIT_RUN_FAILURE: u8 = 2;

/// Top-level error type for pipeline-harness
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bootstrap errors (capacity discovery, spawn)
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Command framing errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Collective operation errors
    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Worker-side errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// API misuse, e.g. running a stage after shutdown
    #[error("Illegal operation '{operation}' in state {state}")]
    IllegalState {
        operation: &'static str,
        state: RunState,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Process exit code for this error
    ///
    /// Errors that happen before a fleet exists map to
    /// [`EXIT_BOOTSTRAP_FAILURE`]; everything else to [`EXIT_RUN_FAILURE`].
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::Config(_) | HarnessError::Bootstrap(_) => EXIT_BOOTSTRAP_FAILURE,
            _ => EXIT_RUN_FAILURE,
        }
    }

    /// True if this error happened while bringing the fleet up
    pub fn is_bootstrap(&self) -> bool {
        self.exit_code() == EXIT_BOOTSTRAP_FAILURE
    }
}

/// Configuration and policy errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Policy file not found
    #[error("Policy file '{path}' not found")]
    PolicyNotFound { path: PathBuf },

    /// Policy file could not be read or parsed
    #[error("Invalid policy '{path}': {reason}")]
    InvalidPolicy { path: PathBuf, reason: String },

    /// Run identifier contains characters that cannot be used in paths
    #[error("Invalid run id '{run_id}': only letters, digits, '.', '_' and '-' are allowed")]
    InvalidRunId { run_id: String },

    /// Frame capacity out of range
    #[error("Invalid buffer size {size}: must be between {min} and {max}")]
    InvalidBufferSize { size: usize, min: usize, max: usize },

    /// Stage without a name
    #[error("Stage {index} has an empty name")]
    EmptyStageName { index: usize },

    /// Capacity hint of zero leaves no slot for the coordinator
    #[error("Capacity hint must be at least 1 (one slot is the coordinator)")]
    InvalidCapacityHint,

    /// Worker launched without the environment the coordinator provides
    #[error("Missing worker environment variable {name}")]
    MissingWorkerEnv { name: &'static str },

    /// Worker environment variable present but malformed
    #[error("Invalid worker environment variable {name}='{value}'")]
    InvalidWorkerEnv { name: &'static str, value: String },
}

/// Failure to launch a single worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnFailure {
    /// Rank the worker would have had
    pub rank: usize,
    /// Platform error or exit code, when one was reported
    pub code: Option<i32>,
    /// Human-readable reason
    pub reason: String,
}

impl std::fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "rank {} (code {}): {}", self.rank, code, self.reason),
            None => write!(f, "rank {}: {}", self.rank, self.reason),
        }
    }
}

/// Bootstrap errors
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// The platform could not report its capacity
    #[error("Cannot determine universe size: {reason}")]
    Environment { reason: String },

    /// One or more workers failed to launch
    #[error("Failed to spawn {} of {requested} workers: {}", failures.len(), format_failures(failures))]
    Spawn {
        requested: usize,
        failures: Vec<SpawnFailure>,
    },
}

fn format_failures(failures: &[SpawnFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Command framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Command or frame does not fit the fixed wire format
    #[error("Cannot frame {what}: needs {required} bytes, frame holds {capacity}")]
    Framing {
        what: String,
        required: usize,
        capacity: usize,
    },

    /// Frame holds a name no command matches
    #[error("Unknown command '{name}'")]
    UnknownCommand { name: String },
}

/// Collective operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Broadcast failed on the transport
    #[error("Broadcast #{seq} failed{}: {reason}", format_rank(*rank))]
    Broadcast {
        seq: u64,
        rank: Option<usize>,
        reason: String,
    },

    /// Barrier failed on the transport
    #[error("Barrier #{seq} failed{}: {reason}", format_rank(*rank))]
    Barrier {
        seq: u64,
        rank: Option<usize>,
        reason: String,
    },

    /// Channel could not be released cleanly
    #[error("Failed to release control channel: {0}")]
    Release(String),

    /// Operation on a channel that was already released
    #[error("Control channel already released")]
    Released,
}

fn format_rank(rank: Option<usize>) -> String {
    match rank {
        Some(r) => format!(" at rank {}", r),
        None => String::new(),
    }
}

/// Worker-side errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Stage callback returned an error
    #[error("Worker {rank} failed stage {stage_index}: {reason}")]
    StageFailed {
        rank: usize,
        stage_index: i32,
        reason: String,
    },

    /// Peer exchange callback returned an error
    #[error("Worker {rank} failed peer exchange: {reason}")]
    SyncFailed { rank: usize, reason: String },
}

/// Result type alias for HarnessError
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Result type alias for ChannelError
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Result type alias for ProtocolError
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
