//! Configuration types for pipeline-harness
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The JSON pipeline policy (stages, frame size, directories)
//! - Validated runtime configuration for the coordinator and workers

use crate::channel::socket::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REAP_TIMEOUT};
use crate::channel::SpawnSpec;
use crate::directories::DirPolicy;
use crate::error::ConfigError;
use crate::protocol::{CommandCodec, DEFAULT_FRAME_CAPACITY, MIN_FRAME_CAPACITY};
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Largest command frame a policy may ask for
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Run ids end up in directory names
static RUN_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Invalid run id regex"));

/// Coordinator/worker harness for staged batch pipelines
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pipeline-harness",
    version,
    about = "Drive a fleet of worker processes through a staged batch pipeline",
    long_about = "Starts a coordinator that discovers how many slots the platform offers, \
                  launches one worker process per remaining slot and walks every worker \
                  through the stages of a pipeline policy, one barrier-synchronised round \
                  per stage.",
    after_help = "EXAMPLES:\n    \
        pipeline-harness run pipeline.json --universe-size 4\n    \
        pipeline-harness run pipeline.json nightly-2024-03-01 -v\n    \
        FLEET_UNIVERSE_SIZE=8 pipeline-harness run pipeline.json -q"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: CliCommand,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Run a pipeline as the coordinator
    Run(RunArgs),

    /// Run as a worker (launched by the coordinator)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments of the `run` subcommand
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline policy file (JSON)
    #[arg(value_name = "POLICY")]
    pub policy: PathBuf,

    /// Run identifier (generated when omitted)
    #[arg(value_name = "RUN_ID")]
    pub run_id: Option<String>,

    /// Total slots available, coordinator included
    #[arg(long, env = "FLEET_UNIVERSE_SIZE", value_name = "NUM")]
    pub universe_size: Option<usize>,

    /// Log level for the coordinator and workers
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Verbose output (same as --log-level verbose)
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode - warnings only, no progress display
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Seconds to wait for every worker to connect
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs(), value_name = "SECS")]
    pub connect_timeout: u64,

    /// Seconds to wait for workers to exit after shutdown before killing them
    #[arg(long, default_value_t = DEFAULT_REAP_TIMEOUT.as_secs(), value_name = "SECS")]
    pub reap_timeout: u64,

    /// Program to launch for each worker (defaults to this executable)
    #[arg(long, value_name = "PATH")]
    pub worker_program: Option<PathBuf>,
}

impl RunArgs {
    /// Log level after -v / -q are applied
    pub fn effective_log_level(&self) -> LogLevel {
        if self.quiet {
            LogLevel::Quiet
        } else if self.verbose {
            LogLevel::Verbose
        } else {
            self.log_level
        }
    }
}

/// Arguments of the hidden `worker` subcommand
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Pipeline policy file (JSON)
    #[arg(value_name = "POLICY")]
    pub policy: PathBuf,

    /// Run identifier chosen by the coordinator
    #[arg(value_name = "RUN_ID")]
    pub run_id: String,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

/// Logging verbosity shared by the coordinator and its workers
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// No log output at all
    Silent,
    /// Warnings and errors
    Quiet,
    /// Stage boundaries, bootstrap and shutdown
    #[default]
    Info,
    /// Every collective
    Verbose,
    /// Debug output from dependencies too
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Name as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Silent => "silent",
            LogLevel::Quiet => "quiet",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// `EnvFilter` directive for this level
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Quiet => "pipeline_harness=warn,warn",
            LogLevel::Info => "pipeline_harness=info,warn",
            LogLevel::Verbose => "pipeline_harness=debug,warn",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, used in logs and handed to the stage command
    pub name: String,

    /// Shell command every worker runs for this stage
    #[serde(default)]
    pub command: Option<String>,

    /// Shell command run during the SYNC round after this stage
    #[serde(default)]
    pub sync_command: Option<String>,

    /// Follow this stage with a SYNC round
    #[serde(default)]
    pub share_data: bool,
}

impl StageSpec {
    /// Stage with no command and no data sharing
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            sync_command: None,
            share_data: false,
        }
    }
}

/// Ordered, 0-indexed list of stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageList(Vec<StageSpec>);

impl StageList {
    /// Validate and wrap `stages`
    ///
    /// Every stage needs a name, and every index must fit the wire format.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, ConfigError> {
        let list = Self(stages);
        list.validate()?;
        Ok(list)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(index) = self.0.iter().position(|s| s.name.trim().is_empty()) {
            return Err(ConfigError::EmptyStageName { index });
        }
        if i32::try_from(self.0.len()).is_err() {
            return Err(ConfigError::InvalidPolicy {
                path: PathBuf::new(),
                reason: format!("{} stages exceed the stage index range", self.0.len()),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StageSpec> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageSpec> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|s| s.name.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a StageList {
    type Item = &'a StageSpec;
    type IntoIter = std::slice::Iter<'a, StageSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Pipeline policy, loaded from JSON
///
/// ```json
/// {
///   "name": "nightly",
///   "buffer_size": 256,
///   "capacity_hint": 4,
///   "stages": [
///     { "name": "detrend", "command": "detrend --rank $FLEET_RANK" },
///     { "name": "calibrate", "share_data": true, "sync_command": "exchange.sh" },
///     { "name": "combine" }
///   ],
///   "dir": { "default_root": "runs", "run_dir_pattern": "{shortname}/{runid}" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePolicy {
    /// Short pipeline name
    #[serde(default = "default_policy_name")]
    pub name: String,

    /// Command frame size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Universe size to use when the platform advertises none
    #[serde(default)]
    pub capacity_hint: Option<usize>,

    /// Issue a CONTINUE round between stages
    #[serde(default)]
    pub continue_between_stages: bool,

    #[serde(default)]
    pub stages: StageList,

    #[serde(default)]
    pub dir: DirPolicy,
}

fn default_policy_name() -> String {
    "pipeline".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_FRAME_CAPACITY
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            name: default_policy_name(),
            buffer_size: default_buffer_size(),
            capacity_hint: None,
            continue_between_stages: false,
            stages: StageList::default(),
            dir: DirPolicy::default(),
        }
    }
}

impl PipelinePolicy {
    /// Read, parse and validate a policy file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::PolicyNotFound {
                path: path.to_path_buf(),
            },
            _ => ConfigError::InvalidPolicy {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;

        let policy = Self::parse(&text).map_err(|e| match e {
            ConfigError::InvalidPolicy { reason, .. } => ConfigError::InvalidPolicy {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(policy)
    }

    /// Parse and validate policy JSON
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let policy: Self = serde_json::from_str(text).map_err(|e| ConfigError::InvalidPolicy {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_FRAME_CAPACITY || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidBufferSize {
                size: self.buffer_size,
                min: MIN_FRAME_CAPACITY,
                max: MAX_BUFFER_SIZE,
            });
        }
        if self.capacity_hint == Some(0) {
            return Err(ConfigError::InvalidCapacityHint);
        }
        self.stages.validate()
    }

    pub fn codec(&self) -> CommandCodec {
        CommandCodec::new(self.buffer_size)
    }
}

/// Reject run ids that are unsafe in paths
pub fn validate_run_id(run_id: &str) -> Result<(), ConfigError> {
    if !RUN_ID_REGEX.is_match(run_id) {
        return Err(ConfigError::InvalidRunId {
            run_id: run_id.to_string(),
        });
    }
    Ok(())
}

/// Validated coordinator configuration
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Run identifier shared by the fleet
    pub run_id: String,

    /// Where the policy was loaded from (workers load it again)
    pub policy_path: PathBuf,

    /// Parsed pipeline policy
    pub policy: PipelinePolicy,

    /// Universe size from the operator or environment
    pub universe_size: Option<usize>,

    /// Log level for coordinator and workers
    pub log_level: LogLevel,

    /// Show progress bar and summary
    pub show_progress: bool,

    /// Time allowed for workers to connect
    pub connect_timeout: Duration,

    /// Time allowed for workers to exit after shutdown
    pub reap_timeout: Duration,

    /// Worker executable, `None` for the current one
    pub worker_program: Option<PathBuf>,
}

impl FleetConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        let log_level = args.effective_log_level();

        let run_id = match args.run_id {
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_run_id(&run_id)?;

        let policy = PipelinePolicy::load(&args.policy)?;

        // Workers resolve the policy from their own working directory
        let policy_path = std::fs::canonicalize(&args.policy).unwrap_or(args.policy);

        Ok(Self {
            run_id,
            policy_path,
            policy,
            universe_size: args.universe_size,
            log_level,
            show_progress: !args.quiet,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            reap_timeout: Duration::from_secs(args.reap_timeout),
            worker_program: args.worker_program,
        })
    }

    pub fn stages(&self) -> &StageList {
        &self.policy.stages
    }

    pub fn codec(&self) -> CommandCodec {
        self.policy.codec()
    }

    /// What every worker is launched with
    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            policy: self.policy_path.clone(),
            run_id: self.run_id.clone(),
            log_level: self.log_level,
            frame_capacity: self.policy.buffer_size,
        }
    }
}

/// Validated worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub run_id: String,
    pub policy_path: PathBuf,
    pub policy: PipelinePolicy,
    pub log_level: LogLevel,
}

impl WorkerConfig {
    pub fn from_args(args: WorkerArgs) -> Result<Self, ConfigError> {
        validate_run_id(&args.run_id)?;
        let policy = PipelinePolicy::load(&args.policy)?;

        Ok(Self {
            run_id: args.run_id,
            policy_path: args.policy,
            policy,
            log_level: args.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_policy() {
        let policy = PipelinePolicy::parse(
            r#"{
                "name": "nightly",
                "buffer_size": 128,
                "capacity_hint": 4,
                "continue_between_stages": true,
                "stages": [
                    { "name": "detrend", "command": "true" },
                    { "name": "calibrate", "share_data": true, "sync_command": "true" },
                    { "name": "combine" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(policy.name, "nightly");
        assert_eq!(policy.buffer_size, 128);
        assert_eq!(policy.capacity_hint, Some(4));
        assert!(policy.continue_between_stages);
        assert_eq!(policy.stages.names(), vec!["detrend", "calibrate", "combine"]);
        assert!(policy.stages.get(1).unwrap().share_data);
        assert_eq!(policy.codec().capacity(), 128);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let policy = PipelinePolicy::parse("{}").unwrap();
        assert_eq!(policy, PipelinePolicy::default());
        assert_eq!(policy.buffer_size, DEFAULT_FRAME_CAPACITY);
        assert!(policy.stages.is_empty());
    }

    #[test]
    fn test_buffer_size_bounds() {
        let err = PipelinePolicy::parse(r#"{ "buffer_size": 4 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBufferSize { size: 4, .. }));

        let err = PipelinePolicy::parse(r#"{ "buffer_size": 1000000 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBufferSize { .. }));
    }

    #[test]
    fn test_empty_stage_name_rejected() {
        let err = PipelinePolicy::parse(r#"{ "stages": [ { "name": "a" }, { "name": " " } ] }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyStageName { index: 1 }));
    }

    #[test]
    fn test_zero_capacity_hint_rejected() {
        let err = PipelinePolicy::parse(r#"{ "capacity_hint": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCapacityHint));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            PipelinePolicy::parse("{ stages"),
            Err(ConfigError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn test_run_id_validation() {
        assert!(validate_run_id("run-2024.03_01").is_ok());
        assert!(validate_run_id("../escape").is_err());
        assert!(validate_run_id("has space").is_err());
        assert!(validate_run_id("").is_err());
    }

    #[test]
    fn test_log_level_names_round_trip() {
        for level in LogLevel::value_variants() {
            let parsed = LogLevel::from_str(level.as_str(), false).unwrap();
            assert_eq!(parsed, *level);
        }
    }

    #[test]
    fn test_cli_parses_run() {
        let args = CliArgs::try_parse_from([
            "pipeline-harness",
            "run",
            "pipeline.json",
            "run-1",
            "--universe-size",
            "4",
            "-v",
        ])
        .unwrap();

        match args.command {
            CliCommand::Run(run) => {
                assert_eq!(run.policy, PathBuf::from("pipeline.json"));
                assert_eq!(run.run_id.as_deref(), Some("run-1"));
                assert_eq!(run.universe_size, Some(4));
                assert_eq!(run.effective_log_level(), LogLevel::Verbose);
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_worker() {
        let args = CliArgs::try_parse_from([
            "pipeline-harness",
            "worker",
            "pipeline.json",
            "run-1",
            "--log-level",
            "debug",
        ])
        .unwrap();

        match args.command {
            CliCommand::Worker(worker) => {
                assert_eq!(worker.run_id, "run-1");
                assert_eq!(worker.log_level, LogLevel::Debug);
            }
            other => panic!("expected worker, got {:?}", other),
        }
    }
}
