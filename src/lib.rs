//! pipeline-harness - Coordinator/Worker Harness for Staged Batch Pipelines
//!
//! A coordinator discovers how many slots its platform offers, launches one
//! worker per remaining slot and walks the whole fleet through an ordered
//! list of stages. The coordinator never touches the data itself; it only
//! says what to do next and waits until every worker has done it.
//!
//! # Features
//!
//! - **Collective Control Channel**: every command is a broadcast from the
//!   coordinator, every round ends in a barrier across the fleet.
//!
//! - **Fixed-Size Command Frames**: one frame carries a command and its stage
//!   index, so a round is never split across two broadcasts.
//!
//! - **Pluggable Transports**: worker processes over loopback TCP, worker
//!   threads in-process, or a recording channel for tests.
//!
//! - **Fail Fast**: any stage or transport error ends the run with a typed
//!   error and a non-zero exit code; no worker is left running.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Coordinator (rank 0)                        │
//! │   FleetBootstrap ──▶ StageCoordinator ──▶ FleetReport            │
//! │   discover, spawn     PROCESS(i) + barrier, SYNC + barrier       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               │ broadcast / barrier
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Control Channel                           │
//! │        (socket: loopback TCP · local: crossbeam channels)        │
//! └──────┬──────────────┬──────────────┬────────────────────┬───────┘
//!        │              │              │                    │
//!        ▼              ▼              ▼                    ▼
//!   ┌─────────┐    ┌─────────┐    ┌─────────┐          ┌─────────┐
//!   │Worker 1 │    │Worker 2 │    │Worker 3 │   ...    │Worker N │
//!   │ stages  │    │ stages  │    │ stages  │          │ stages  │
//!   └─────────┘    └─────────┘    └─────────┘          └─────────┘
//!        ◀──────────── SYNC: peers exchange directly ────────▶
//! ```
//!
//! # Example
//!
//! ```bash
//! # Four slots: one coordinator, three workers
//! pipeline-harness run pipeline.json --universe-size 4
//!
//! # Named run, verbose logs
//! pipeline-harness run pipeline.json nightly-2024-03-01 -v
//! ```

pub mod channel;
pub mod config;
pub mod directories;
pub mod error;
pub mod fleet;
pub mod progress;
pub mod protocol;
pub mod stage;

pub use channel::{ControlChannel, FleetReport, FleetTopology, Launcher, Role, SpawnSpec};
pub use config::{CliArgs, FleetConfig, LogLevel, PipelinePolicy, StageList, StageSpec};
pub use error::{HarnessError, Result};
pub use fleet::{
    FleetBootstrap, RoundEvent, RunContext, RunState, RunSummary, StageCoordinator, StageHandler,
    WorkerAgent, WorkerSummary,
};
pub use protocol::{Command, CommandCodec};
