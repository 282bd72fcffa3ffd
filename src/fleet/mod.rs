//! Fleet lifecycle: bootstrap, coordinator, worker
//!
//! - [`FleetBootstrap`] discovers capacity and launches the workers
//! - [`StageCoordinator`] drives them through the stage list (rank 0)
//! - [`WorkerAgent`] runs on every other rank and executes what it is told
//!
//! All three share one [`RunContext`] per participant instead of globals.

mod bootstrap;
mod context;
mod coordinator;
mod worker;

pub use bootstrap::FleetBootstrap;
pub use context::RunContext;
pub use coordinator::{RoundEvent, RunState, RunSummary, StageCoordinator};
pub use worker::{StageHandler, WorkerAgent, WorkerState, WorkerSummary};
