//! Stage coordinator - drives the fleet through the stage list
//!
//! The coordinator never processes records. For each stage it broadcasts
//! `PROCESS(i)` and waits at a barrier until every worker has finished the
//! stage. Stages that share data are followed by a `SYNC` round. When the
//! list is done, or the operator asked to stop, it broadcasts `SHUTDOWN` and
//! releases the channel.
//!
//! ```text
//! Bootstrapped ──run_stage(i)──▶ Running{i} ──sync_fleet──▶ Syncing
//!       │                           │  ▲                      │
//!       │                           └──┘ run_stage(i+1) ◀─────┘
//!       └──────────── shutdown_fleet / abort ──▶ ShuttingDown ──▶ Terminated
//! ```

use super::RunContext;
use crate::channel::{ControlChannel, FleetReport, Role};
use crate::config::{StageList, StageSpec};
use crate::error::{HarnessError, Result};
use crate::protocol::{Command, CommandCodec};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Bootstrapped,
    Running { stage_index: i32 },
    Syncing,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Bootstrapped => f.write_str("Bootstrapped"),
            RunState::Running { stage_index } => write!(f, "Running(stage {})", stage_index),
            RunState::Syncing => f.write_str("Syncing"),
            RunState::ShuttingDown => f.write_str("ShuttingDown"),
            RunState::Terminated => f.write_str("Terminated"),
        }
    }
}

/// Progress notifications from [`StageCoordinator::run_observed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    /// About to broadcast `PROCESS(index)`
    StageStarted { index: usize, name: String },
    /// Every worker passed the stage barrier
    StageFinished { index: usize, name: String },
    /// About to broadcast `SYNC` after stage `after`
    SyncStarted { after: usize },
    /// Every worker passed the sync barrier
    SyncFinished { after: usize },
    /// Operator stop seen at a stage boundary; `skipped` stages will not run
    Interrupted { skipped: usize },
    /// About to broadcast `SHUTDOWN`
    ShuttingDown,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub fleet_size: usize,
    pub stages_completed: usize,
    pub sync_rounds: usize,
    /// Stopped early by the operator
    pub interrupted: bool,
    pub duration: Duration,
    pub fleet: FleetReport,
}

/// Drives the fleet through a run on the coordinator side
pub struct StageCoordinator<C> {
    ctx: RunContext,
    channel: C,
    codec: CommandCodec,
    state: RunState,
    stop: Option<Arc<AtomicBool>>,
    continue_between_stages: bool,
}

impl<C: ControlChannel> StageCoordinator<C> {
    pub fn new(ctx: RunContext, channel: C, codec: CommandCodec) -> Self {
        Self {
            ctx,
            channel,
            codec,
            state: RunState::Bootstrapped,
            stop: None,
            continue_between_stages: false,
        }
    }

    /// Flag polled at stage boundaries; once set, remaining stages are skipped
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Issue a `CONTINUE` round between consecutive stages
    pub fn with_continue_between_stages(mut self, enabled: bool) -> Self {
        self.continue_between_stages = enabled;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Have every worker run stage `stage_index`, then wait for all of them
    pub fn run_stage(&mut self, stage_index: i32) -> Result<()> {
        self.ensure_live("run_stage")?;
        self.state = RunState::Running { stage_index };
        debug!(stage_index, "Broadcasting PROCESS");
        self.broadcast(Command::Process { stage_index })?;
        self.channel.barrier()?;
        Ok(())
    }

    /// Let workers exchange data directly, then wait for all of them
    pub fn sync_fleet(&mut self) -> Result<()> {
        self.ensure_live("sync_fleet")?;
        self.state = RunState::Syncing;
        debug!("Broadcasting SYNC");
        self.broadcast(Command::Sync)?;
        self.channel.barrier()?;
        Ok(())
    }

    /// Liveness round; no barrier follows
    pub fn continue_fleet(&mut self) -> Result<()> {
        self.ensure_live("continue_fleet")?;
        debug!("Broadcasting CONTINUE");
        self.broadcast(Command::Continue)
    }

    /// Tell workers to exit, release the channel and report how they ended
    ///
    /// The channel is released even when the broadcast fails; the broadcast
    /// error is returned in that case.
    pub fn shutdown_fleet(&mut self) -> Result<FleetReport> {
        self.ensure_live("shutdown_fleet")?;
        self.state = RunState::ShuttingDown;
        info!(workers = self.ctx.fleet_size(), "Shutting down fleet");

        let sent = self.broadcast(Command::Shutdown);
        let released = self.channel.release();
        self.state = RunState::Terminated;

        sent?;
        Ok(released?)
    }

    /// Release the channel without telling the workers anything
    ///
    /// Workers blocked in a collective see the channel close and exit.
    pub fn abort(&mut self) -> Result<FleetReport> {
        self.ensure_live("abort")?;
        self.state = RunState::ShuttingDown;
        let released = self.channel.release();
        self.state = RunState::Terminated;
        Ok(released?)
    }

    /// Run every stage in order, then shut the fleet down
    pub fn run(&mut self, stages: &StageList) -> Result<RunSummary> {
        self.run_observed(stages, |_| {})
    }

    /// [`run`](Self::run), reporting each round to `observer`
    pub fn run_observed<F>(&mut self, stages: &StageList, mut observer: F) -> Result<RunSummary>
    where
        F: FnMut(&RoundEvent),
    {
        self.ensure_live("run")?;
        let started = Instant::now();
        let mut stages_completed = 0;
        let mut sync_rounds = 0;
        let mut interrupted = false;

        info!(
            run_id = %self.ctx.run_id(),
            fleet_size = self.ctx.fleet_size(),
            stages = stages.len(),
            "Starting run"
        );

        for (index, stage) in stages.iter().enumerate() {
            if self.stop_requested() {
                let skipped = stages.len() - index;
                warn!(stage_index = index, skipped, "Stop requested, skipping remaining stages");
                observer(&RoundEvent::Interrupted { skipped });
                interrupted = true;
                break;
            }

            if index > 0 && self.continue_between_stages {
                if let Err(e) = self.continue_fleet() {
                    return Err(self.fail(index, e));
                }
            }

            if let Err(e) = self.run_one(index, stage, &mut observer) {
                return Err(self.fail(index, e));
            }
            stages_completed += 1;

            if stage.share_data {
                observer(&RoundEvent::SyncStarted { after: index });
                if let Err(e) = self.sync_fleet() {
                    return Err(self.fail(index, e));
                }
                sync_rounds += 1;
                observer(&RoundEvent::SyncFinished { after: index });
            }
        }

        observer(&RoundEvent::ShuttingDown);
        let fleet = self.shutdown_fleet().map_err(|e| {
            error!(error = %e, "Shutdown failed");
            e
        })?;

        let duration = started.elapsed();
        info!(
            run_id = %self.ctx.run_id(),
            stages_completed,
            sync_rounds,
            interrupted,
            duration_ms = duration.as_millis() as u64,
            "Run finished"
        );

        Ok(RunSummary {
            run_id: self.ctx.run_id().to_string(),
            fleet_size: self.ctx.fleet_size(),
            stages_completed,
            sync_rounds,
            interrupted,
            duration,
            fleet,
        })
    }

    fn run_one<F>(&mut self, index: usize, stage: &StageSpec, observer: &mut F) -> Result<()>
    where
        F: FnMut(&RoundEvent),
    {
        // StageList guarantees every index fits in an i32
        let stage_index = index as i32;
        info!(stage_index, stage = %stage.name, "Starting stage");
        observer(&RoundEvent::StageStarted {
            index,
            name: stage.name.clone(),
        });

        self.run_stage(stage_index)?;

        info!(stage_index, stage = %stage.name, "Stage complete on every worker");
        observer(&RoundEvent::StageFinished {
            index,
            name: stage.name.clone(),
        });
        Ok(())
    }

    /// Log the failure, tear the fleet down and hand the error back
    fn fail(&mut self, stage_index: usize, err: HarnessError) -> HarnessError {
        error!(stage_index, error = %err, "Run failed, aborting fleet");
        match self.abort() {
            Ok(report) => {
                for exit in report.failures() {
                    warn!(rank = exit.rank, code = ?exit.code, error = ?exit.error, "Worker exited abnormally");
                }
            }
            Err(e) => warn!(error = %e, "Failed to release control channel"),
        }
        err
    }

    fn broadcast(&mut self, command: Command) -> Result<()> {
        let mut frame = self.codec.frame(&command)?;
        self.channel.broadcast(&mut frame, Role::Root)?;
        Ok(())
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.state == RunState::Terminated {
            return Err(HarnessError::IllegalState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelCall, FleetTopology, RecordingChannel, SpawnSpec};
    use crate::config::{LogLevel, StageSpec};
    use crate::error::ChannelError;
    use std::path::PathBuf;

    fn coordinator(fleet_size: usize) -> (StageCoordinator<RecordingChannel>, crate::channel::CallLog) {
        let (channel, log) = RecordingChannel::new(fleet_size);
        (wrap(channel, fleet_size), log)
    }

    fn wrap(channel: RecordingChannel, fleet_size: usize) -> StageCoordinator<RecordingChannel> {
        let spec = SpawnSpec {
            policy: PathBuf::from("pipeline.json"),
            run_id: "unit".into(),
            log_level: LogLevel::Quiet,
            frame_capacity: 32,
        };
        let ctx = RunContext::coordinator(&spec, FleetTopology::with_fleet_size(fleet_size));
        StageCoordinator::new(ctx, channel, CommandCodec::new(32))
    }

    fn stages(names: &[&str]) -> StageList {
        StageList::new(names.iter().map(|n| StageSpec::named(*n)).collect()).unwrap()
    }

    #[test]
    fn test_run_issues_process_barrier_pairs() {
        let (mut coord, log) = coordinator(3);
        let summary = coord.run(&stages(&["detrend", "calibrate", "combine"])).unwrap();

        assert_eq!(
            log.script(&CommandCodec::new(32)),
            vec![
                "PROCESS(0)", "barrier", "PROCESS(1)", "barrier", "PROCESS(2)", "barrier",
                "SHUTDOWN", "release",
            ]
        );
        assert_eq!(summary.stages_completed, 3);
        assert_eq!(summary.sync_rounds, 0);
        assert!(!summary.interrupted);
        assert!(summary.fleet.all_succeeded());
        assert_eq!(coord.state(), RunState::Terminated);
    }

    #[test]
    fn test_share_data_stage_adds_sync_round() {
        let (mut coord, log) = coordinator(2);
        let mut list = vec![StageSpec::named("a"), StageSpec::named("b")];
        list[0].share_data = true;
        let summary = coord.run(&StageList::new(list).unwrap()).unwrap();

        assert_eq!(
            log.script(&CommandCodec::new(32)),
            vec!["PROCESS(0)", "barrier", "SYNC", "barrier", "PROCESS(1)", "barrier", "SHUTDOWN", "release"]
        );
        assert_eq!(summary.sync_rounds, 1);
    }

    #[test]
    fn test_continue_between_stages() {
        let (channel, log) = RecordingChannel::new(1);
        let mut coord = wrap(channel, 1).with_continue_between_stages(true);
        coord.run(&stages(&["a", "b"])).unwrap();

        assert_eq!(
            log.script(&CommandCodec::new(32)),
            vec!["PROCESS(0)", "barrier", "CONTINUE", "PROCESS(1)", "barrier", "SHUTDOWN", "release"]
        );
    }

    #[test]
    fn test_second_shutdown_is_illegal_and_silent() {
        let (mut coord, log) = coordinator(2);
        coord.shutdown_fleet().unwrap();
        let calls = log.len();

        let err = coord.shutdown_fleet().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::IllegalState {
                operation: "shutdown_fleet",
                state: RunState::Terminated
            }
        ));
        assert!(coord.run_stage(0).is_err());
        assert!(coord.sync_fleet().is_err());
        assert!(coord.continue_fleet().is_err());
        assert_eq!(log.len(), calls);
    }

    #[test]
    fn test_barrier_failure_aborts_run() {
        let (channel, log) = RecordingChannel::new(3);
        // Second barrier is the one after PROCESS(1)
        let mut coord = wrap(channel.fail_barrier_at(1), 3);

        let err = coord.run(&stages(&["detrend", "calibrate", "combine"])).unwrap_err();
        assert!(matches!(err, HarnessError::Channel(ChannelError::Barrier { .. })));
        assert_ne!(err.exit_code(), 0);

        let calls = log.calls();
        assert_eq!(calls.last(), Some(&ChannelCall::Release));
        assert_eq!(
            log.script(&CommandCodec::new(32)),
            vec!["PROCESS(0)", "barrier", "PROCESS(1)", "barrier", "release"]
        );
        assert_eq!(coord.state(), RunState::Terminated);
    }

    #[test]
    fn test_stop_flag_skips_remaining_stages() {
        let (channel, log) = RecordingChannel::new(2);
        let stop = Arc::new(AtomicBool::new(false));
        let mut coord = wrap(channel, 2).with_stop_signal(Arc::clone(&stop));

        let mut events = Vec::new();
        let summary = coord
            .run_observed(&stages(&["a", "b", "c"]), |event| {
                if let RoundEvent::StageFinished { index: 0, .. } = event {
                    stop.store(true, Ordering::SeqCst);
                }
                events.push(event.clone());
            })
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.stages_completed, 1);
        assert!(events.contains(&RoundEvent::Interrupted { skipped: 2 }));
        assert_eq!(
            log.script(&CommandCodec::new(32)),
            vec!["PROCESS(0)", "barrier", "SHUTDOWN", "release"]
        );
    }

    #[test]
    fn test_empty_stage_list_only_shuts_down() {
        let (mut coord, log) = coordinator(0);
        let summary = coord.run(&StageList::default()).unwrap();
        assert_eq!(summary.stages_completed, 0);
        assert_eq!(log.script(&CommandCodec::new(32)), vec!["SHUTDOWN", "release"]);
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running { stage_index: 3 }.to_string(), "Running(stage 3)");
        assert_eq!(RunState::Terminated.to_string(), "Terminated");
    }
}
