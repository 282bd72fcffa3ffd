//! Worker agent - receives commands and runs stage callbacks
//!
//! Each worker:
//! - Waits for the coordinator's next broadcast
//! - Runs the stage callback for `PROCESS(i)`, the peer exchange for `SYNC`
//! - Joins the barrier that ends those rounds
//! - Leaves the loop on `SHUTDOWN`
//!
//! Any failure is fatal for the worker. It releases its end of the channel
//! and returns the error; the coordinator finds out at the next barrier.

use super::RunContext;
use crate::channel::{ControlChannel, Role};
use crate::error::{HarnessError, Result, WorkerError};
use crate::protocol::{Command, CommandCodec};
use tracing::{debug, error, info, info_span, warn};

/// Per-stage logic run by every worker
///
/// This is the boundary to the actual processing code. Errors are reported
/// with their context chain and end the worker.
pub trait StageHandler {
    /// Run stage `stage_index` on this worker's share of the data
    fn process(&mut self, stage_index: i32) -> anyhow::Result<()>;

    /// Exchange data directly with other workers
    fn sync_peers(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<H: StageHandler + ?Sized> StageHandler for Box<H> {
    fn process(&mut self, stage_index: i32) -> anyhow::Result<()> {
        (**self).process(stage_index)
    }

    fn sync_peers(&mut self) -> anyhow::Result<()> {
        (**self).sync_peers()
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Listening,
    Executing,
    Syncing,
    Terminated,
}

/// What a worker did before it was told to shut down
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub rank: usize,
    pub stages_processed: usize,
    pub sync_rounds: usize,
    pub continues: usize,
}

/// Drives one worker through the coordinator's commands
pub struct WorkerAgent<C, H> {
    ctx: RunContext,
    channel: C,
    codec: CommandCodec,
    handler: H,
    state: WorkerState,
    last_command: Option<Command>,
    summary: WorkerSummary,
}

impl<C: ControlChannel, H: StageHandler> WorkerAgent<C, H> {
    pub fn new(ctx: RunContext, channel: C, codec: CommandCodec, handler: H) -> Self {
        let summary = WorkerSummary {
            rank: ctx.rank(),
            ..WorkerSummary::default()
        };
        Self {
            ctx,
            channel,
            codec,
            handler,
            state: WorkerState::Listening,
            last_command: None,
            summary,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn last_command(&self) -> Option<Command> {
        self.last_command
    }

    /// Receive and dispatch commands until `SHUTDOWN` or a fatal error
    pub fn run(mut self) -> Result<WorkerSummary> {
        let span = info_span!("worker", rank = self.ctx.rank(), run_id = %self.ctx.run_id());
        let _guard = span.enter();

        info!(fleet_size = self.ctx.fleet_size(), "Worker listening");
        let mut frame = self.codec.empty_frame();

        loop {
            self.state = WorkerState::Listening;
            let command = match self.receive(&mut frame) {
                Ok(command) => command,
                Err(e) => return Err(self.fail(e)),
            };
            self.last_command = Some(command);
            debug!(%command, "Received command");

            let handled = match command {
                Command::Process { stage_index } => self.process(stage_index),
                Command::Sync => self.sync(),
                Command::Continue => {
                    self.summary.continues += 1;
                    Ok(())
                }
                Command::Shutdown => {
                    self.state = WorkerState::Terminated;
                    self.channel.release()?;
                    info!(
                        stages = self.summary.stages_processed,
                        sync_rounds = self.summary.sync_rounds,
                        "Worker shut down"
                    );
                    return Ok(self.summary);
                }
            };

            if let Err(e) = handled {
                return Err(self.fail(e));
            }
        }
    }

    fn receive(&mut self, frame: &mut [u8]) -> Result<Command> {
        self.channel.broadcast(frame, Role::Receiver)?;
        Ok(self.codec.decode(frame)?)
    }

    fn process(&mut self, stage_index: i32) -> Result<()> {
        self.state = WorkerState::Executing;
        debug!(stage_index, "Running stage");

        self.handler
            .process(stage_index)
            .map_err(|e| WorkerError::StageFailed {
                rank: self.ctx.rank(),
                stage_index,
                reason: format!("{:#}", e),
            })?;
        self.channel.barrier()?;

        self.summary.stages_processed += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.state = WorkerState::Syncing;
        debug!("Exchanging data with peers");

        self.handler
            .sync_peers()
            .map_err(|e| WorkerError::SyncFailed {
                rank: self.ctx.rank(),
                reason: format!("{:#}", e),
            })?;
        self.channel.barrier()?;

        self.summary.sync_rounds += 1;
        Ok(())
    }

    fn fail(&mut self, err: HarnessError) -> HarnessError {
        error!(
            last_command = ?self.last_command,
            error = %err,
            "Worker failed, leaving the fleet"
        );
        self.state = WorkerState::Terminated;
        if let Err(e) = self.channel.release() {
            warn!(error = %e, "Failed to release control channel");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FleetTopology, LocalChannel, SpawnSpec};
    use crate::config::LogLevel;
    use crate::error::ProtocolError;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_stage: Option<i32>,
    }

    impl StageHandler for Recorder {
        fn process(&mut self, stage_index: i32) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("process {}", stage_index));
            if self.fail_stage == Some(stage_index) {
                anyhow::bail!("bad input");
            }
            Ok(())
        }

        fn sync_peers(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("sync".into());
            Ok(())
        }
    }

    fn ctx(rank: usize) -> RunContext {
        let spec = SpawnSpec {
            policy: PathBuf::from("pipeline.json"),
            run_id: "worker-unit".into(),
            log_level: LogLevel::Quiet,
            frame_capacity: 16,
        };
        RunContext::worker(&spec, rank, FleetTopology::with_fleet_size(1))
    }

    fn send(coordinator: &mut LocalChannel, codec: &CommandCodec, command: Command) {
        let mut frame = codec.frame(&command).unwrap();
        coordinator.broadcast(&mut frame, Role::Root).unwrap();
    }

    #[test]
    fn test_dispatches_until_shutdown() {
        let codec = CommandCodec::new(16);
        let (mut coordinator, mut peers) =
            LocalChannel::connected(FleetTopology::with_fleet_size(1));
        let recorder = Recorder::default();
        let calls = Arc::clone(&recorder.calls);
        let agent = WorkerAgent::new(ctx(1), peers.remove(0), codec, recorder);
        let worker = thread::spawn(move || agent.run());

        send(&mut coordinator, &codec, Command::Process { stage_index: 0 });
        coordinator.barrier().unwrap();
        send(&mut coordinator, &codec, Command::Continue);
        send(&mut coordinator, &codec, Command::Sync);
        coordinator.barrier().unwrap();
        send(&mut coordinator, &codec, Command::Shutdown);

        let summary = worker.join().unwrap().unwrap();
        assert_eq!(
            summary,
            WorkerSummary {
                rank: 1,
                stages_processed: 1,
                sync_rounds: 1,
                continues: 1,
            }
        );
        assert_eq!(*calls.lock().unwrap(), vec!["process 0", "sync"]);
    }

    #[test]
    fn test_stage_failure_skips_barrier() {
        let codec = CommandCodec::new(16);
        let (mut coordinator, mut peers) =
            LocalChannel::connected(FleetTopology::with_fleet_size(1));
        let recorder = Recorder {
            fail_stage: Some(1),
            ..Recorder::default()
        };
        let agent = WorkerAgent::new(ctx(1), peers.remove(0), codec, recorder);
        let worker = thread::spawn(move || agent.run());

        send(&mut coordinator, &codec, Command::Process { stage_index: 1 });
        let barrier = coordinator.barrier();
        assert!(barrier.is_err());

        let err = worker.join().unwrap().unwrap_err();
        match err {
            HarnessError::Worker(WorkerError::StageFailed {
                rank,
                stage_index,
                reason,
            }) => {
                assert_eq!(rank, 1);
                assert_eq!(stage_index, 1);
                assert!(reason.contains("bad input"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let codec = CommandCodec::new(16);
        let (mut coordinator, mut peers) =
            LocalChannel::connected(FleetTopology::with_fleet_size(1));
        let agent = WorkerAgent::new(ctx(1), peers.remove(0), codec, Recorder::default());
        let worker = thread::spawn(move || agent.run());

        let mut frame = codec.empty_frame();
        frame[..5].copy_from_slice(b"PAUSE");
        coordinator.broadcast(&mut frame, Role::Root).unwrap();

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Protocol(ProtocolError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_closed_channel_ends_worker() {
        let codec = CommandCodec::new(16);
        let (mut coordinator, mut peers) =
            LocalChannel::connected(FleetTopology::with_fleet_size(1));
        let agent = WorkerAgent::new(ctx(1), peers.remove(0), codec, Recorder::default());
        let worker = thread::spawn(move || agent.run());

        coordinator.release().unwrap();
        let err = worker.join().unwrap().unwrap_err();
        assert_ne!(err.exit_code(), 0);
    }
}
