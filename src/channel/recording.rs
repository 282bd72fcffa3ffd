//! Recording transport: no workers, just a log of the collectives called
//!
//! Useful for checking the exact call sequence a coordinator produces, and
//! for injecting a transport failure at a chosen collective.

use super::{ControlChannel, FleetReport, FleetTopology, Launcher, Role, SpawnSpec, WorkerExit};
use crate::error::{BootstrapError, ChannelError, ChannelResult, SpawnFailure};
use crate::protocol::CommandCodec;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::sync::Arc;

/// One collective, as the coordinator issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Broadcast(Vec<u8>),
    Barrier,
    Release,
}

/// Shared handle on the recorded calls
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<ChannelCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: ChannelCall) {
        self.calls.lock().push(call);
    }

    /// Snapshot of every call so far
    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Calls rendered as short strings: `PROCESS(0)`, `barrier`, `release`
    ///
    /// Frames that do not decode show up as `<invalid: ...>`.
    pub fn script(&self, codec: &CommandCodec) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| match call {
                ChannelCall::Broadcast(frame) => match codec.decode(frame) {
                    Ok(command) => command.to_string(),
                    Err(e) => format!("<invalid: {}>", e),
                },
                ChannelCall::Barrier => "barrier".to_string(),
                ChannelCall::Release => "release".to_string(),
            })
            .collect()
    }
}

/// Coordinator-side channel that records instead of transmitting
#[derive(Debug)]
pub struct RecordingChannel {
    topology: FleetTopology,
    log: CallLog,
    seq: u64,
    barriers: usize,
    broadcasts: usize,
    fail_barrier: Option<usize>,
    fail_broadcast: Option<usize>,
    released: bool,
}

impl RecordingChannel {
    /// Channel for a fleet of `fleet_size` workers, plus its log
    pub fn new(fleet_size: usize) -> (Self, CallLog) {
        Self::with_log(FleetTopology::with_fleet_size(fleet_size), CallLog::new())
    }

    pub fn with_log(topology: FleetTopology, log: CallLog) -> (Self, CallLog) {
        let channel = Self {
            topology,
            log: log.clone(),
            seq: 0,
            barriers: 0,
            broadcasts: 0,
            fail_barrier: None,
            fail_broadcast: None,
            released: false,
        };
        (channel, log)
    }

    /// Fail the `n`th barrier (0-based), blaming `rank` 1
    pub fn fail_barrier_at(mut self, n: usize) -> Self {
        self.fail_barrier = Some(n);
        self
    }

    /// Fail the `n`th broadcast (0-based)
    pub fn fail_broadcast_at(mut self, n: usize) -> Self {
        self.fail_broadcast = Some(n);
        self
    }

    fn check_open(&self) -> ChannelResult<()> {
        if self.released {
            return Err(ChannelError::Released);
        }
        Ok(())
    }
}

impl ControlChannel for RecordingChannel {
    fn rank(&self) -> usize {
        super::COORDINATOR_RANK
    }

    fn participants(&self) -> usize {
        self.topology.universe_size()
    }

    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let n = self.broadcasts;
        self.broadcasts += 1;

        if role != Role::Root {
            return Err(ChannelError::Broadcast {
                seq: self.seq,
                rank: Some(self.rank()),
                reason: "the coordinator is always the broadcast root".into(),
            });
        }

        self.log.push(ChannelCall::Broadcast(frame.to_vec()));
        if self.fail_broadcast == Some(n) {
            return Err(ChannelError::Broadcast {
                seq: self.seq,
                rank: Some(1),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let n = self.barriers;
        self.barriers += 1;

        self.log.push(ChannelCall::Barrier);
        if self.fail_barrier == Some(n) {
            return Err(ChannelError::Barrier {
                seq: self.seq,
                rank: Some(1),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        self.check_open()?;
        self.released = true;
        self.log.push(ChannelCall::Release);

        let exits = self
            .topology
            .worker_ranks()
            .map(|rank| WorkerExit {
                rank,
                code: Some(0),
                error: None,
            })
            .collect();
        Ok(FleetReport { exits })
    }
}

/// A spawn request seen by [`RecordingLauncher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub fleet_size: usize,
    pub args: Vec<OsString>,
}

/// Launcher that hands out recording channels
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    universe_size: Option<usize>,
    fail_ranks: Vec<usize>,
    log: CallLog,
    requests: Arc<Mutex<Vec<SpawnRequest>>>,
}

impl RecordingLauncher {
    pub fn new(universe_size: Option<usize>) -> Self {
        Self {
            universe_size,
            ..Self::default()
        }
    }

    /// Make the launch of these ranks fail
    pub fn failing(mut self, ranks: impl IntoIterator<Item = usize>) -> Self {
        self.fail_ranks = ranks.into_iter().collect();
        self
    }

    /// Log shared by every channel this launcher produces
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Every spawn request so far
    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().clone()
    }
}

impl Launcher for RecordingLauncher {
    type Channel = RecordingChannel;

    fn universe_size(&self) -> Option<usize> {
        self.universe_size
    }

    fn spawn(
        &self,
        topology: FleetTopology,
        spec: &SpawnSpec,
    ) -> Result<RecordingChannel, BootstrapError> {
        self.requests.lock().push(SpawnRequest {
            fleet_size: topology.fleet_size(),
            args: spec.args(),
        });

        let failures: Vec<_> = topology
            .worker_ranks()
            .filter(|rank| self.fail_ranks.contains(rank))
            .map(|rank| SpawnFailure {
                rank,
                code: Some(127),
                reason: "injected spawn failure".into(),
            })
            .collect();

        if !failures.is_empty() {
            return Err(BootstrapError::Spawn {
                requested: topology.fleet_size(),
                failures,
            });
        }

        let (channel, _) = RecordingChannel::with_log(topology, self.log.clone());
        Ok(channel)
    }
}
