//! Control channel between the coordinator and the worker fleet
//!
//! The coordinator and every worker hold one end of a [`ControlChannel`].
//! All traffic is collective: the coordinator broadcasts a command frame and
//! then, for rounds that need it, every participant joins a barrier.
//!
//! Transports:
//! - [`local`]: worker threads inside the coordinator process
//! - [`socket`]: worker OS processes connected over loopback TCP
//! - [`recording`]: no workers at all, records the call sequence
//!
//! A [`Launcher`] knows how to ask its platform for capacity and how to
//! bring a fleet up. It hands back the coordinator end of the channel.

pub mod envelope;
pub mod local;
pub mod recording;
pub mod socket;

use crate::config::LogLevel;
use crate::error::{BootstrapError, ChannelResult};
use std::ffi::OsString;
use std::ops::RangeInclusive;
use std::path::PathBuf;

pub use local::{HandlerFactory, LocalChannel, LocalLauncher, LocalPeer};
pub use recording::{CallLog, ChannelCall, RecordingChannel, RecordingLauncher, SpawnRequest};
pub use socket::{ProcessLauncher, SocketChannel, SocketPeer};

/// Rank of the coordinator in every fleet
pub const COORDINATOR_RANK: usize = 0;

/// Which side of a broadcast a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the frame (coordinator only)
    Root,
    /// Receives the frame into its buffer
    Receiver,
}

/// Shape of the fleet: one coordinator slot plus the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetTopology {
    universe_size: usize,
}

impl FleetTopology {
    /// Build a topology for `universe_size` slots
    ///
    /// One slot always belongs to the coordinator, so the universe must hold
    /// at least one.
    pub fn new(universe_size: usize) -> Result<Self, BootstrapError> {
        if universe_size == 0 {
            return Err(BootstrapError::Environment {
                reason: "universe size is 0, no slot for the coordinator".into(),
            });
        }
        Ok(Self { universe_size })
    }

    /// Topology with exactly `fleet_size` workers
    pub fn with_fleet_size(fleet_size: usize) -> Self {
        Self {
            universe_size: fleet_size + 1,
        }
    }

    pub fn universe_size(&self) -> usize {
        self.universe_size
    }

    /// Number of workers
    pub fn fleet_size(&self) -> usize {
        self.universe_size - 1
    }

    /// Ranks held by workers, `1..=fleet_size`
    pub fn worker_ranks(&self) -> RangeInclusive<usize> {
        1..=self.fleet_size()
    }

    /// True if `rank` belongs to this fleet
    pub fn contains(&self, rank: usize) -> bool {
        rank < self.universe_size
    }
}

/// What every worker is launched with
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Pipeline policy the workers load
    pub policy: PathBuf,
    /// Run identifier shared by the fleet
    pub run_id: String,
    /// Worker log level
    pub log_level: LogLevel,
    /// Command frame size
    pub frame_capacity: usize,
}

impl SpawnSpec {
    /// Worker command line, after the program name
    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from("worker"),
            self.policy.clone().into_os_string(),
            OsString::from(&self.run_id),
            OsString::from("--log-level"),
            OsString::from(self.log_level.as_str()),
        ]
    }
}

/// How one worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub rank: usize,
    /// Exit code, `None` when the worker was killed by a signal
    pub code: Option<i32>,
    /// What went wrong, if anything was reported
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn succeeded(&self) -> bool {
        self.code == Some(0) && self.error.is_none()
    }
}

/// Per-worker outcome collected when the channel is released
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub exits: Vec<WorkerExit>,
}

impl FleetReport {
    /// True when every worker exited cleanly
    pub fn all_succeeded(&self) -> bool {
        self.exits.iter().all(WorkerExit::succeeded)
    }

    /// Workers that did not exit cleanly
    pub fn failures(&self) -> impl Iterator<Item = &WorkerExit> {
        self.exits.iter().filter(|e| !e.succeeded())
    }

    pub fn exit_of(&self, rank: usize) -> Option<&WorkerExit> {
        self.exits.iter().find(|e| e.rank == rank)
    }
}

/// One end of the control channel
///
/// Collectives block until every participant has joined. Only the
/// coordinator may be the root of a broadcast. After [`release`] every
/// operation fails with [`ChannelError::Released`](crate::error::ChannelError::Released).
///
/// [`release`]: ControlChannel::release
pub trait ControlChannel: Send {
    /// Rank of this participant (0 is the coordinator)
    fn rank(&self) -> usize;

    /// Number of participants, coordinator included
    fn participants(&self) -> usize;

    /// Send `frame` to every worker (root) or receive into it (receiver)
    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()>;

    /// Block until every participant has arrived
    fn barrier(&mut self) -> ChannelResult<()>;

    /// Tear down this end of the channel
    ///
    /// On the coordinator this waits for the workers and reports how each
    /// one exited. On a worker the report is empty.
    fn release(&mut self) -> ChannelResult<FleetReport>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn participants(&self) -> usize {
        (**self).participants()
    }

    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()> {
        (**self).broadcast(frame, role)
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        (**self).barrier()
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        (**self).release()
    }
}

/// Brings a fleet up on some platform
pub trait Launcher {
    /// Coordinator end of the channel this launcher produces
    type Channel: ControlChannel;

    /// Universe size the platform advertises, if any
    fn universe_size(&self) -> Option<usize>;

    /// Launch one worker per rank in `topology.worker_ranks()`
    ///
    /// Either every worker is up and connected, or none is left running.
    fn spawn(&self, topology: FleetTopology, spec: &SpawnSpec)
        -> Result<Self::Channel, BootstrapError>;
}

impl<L: Launcher + ?Sized> Launcher for &L {
    type Channel = L::Channel;

    fn universe_size(&self) -> Option<usize> {
        (**self).universe_size()
    }

    fn spawn(
        &self,
        topology: FleetTopology,
        spec: &SpawnSpec,
    ) -> Result<Self::Channel, BootstrapError> {
        (**self).spawn(topology, spec)
    }
}
