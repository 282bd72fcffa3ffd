//! In-process transport: worker threads stand in for worker processes
//!
//! Each worker has its own inbox; all workers share one inbox back to the
//! coordinator. A worker that goes away announces it with a `Departed`
//! envelope, so a coordinator waiting at a barrier fails instead of hanging.

use super::envelope::Envelope;
use super::{ControlChannel, FleetReport, FleetTopology, Launcher, Role, SpawnSpec, WorkerExit};
use crate::error::{BootstrapError, ChannelError, ChannelResult, Result, SpawnFailure};
use crate::fleet::{RunContext, StageHandler, WorkerAgent, WorkerSummary};
use crate::protocol::CommandCodec;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Exit code reported for a worker thread that panicked
const PANIC_EXIT_CODE: i32 = 101;

/// Builds the stage handler for one worker
pub type HandlerFactory = Arc<dyn Fn(&RunContext) -> Box<dyn StageHandler> + Send + Sync>;

/// Coordinator end of the in-process channel
pub struct LocalChannel {
    participants: usize,
    seq: u64,
    workers: Vec<(usize, Sender<Envelope>)>,
    inbox: Receiver<Envelope>,
    threads: Vec<(usize, JoinHandle<Result<WorkerSummary>>)>,
    released: bool,
}

/// Worker end of the in-process channel
pub struct LocalPeer {
    rank: usize,
    participants: usize,
    seq: u64,
    inbox: Receiver<Envelope>,
    coordinator: Sender<Envelope>,
    released: bool,
}

impl LocalChannel {
    /// Wire up a coordinator and one peer per worker rank
    ///
    /// No threads are started; the caller drives the peers.
    pub fn connected(topology: FleetTopology) -> (LocalChannel, Vec<LocalPeer>) {
        let (to_coordinator, inbox) = unbounded();
        let participants = topology.universe_size();

        let mut workers = Vec::with_capacity(topology.fleet_size());
        let mut peers = Vec::with_capacity(topology.fleet_size());
        for rank in topology.worker_ranks() {
            let (tx, rx) = unbounded();
            workers.push((rank, tx));
            peers.push(LocalPeer {
                rank,
                participants,
                seq: 0,
                inbox: rx,
                coordinator: to_coordinator.clone(),
                released: false,
            });
        }

        let channel = LocalChannel {
            participants,
            seq: 0,
            workers,
            inbox,
            threads: Vec::new(),
            released: false,
        };
        (channel, peers)
    }

    fn check_open(&self) -> ChannelResult<()> {
        if self.released {
            return Err(ChannelError::Released);
        }
        Ok(())
    }

    fn join_workers(&mut self) -> FleetReport {
        let mut exits = Vec::with_capacity(self.threads.len());
        for (rank, handle) in self.threads.drain(..) {
            let exit = match handle.join() {
                Ok(Ok(_)) => WorkerExit {
                    rank,
                    code: Some(0),
                    error: None,
                },
                Ok(Err(e)) => WorkerExit {
                    rank,
                    code: Some(i32::from(e.exit_code())),
                    error: Some(e.to_string()),
                },
                Err(_) => WorkerExit {
                    rank,
                    code: Some(PANIC_EXIT_CODE),
                    error: Some("worker thread panicked".into()),
                },
            };
            exits.push(exit);
        }
        FleetReport { exits }
    }
}

impl ControlChannel for LocalChannel {
    fn rank(&self) -> usize {
        super::COORDINATOR_RANK
    }

    fn participants(&self) -> usize {
        self.participants
    }

    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;

        if role != Role::Root {
            return Err(ChannelError::Broadcast {
                seq,
                rank: Some(self.rank()),
                reason: "the coordinator is always the broadcast root".into(),
            });
        }

        for (rank, inbox) in &self.workers {
            inbox
                .send(Envelope::Broadcast {
                    seq,
                    frame: frame.to_vec(),
                })
                .map_err(|_| ChannelError::Broadcast {
                    seq,
                    rank: Some(*rank),
                    reason: "worker is gone".into(),
                })?;
        }
        Ok(())
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;

        let mut arrived = vec![false; self.participants];
        let mut remaining = self.workers.len();
        while remaining > 0 {
            let envelope = self.inbox.recv().map_err(|_| ChannelError::Barrier {
                seq,
                rank: None,
                reason: "every worker has left the channel".into(),
            })?;

            match envelope {
                Envelope::Arrive { seq: s, rank }
                    if s == seq && rank < arrived.len() && !arrived[rank] =>
                {
                    arrived[rank] = true;
                    remaining -= 1;
                }
                Envelope::Departed { rank } => {
                    return Err(ChannelError::Barrier {
                        seq,
                        rank: Some(rank),
                        reason: "worker left the channel".into(),
                    });
                }
                other => {
                    return Err(ChannelError::Barrier {
                        seq,
                        rank: None,
                        reason: format!("expected arrivals for barrier #{}, got {}", seq, other),
                    });
                }
            }
        }

        for (rank, inbox) in &self.workers {
            inbox
                .send(Envelope::Release { seq })
                .map_err(|_| ChannelError::Barrier {
                    seq,
                    rank: Some(*rank),
                    reason: "worker is gone".into(),
                })?;
        }
        Ok(())
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        self.check_open()?;
        self.released = true;

        // Closing the inboxes unblocks any worker still waiting on a collective
        self.workers.clear();
        let report = self.join_workers();
        debug!(workers = report.exits.len(), "Local fleet joined");
        Ok(report)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if !self.released {
            self.workers.clear();
        }
    }
}

impl LocalPeer {
    fn check_open(&self) -> ChannelResult<()> {
        if self.released {
            return Err(ChannelError::Released);
        }
        Ok(())
    }

    fn depart(&mut self) {
        self.released = true;
        // Coordinator may already be gone
        let _ = self.coordinator.send(Envelope::Departed { rank: self.rank });
    }
}

impl ControlChannel for LocalPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn participants(&self) -> usize {
        self.participants
    }

    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;

        if role == Role::Root {
            return Err(ChannelError::Broadcast {
                seq,
                rank: Some(self.rank),
                reason: "only the coordinator may be the broadcast root".into(),
            });
        }

        match self.inbox.recv() {
            Ok(Envelope::Broadcast { seq: s, frame: data }) if s == seq => {
                if data.len() != frame.len() {
                    return Err(ChannelError::Broadcast {
                        seq,
                        rank: Some(self.rank),
                        reason: format!(
                            "received {} byte frame into {} byte buffer",
                            data.len(),
                            frame.len()
                        ),
                    });
                }
                frame.copy_from_slice(&data);
                Ok(())
            }
            Ok(other) => Err(ChannelError::Broadcast {
                seq,
                rank: Some(self.rank),
                reason: format!("expected broadcast #{}, got {}", seq, other),
            }),
            Err(_) => Err(ChannelError::Broadcast {
                seq,
                rank: Some(self.rank),
                reason: "coordinator closed the channel".into(),
            }),
        }
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;

        self.coordinator
            .send(Envelope::Arrive {
                seq,
                rank: self.rank,
            })
            .map_err(|_| ChannelError::Barrier {
                seq,
                rank: Some(self.rank),
                reason: "coordinator closed the channel".into(),
            })?;

        match self.inbox.recv() {
            Ok(Envelope::Release { seq: s }) if s == seq => Ok(()),
            Ok(other) => Err(ChannelError::Barrier {
                seq,
                rank: Some(self.rank),
                reason: format!("expected release #{}, got {}", seq, other),
            }),
            Err(_) => Err(ChannelError::Barrier {
                seq,
                rank: Some(self.rank),
                reason: "coordinator closed the channel".into(),
            }),
        }
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        self.check_open()?;
        self.depart();
        Ok(FleetReport::default())
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        if !self.released {
            self.depart();
        }
    }
}

/// Launches the fleet as threads of the current process
pub struct LocalLauncher {
    universe_size: Option<usize>,
    factory: HandlerFactory,
}

impl LocalLauncher {
    /// Launcher advertising `universe_size`; `None` models a platform that
    /// reports no capacity
    pub fn new(universe_size: Option<usize>, factory: HandlerFactory) -> Self {
        Self {
            universe_size,
            factory,
        }
    }

    /// Same as [`new`](Self::new) with a closure as the factory
    pub fn with_handler<F>(universe_size: Option<usize>, factory: F) -> Self
    where
        F: Fn(&RunContext) -> Box<dyn StageHandler> + Send + Sync + 'static,
    {
        Self::new(universe_size, Arc::new(factory))
    }
}

impl Launcher for LocalLauncher {
    type Channel = LocalChannel;

    fn universe_size(&self) -> Option<usize> {
        self.universe_size
    }

    fn spawn(&self, topology: FleetTopology, spec: &SpawnSpec) -> std::result::Result<LocalChannel, BootstrapError> {
        let (mut channel, peers) = LocalChannel::connected(topology);
        let mut failures = Vec::new();

        for peer in peers {
            let rank = peer.rank;
            let ctx = RunContext::worker(spec, rank, topology);
            let codec = CommandCodec::new(spec.frame_capacity);
            let factory = Arc::clone(&self.factory);

            let spawned = thread::Builder::new()
                .name(format!("worker-{}", rank))
                .spawn(move || {
                    let handler = factory(&ctx);
                    WorkerAgent::new(ctx, peer, codec, handler).run()
                });

            match spawned {
                Ok(handle) => channel.threads.push((rank, handle)),
                Err(e) => failures.push(SpawnFailure {
                    rank,
                    code: e.raw_os_error(),
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            warn!(failed = failures.len(), "Tearing down partially launched local fleet");
            // Release closes every inbox and joins whatever did start
            let _ = channel.release();
            return Err(BootstrapError::Spawn {
                requested: topology.fleet_size(),
                failures,
            });
        }

        debug!(workers = topology.fleet_size(), "Local fleet launched");
        Ok(channel)
    }
}
