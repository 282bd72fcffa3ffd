//! Process transport: worker OS processes over loopback TCP
//!
//! The coordinator binds a listener on 127.0.0.1, launches one process per
//! worker rank and tells each one where to connect through the environment:
//!
//! ```text
//! FLEET_CONTROL_ADDR   listener address, e.g. 127.0.0.1:40313
//! FLEET_RANK           worker rank, 1..=fleet_size
//! FLEET_UNIVERSE_SIZE  fleet size + 1
//! ```
//!
//! A worker connects, introduces itself with its rank and from then on only
//! speaks in collectives. The coordinator holds one stream per worker.

use super::envelope::Envelope;
use super::{ControlChannel, FleetReport, FleetTopology, Launcher, Role, SpawnSpec, WorkerExit};
use crate::error::{
    BootstrapError, ChannelError, ChannelResult, ConfigError, HarnessError, SpawnFailure,
};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Environment variable holding the coordinator's listener address
pub const ENV_CONTROL_ADDR: &str = "FLEET_CONTROL_ADDR";

/// Environment variable holding the worker's rank
pub const ENV_RANK: &str = "FLEET_RANK";

/// Environment variable holding the universe size
pub const ENV_UNIVERSE_SIZE: &str = "FLEET_UNIVERSE_SIZE";

/// Default time allowed for the whole fleet to connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for workers to exit after release
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Launches workers as child processes of the coordinator
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    universe_size: Option<usize>,
    connect_timeout: Duration,
    reap_timeout: Duration,
}

impl ProcessLauncher {
    /// Launcher that runs `program` for every worker
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            universe_size: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }

    /// Launcher that re-runs the current executable
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Universe size to advertise (from the operator or the environment)
    pub fn with_universe_size(mut self, universe_size: Option<usize>) -> Self {
        self.universe_size = universe_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Accept one connection per worker, checking for early exits
    fn accept_fleet(
        &self,
        listener: &TcpListener,
        topology: FleetTopology,
        workers: &mut [WorkerProcess],
    ) -> Result<Vec<Peer>, Vec<SpawnFailure>> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut streams: Vec<Option<TcpStream>> =
            (0..topology.universe_size()).map(|_| None).collect();
        let mut connected = 0;

        while connected < topology.fleet_size() {
            match listener.accept() {
                Ok((stream, from)) => match handshake(stream, topology, deadline) {
                    Ok((rank, stream)) => {
                        if streams[rank].is_some() {
                            warn!(rank, %from, "Duplicate connection for rank, dropping it");
                            continue;
                        }
                        debug!(rank, %from, "Worker connected");
                        streams[rank] = Some(stream);
                        connected += 1;
                    }
                    Err(e) => warn!(%from, error = %e, "Rejected control connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let exited = exited_before_connecting(workers, &streams);
                    if !exited.is_empty() {
                        return Err(exited);
                    }
                    if Instant::now() >= deadline {
                        return Err(unconnected(
                            &streams,
                            topology,
                            &format!("did not connect within {:?}", self.connect_timeout),
                        ));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(unconnected(&streams, topology, &e.to_string())),
            }
        }

        Ok(streams
            .into_iter()
            .enumerate()
            .filter_map(|(rank, stream)| stream.map(|stream| Peer { rank, stream }))
            .collect())
    }
}

impl Launcher for ProcessLauncher {
    type Channel = SocketChannel;

    fn universe_size(&self) -> Option<usize> {
        self.universe_size
    }

    fn spawn(
        &self,
        topology: FleetTopology,
        spec: &SpawnSpec,
    ) -> Result<SocketChannel, BootstrapError> {
        let requested = topology.fleet_size();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|l| {
                l.set_nonblocking(true)?;
                Ok(l)
            })
            .map_err(|e| BootstrapError::Spawn {
                requested,
                failures: unconnected(&[], topology, &format!("cannot listen: {}", e)),
            })?;
        let addr = listener.local_addr().map_err(|e| BootstrapError::Spawn {
            requested,
            failures: unconnected(&[], topology, &e.to_string()),
        })?;

        info!(
            program = %self.program.display(),
            workers = requested,
            %addr,
            "Launching worker processes"
        );

        let mut workers = Vec::with_capacity(requested);
        let mut failures = Vec::new();
        for rank in topology.worker_ranks() {
            let spawned = Command::new(&self.program)
                .args(spec.args())
                .env(ENV_CONTROL_ADDR, addr.to_string())
                .env(ENV_RANK, rank.to_string())
                .env(ENV_UNIVERSE_SIZE, topology.universe_size().to_string())
                .stdin(Stdio::null())
                .spawn();

            match spawned {
                Ok(child) => workers.push(WorkerProcess { rank, child }),
                Err(e) => failures.push(SpawnFailure {
                    rank,
                    code: e.raw_os_error(),
                    reason: format!("cannot launch {}: {}", self.program.display(), e),
                }),
            }
        }

        if failures.is_empty() {
            match self.accept_fleet(&listener, topology, &mut workers) {
                Ok(peers) => {
                    return Ok(SocketChannel {
                        participants: topology.universe_size(),
                        seq: 0,
                        peers,
                        workers,
                        reap_timeout: self.reap_timeout,
                        released: false,
                    });
                }
                Err(accept_failures) => failures = accept_failures,
            }
        }

        warn!(
            failed = failures.len(),
            launched = workers.len(),
            "Fleet launch failed, killing launched workers"
        );
        kill_all(&mut workers);
        Err(BootstrapError::Spawn {
            requested,
            failures,
        })
    }
}

/// Read the worker's hello, bounded by the connect deadline
fn handshake(
    mut stream: TcpStream,
    topology: FleetTopology,
    deadline: Instant,
) -> io::Result<(usize, TcpStream)> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1));
    stream.set_read_timeout(Some(remaining))?;

    let hello = Envelope::read_from(&mut stream)?;
    stream.set_read_timeout(None)?;

    match hello {
        Envelope::Hello { rank } if rank != super::COORDINATOR_RANK && topology.contains(rank) => {
            Ok((rank, stream))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected hello from a worker rank, got {}", other),
        )),
    }
}

fn exited_before_connecting(
    workers: &mut [WorkerProcess],
    streams: &[Option<TcpStream>],
) -> Vec<SpawnFailure> {
    let mut failures = Vec::new();
    for worker in workers.iter_mut() {
        if streams[worker.rank].is_some() {
            continue;
        }
        match worker.child.try_wait() {
            Ok(Some(status)) => failures.push(SpawnFailure {
                rank: worker.rank,
                code: status.code(),
                reason: format!("exited before connecting ({})", status),
            }),
            Ok(None) => {}
            Err(e) => failures.push(SpawnFailure {
                rank: worker.rank,
                code: e.raw_os_error(),
                reason: e.to_string(),
            }),
        }
    }
    failures
}

fn unconnected(
    streams: &[Option<TcpStream>],
    topology: FleetTopology,
    reason: &str,
) -> Vec<SpawnFailure> {
    topology
        .worker_ranks()
        .filter(|&rank| streams.get(rank).map_or(true, Option::is_none))
        .map(|rank| SpawnFailure {
            rank,
            code: None,
            reason: reason.to_string(),
        })
        .collect()
}

fn kill_all(workers: &mut [WorkerProcess]) {
    for worker in workers.iter_mut() {
        let _ = worker.child.kill();
        let _ = worker.child.wait();
    }
}

struct WorkerProcess {
    rank: usize,
    child: Child,
}

struct Peer {
    rank: usize,
    stream: TcpStream,
}

/// Coordinator end of the process transport
pub struct SocketChannel {
    participants: usize,
    seq: u64,
    peers: Vec<Peer>,
    workers: Vec<WorkerProcess>,
    reap_timeout: Duration,
    released: bool,
}

impl SocketChannel {
    fn check_open(&self) -> ChannelResult<()> {
        if self.released {
            return Err(ChannelError::Released);
        }
        Ok(())
    }

    /// Wait for every worker process, killing the ones that outlive the timeout
    fn reap(&mut self) -> FleetReport {
        let deadline = Instant::now() + self.reap_timeout;
        let mut exits: Vec<Option<WorkerExit>> = self.workers.iter().map(|_| None).collect();

        loop {
            for (slot, worker) in exits.iter_mut().zip(self.workers.iter_mut()) {
                if slot.is_some() {
                    continue;
                }
                match worker.child.try_wait() {
                    Ok(Some(status)) => {
                        *slot = Some(WorkerExit {
                            rank: worker.rank,
                            code: status.code(),
                            error: None,
                        })
                    }
                    Ok(None) => {}
                    Err(e) => {
                        *slot = Some(WorkerExit {
                            rank: worker.rank,
                            code: None,
                            error: Some(e.to_string()),
                        })
                    }
                }
            }

            if exits.iter().all(Option::is_some) {
                break;
            }

            if Instant::now() >= deadline {
                for (slot, worker) in exits.iter_mut().zip(self.workers.iter_mut()) {
                    if slot.is_some() {
                        continue;
                    }
                    warn!(rank = worker.rank, "Worker still running after release, killing it");
                    let _ = worker.child.kill();
                    let code = worker.child.wait().ok().and_then(|s| s.code());
                    *slot = Some(WorkerExit {
                        rank: worker.rank,
                        code,
                        error: Some(format!("killed after {:?} reap timeout", self.reap_timeout)),
                    });
                }
                break;
            }

            thread::sleep(REAP_POLL_INTERVAL);
        }

        self.workers.clear();
        FleetReport {
            exits: exits.into_iter().flatten().collect(),
        }
    }
}

impl ControlChannel for SocketChannel {
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

        let envelope = Envelope::Broadcast {
            seq,
            frame: frame.to_vec(),
        };
        for peer in &mut self.peers {
            envelope
                .write_to(&mut peer.stream)
                .map_err(|e| ChannelError::Broadcast {
                    seq,
                    rank: Some(peer.rank),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;

        for peer in &mut self.peers {
            let rank = peer.rank;
            let barrier_error = |reason: String| ChannelError::Barrier {
                seq,
                rank: Some(rank),
                reason,
            };
            match Envelope::read_from(&mut peer.stream) {
                Ok(Envelope::Arrive { seq: s, rank: r }) if s == seq && r == rank => {}
                Ok(Envelope::Departed { .. }) => {
                    return Err(barrier_error("worker left the channel".into()))
                }
                Ok(other) => {
                    return Err(barrier_error(format!(
                        "expected arrive #{}, got {}",
                        seq, other
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(barrier_error("worker disconnected".into()))
                }
                Err(e) => return Err(barrier_error(e.to_string())),
            }
        }

        let release = Envelope::Release { seq };
        for peer in &mut self.peers {
            release
                .write_to(&mut peer.stream)
                .map_err(|e| ChannelError::Barrier {
                    seq,
                    rank: Some(peer.rank),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        self.check_open()?;
        self.released = true;

        // Closed streams unblock every worker still inside a collective
        for peer in self.peers.drain(..) {
            let _ = peer.stream.shutdown(Shutdown::Both);
        }

        let report = self.reap();
        debug!(workers = report.exits.len(), "Worker processes reaped");
        Ok(report)
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        if !self.released {
            kill_all(&mut self.workers);
        }
    }
}

/// Worker end of the process transport
pub struct SocketPeer {
    rank: usize,
    topology: FleetTopology,
    seq: u64,
    stream: TcpStream,
    released: bool,
}

impl SocketPeer {
    /// Connect using the environment the coordinator set for this process
    pub fn from_env() -> Result<Self, HarnessError> {
        let addr: SocketAddr = env_var(ENV_CONTROL_ADDR)?;
        let rank: usize = env_var(ENV_RANK)?;
        let universe_size: usize = env_var(ENV_UNIVERSE_SIZE)?;

        let topology = FleetTopology::new(universe_size)?;
        if rank == super::COORDINATOR_RANK || !topology.contains(rank) {
            return Err(ConfigError::InvalidWorkerEnv {
                name: ENV_RANK,
                value: rank.to_string(),
            }
            .into());
        }

        Ok(Self::connect(addr, rank, topology)?)
    }

    /// Connect to the coordinator at `addr` as worker `rank`
    pub fn connect(addr: SocketAddr, rank: usize, topology: FleetTopology) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Envelope::Hello { rank }.write_to(&mut stream)?;
        debug!(rank, %addr, "Connected to coordinator");

        Ok(Self {
            rank,
            topology,
            seq: 0,
            stream,
            released: false,
        })
    }

    pub fn topology(&self) -> FleetTopology {
        self.topology
    }

    fn check_open(&self) -> ChannelResult<()> {
        if self.released {
            return Err(ChannelError::Released);
        }
        Ok(())
    }

    fn depart(&mut self) {
        self.released = true;
        // Coordinator may already have closed its end
        let _ = Envelope::Departed { rank: self.rank }.write_to(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl ControlChannel for SocketPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn participants(&self) -> usize {
        self.topology.universe_size()
    }

    fn broadcast(&mut self, frame: &mut [u8], role: Role) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;
        let rank = self.rank;
        let broadcast_error = |reason: String| ChannelError::Broadcast {
            seq,
            rank: Some(rank),
            reason,
        };

        if role == Role::Root {
            return Err(broadcast_error(
                "only the coordinator may be the broadcast root".into(),
            ));
        }

        match Envelope::read_from(&mut self.stream) {
            Ok(Envelope::Broadcast { seq: s, frame: data }) if s == seq => {
                if data.len() != frame.len() {
                    return Err(broadcast_error(format!(
                        "received {} byte frame into {} byte buffer",
                        data.len(),
                        frame.len()
                    )));
                }
                frame.copy_from_slice(&data);
                Ok(())
            }
            Ok(other) => Err(broadcast_error(format!(
                "expected broadcast #{}, got {}",
                seq, other
            ))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(broadcast_error(
                "coordinator closed the control channel".into(),
            )),
            Err(e) => Err(broadcast_error(e.to_string())),
        }
    }

    fn barrier(&mut self) -> ChannelResult<()> {
        self.check_open()?;
        self.seq += 1;
        let seq = self.seq;
        let rank = self.rank;
        let barrier_error = |reason: String| ChannelError::Barrier {
            seq,
            rank: Some(rank),
            reason,
        };

        Envelope::Arrive { seq, rank }
            .write_to(&mut self.stream)
            .map_err(|e| barrier_error(e.to_string()))?;

        match Envelope::read_from(&mut self.stream) {
            Ok(Envelope::Release { seq: s }) if s == seq => Ok(()),
            Ok(other) => Err(barrier_error(format!(
                "expected release #{}, got {}",
                seq, other
            ))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(barrier_error(
                "coordinator closed the control channel".into(),
            )),
            Err(e) => Err(barrier_error(e.to_string())),
        }
    }

    fn release(&mut self) -> ChannelResult<FleetReport> {
        self.check_open()?;
        self.depart();
        Ok(FleetReport::default())
    }
}

impl Drop for SocketPeer {
    fn drop(&mut self) {
        if !self.released {
            self.depart();
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
    let value = std::env::var(name).map_err(|_| ConfigError::MissingWorkerEnv { name })?;
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => Err(ConfigError::InvalidWorkerEnv { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command as FleetCommand, CommandCodec};

    /// Coordinator channel over already-accepted streams, no child processes
    fn pair(fleet_size: usize) -> (SocketChannel, Vec<SocketPeer>) {
        let topology = FleetTopology::with_fleet_size(fleet_size);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut peers = Vec::new();
        let mut accepted = Vec::new();
        for rank in topology.worker_ranks() {
            peers.push(SocketPeer::connect(addr, rank, topology).unwrap());
            let (stream, _) = listener.accept().unwrap();
            let (rank, stream) =
                handshake(stream, topology, Instant::now() + Duration::from_secs(5)).unwrap();
            accepted.push(Peer { rank, stream });
        }

        let channel = SocketChannel {
            participants: topology.universe_size(),
            seq: 0,
            peers: accepted,
            workers: Vec::new(),
            reap_timeout: Duration::from_millis(100),
            released: false,
        };
        (channel, peers)
    }

    #[test]
    fn test_round_over_tcp() {
        let codec = CommandCodec::new(24);
        let (mut coordinator, peers) = pair(2);

        let handles: Vec<_> = peers
            .into_iter()
            .map(|mut peer| {
                thread::spawn(move || {
                    let mut frame = codec.empty_frame();
                    peer.broadcast(&mut frame, Role::Receiver).unwrap();
                    peer.barrier().unwrap();
                    let command = codec.decode(&frame).unwrap();
                    peer.release().unwrap();
                    command
                })
            })
            .collect();

        let mut frame = codec.frame(&FleetCommand::Process { stage_index: 1 }).unwrap();
        coordinator.broadcast(&mut frame, Role::Root).unwrap();
        coordinator.barrier().unwrap();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), FleetCommand::Process { stage_index: 1 });
        }
        assert!(coordinator.release().unwrap().exits.is_empty());
    }

    #[test]
    fn test_departed_peer_fails_barrier() {
        let (mut coordinator, mut peers) = pair(1);
        peers[0].release().unwrap();

        let err = coordinator.barrier().unwrap_err();
        assert!(matches!(err, ChannelError::Barrier { rank: Some(1), .. }));
    }

    #[test]
    fn test_closed_coordinator_fails_receive() {
        let (mut coordinator, mut peers) = pair(1);
        coordinator.release().unwrap();

        let mut frame = vec![0u8; 16];
        let err = peers[0].broadcast(&mut frame, Role::Receiver).unwrap_err();
        assert!(matches!(err, ChannelError::Broadcast { rank: Some(1), .. }));
    }

    #[test]
    fn test_handshake_rejects_coordinator_rank() {
        let topology = FleetTopology::with_fleet_size(1);
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let _imposter = SocketPeer::connect(addr, 0, topology).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let err = handshake(stream, topology, Instant::now() + Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_spawn_failure_reports_every_rank() {
        let launcher = ProcessLauncher::new("/nonexistent/pipeline-harness-worker")
            .with_connect_timeout(Duration::from_millis(200));
        let spec = SpawnSpec {
            policy: PathBuf::from("policy.json"),
            run_id: "spawn-fail".into(),
            log_level: crate::config::LogLevel::Quiet,
            frame_capacity: 256,
        };

        let err = launcher
            .spawn(FleetTopology::with_fleet_size(2), &spec)
            .err()
            .unwrap();
        match err {
            BootstrapError::Spawn {
                requested,
                failures,
            } => {
                assert_eq!(requested, 2);
                assert_eq!(failures.iter().map(|f| f.rank).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("expected spawn error, got {:?}", other),
        }
    }
}
