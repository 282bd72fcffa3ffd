//! Run-wide values every component needs, passed explicitly

use crate::channel::{FleetTopology, SpawnSpec, COORDINATOR_RANK};
use crate::config::LogLevel;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Identity of one participant in one run
///
/// Built once at startup and read-only afterwards. The coordinator's context
/// has rank 0; each worker builds its own from the launch arguments.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    policy: PathBuf,
    rank: usize,
    topology: FleetTopology,
    log_level: LogLevel,
    started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        policy: impl Into<PathBuf>,
        rank: usize,
        topology: FleetTopology,
        log_level: LogLevel,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            policy: policy.into(),
            rank,
            topology,
            log_level,
            started_at: Utc::now(),
        }
    }

    /// Context of the coordinator for a fleet launched with `spec`
    pub fn coordinator(spec: &SpawnSpec, topology: FleetTopology) -> Self {
        Self::new(
            spec.run_id.clone(),
            spec.policy.clone(),
            COORDINATOR_RANK,
            topology,
            spec.log_level,
        )
    }

    /// Context of worker `rank` for a fleet launched with `spec`
    pub fn worker(spec: &SpawnSpec, rank: usize, topology: FleetTopology) -> Self {
        Self::new(
            spec.run_id.clone(),
            spec.policy.clone(),
            rank,
            topology,
            spec.log_level,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn policy(&self) -> &Path {
        &self.policy
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn topology(&self) -> FleetTopology {
        self.topology
    }

    pub fn fleet_size(&self) -> usize {
        self.topology.fleet_size()
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR_RANK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_share_run_identity() {
        let spec = SpawnSpec {
            policy: PathBuf::from("/etc/pipeline.json"),
            run_id: "run-42".into(),
            log_level: LogLevel::Debug,
            frame_capacity: 256,
        };
        let topology = FleetTopology::new(4).unwrap();

        let coordinator = RunContext::coordinator(&spec, topology);
        let worker = RunContext::worker(&spec, 2, topology);

        assert!(coordinator.is_coordinator());
        assert!(!worker.is_coordinator());
        assert_eq!(worker.rank(), 2);
        assert_eq!(worker.run_id(), coordinator.run_id());
        assert_eq!(worker.policy(), Path::new("/etc/pipeline.json"));
        assert_eq!(worker.fleet_size(), 3);
        assert_eq!(worker.log_level(), LogLevel::Debug);
    }
}
