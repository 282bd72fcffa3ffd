//! Bringing the fleet up: capacity discovery, fleet size, spawn

use super::RunContext;
use crate::channel::{FleetTopology, Launcher, SpawnSpec};
use crate::error::BootstrapError;
use tracing::{debug, info};

/// Discovers capacity and launches the worker fleet
pub struct FleetBootstrap<L> {
    launcher: L,
    spec: SpawnSpec,
    capacity_hint: Option<usize>,
}

impl<L: Launcher> FleetBootstrap<L> {
    /// `capacity_hint` is used only when the platform advertises nothing
    pub fn new(launcher: L, spec: SpawnSpec, capacity_hint: Option<usize>) -> Self {
        Self {
            launcher,
            spec,
            capacity_hint,
        }
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Total number of slots, coordinator included
    pub fn discover_capacity(&self) -> Result<usize, BootstrapError> {
        let (universe_size, source) = match self.launcher.universe_size() {
            Some(size) => (size, "platform"),
            None => match self.capacity_hint {
                Some(size) => (size, "policy capacity hint"),
                None => {
                    return Err(BootstrapError::Environment {
                        reason: "platform advertises no universe size and the policy has no capacity hint"
                            .into(),
                    })
                }
            },
        };

        if universe_size == 0 {
            return Err(BootstrapError::Environment {
                reason: format!("{} reports a universe size of 0", source),
            });
        }

        debug!(universe_size, source, "Discovered capacity");
        Ok(universe_size)
    }

    /// Workers for a universe: every slot except the coordinator's
    pub fn compute_fleet_size(universe_size: usize) -> usize {
        universe_size.saturating_sub(1)
    }

    /// Launch `fleet_size` workers and return the coordinator's channel
    pub fn spawn_fleet(&self, fleet_size: usize) -> Result<L::Channel, BootstrapError> {
        let topology = FleetTopology::with_fleet_size(fleet_size);
        info!(workers = fleet_size, run_id = %self.spec.run_id, "Spawning worker fleet");
        self.launcher.spawn(topology, &self.spec)
    }

    /// Discover, size and spawn in one step
    pub fn bootstrap(self) -> Result<(RunContext, L::Channel), BootstrapError> {
        let universe_size = self.discover_capacity()?;
        let fleet_size = Self::compute_fleet_size(universe_size);
        let topology = FleetTopology::new(universe_size)?;

        let channel = self.spawn_fleet(fleet_size)?;
        let ctx = RunContext::coordinator(&self.spec, topology);

        info!(
            run_id = %ctx.run_id(),
            universe_size,
            fleet_size,
            "Fleet is up"
        );
        Ok((ctx, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingLauncher;
    use crate::config::LogLevel;
    use std::path::PathBuf;

    fn spec() -> SpawnSpec {
        SpawnSpec {
            policy: PathBuf::from("pipeline.json"),
            run_id: "boot".into(),
            log_level: LogLevel::Info,
            frame_capacity: 256,
        }
    }

    #[test]
    fn test_platform_size_wins_over_hint() {
        let boot = FleetBootstrap::new(RecordingLauncher::new(Some(5)), spec(), Some(2));
        assert_eq!(boot.discover_capacity().unwrap(), 5);
    }

    #[test]
    fn test_hint_used_when_platform_silent() {
        let boot = FleetBootstrap::new(RecordingLauncher::new(None), spec(), Some(3));
        assert_eq!(boot.discover_capacity().unwrap(), 3);
    }

    #[test]
    fn test_no_capacity_is_environment_error() {
        let boot = FleetBootstrap::new(RecordingLauncher::new(None), spec(), None);
        assert!(matches!(
            boot.discover_capacity(),
            Err(BootstrapError::Environment { .. })
        ));

        let boot = FleetBootstrap::new(RecordingLauncher::new(Some(0)), spec(), None);
        assert!(matches!(
            boot.discover_capacity(),
            Err(BootstrapError::Environment { .. })
        ));
    }

    #[test]
    fn test_compute_fleet_size() {
        type Boot = FleetBootstrap<RecordingLauncher>;
        assert_eq!(Boot::compute_fleet_size(1), 0);
        assert_eq!(Boot::compute_fleet_size(4), 3);
    }

    #[test]
    fn test_bootstrap_spawns_fleet() {
        let launcher = RecordingLauncher::new(Some(4));
        let boot = FleetBootstrap::new(&launcher, spec(), None);
        let (ctx, _channel) = boot.bootstrap().unwrap();

        assert!(ctx.is_coordinator());
        assert_eq!(ctx.fleet_size(), 3);

        let requests = launcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].fleet_size, 3);
        assert_eq!(requests[0].args[0], "worker");
    }

    #[test]
    fn test_spawn_failure_aborts_bootstrap() {
        let launcher = RecordingLauncher::new(Some(4)).failing([2]);
        let boot = FleetBootstrap::new(&launcher, spec(), None);

        match boot.bootstrap() {
            Err(BootstrapError::Spawn {
                requested,
                failures,
            }) => {
                assert_eq!(requested, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].rank, 2);
            }
            Err(other) => panic!("expected spawn error, got {}", other),
            Ok(_) => panic!("bootstrap should fail"),
        }
        // No collective was attempted
        assert!(launcher.log().is_empty());
    }
}
