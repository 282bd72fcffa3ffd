//! Shell stage handler used by the `worker` subcommand
//!
//! Each stage's `command` runs under `sh -c` with the run described in the
//! environment:
//!
//! | Variable              | Value                                  |
//! |-----------------------|----------------------------------------|
//! | `FLEET_RUN_ID`        | run identifier                         |
//! | `FLEET_RANK`          | worker rank, 1-based                   |
//! | `FLEET_FLEET_SIZE`    | number of workers                      |
//! | `FLEET_STAGE_INDEX`   | 0-based stage index                    |
//! | `FLEET_STAGE_NAME`    | stage name                             |
//! | `FLEET_DIR_<NAME>`    | one per named run directory            |
//!
//! A non-zero exit fails the stage. Stages without a command do nothing.

use crate::config::{StageList, StageSpec};
use crate::directories::RunDirectories;
use crate::fleet::{RunContext, StageHandler};
use anyhow::{bail, Context};
use std::process::Command;
use tracing::debug;

/// Runs policy stage commands through the shell
pub struct ShellStage {
    run_id: String,
    rank: usize,
    fleet_size: usize,
    stages: StageList,
    dirs: RunDirectories,
    last_stage: Option<usize>,
}

impl ShellStage {
    pub fn new(ctx: &RunContext, stages: StageList, dirs: RunDirectories) -> Self {
        Self {
            run_id: ctx.run_id().to_string(),
            rank: ctx.rank(),
            fleet_size: ctx.fleet_size(),
            stages,
            dirs,
            last_stage: None,
        }
    }

    fn command(&self, script: &str, index: usize, stage: &StageSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("FLEET_RUN_ID", &self.run_id)
            .env("FLEET_RANK", self.rank.to_string())
            .env("FLEET_FLEET_SIZE", self.fleet_size.to_string())
            .env("FLEET_STAGE_INDEX", index.to_string())
            .env("FLEET_STAGE_NAME", &stage.name)
            .current_dir(self.dirs.get("work"));
        for (name, dir) in self.dirs.iter() {
            cmd.env(format!("FLEET_DIR_{}", name.to_uppercase()), dir);
        }
        cmd
    }

    fn run_script(&self, script: &str, index: usize, stage: &StageSpec, what: &str) -> anyhow::Result<()> {
        debug!(stage = %stage.name, what, "Running shell command");
        let status = self
            .command(script, index, stage)
            .status()
            .with_context(|| format!("Failed to start {} for stage '{}'", what, stage.name))?;

        if !status.success() {
            bail!("{} for stage '{}' exited with {}", what, stage.name, status);
        }
        Ok(())
    }
}

impl StageHandler for ShellStage {
    fn process(&mut self, stage_index: i32) -> anyhow::Result<()> {
        let index = usize::try_from(stage_index)
            .ok()
            .filter(|&i| i < self.stages.len())
            .with_context(|| {
                format!(
                    "Stage index {} out of range, policy has {} stages",
                    stage_index,
                    self.stages.len()
                )
            })?;
        self.last_stage = Some(index);

        let stage = self.stages.get(index).cloned().context("Stage vanished")?;
        match stage.command.as_deref() {
            Some(script) => self.run_script(script, index, &stage, "command"),
            None => {
                debug!(stage = %stage.name, "Stage has no command");
                Ok(())
            }
        }
    }

    fn sync_peers(&mut self) -> anyhow::Result<()> {
        let Some(index) = self.last_stage else {
            return Ok(());
        };
        let Some(stage) = self.stages.get(index).cloned() else {
            return Ok(());
        };
        match stage.sync_command.as_deref() {
            Some(script) => self.run_script(script, index, &stage, "sync command"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FleetTopology, SpawnSpec};
    use crate::config::LogLevel;
    use crate::directories::DirPolicy;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell_stage(temp: &TempDir, stages: Vec<StageSpec>) -> ShellStage {
        let spec = SpawnSpec {
            policy: PathBuf::from("pipeline.json"),
            run_id: "shell".into(),
            log_level: LogLevel::Quiet,
            frame_capacity: 256,
        };
        let ctx = RunContext::worker(&spec, 2, FleetTopology::with_fleet_size(3));
        let dirs = RunDirectories::resolve_in(temp.path(), &DirPolicy::default(), "p", "shell");
        dirs.create_all().unwrap();
        ShellStage::new(&ctx, StageList::new(stages).unwrap(), dirs)
    }

    #[test]
    fn test_command_sees_fleet_environment() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("env.txt");
        let mut stage = StageSpec::named("detrend");
        stage.command = Some(format!(
            "echo \"$FLEET_RUN_ID $FLEET_RANK $FLEET_FLEET_SIZE $FLEET_STAGE_INDEX $FLEET_STAGE_NAME\" > {}",
            out.display()
        ));

        let mut handler = shell_stage(&temp, vec![stage]);
        handler.process(0).unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "shell 2 3 0 detrend");
    }

    #[test]
    fn test_dir_variables_exported() {
        let temp = TempDir::new().unwrap();
        let mut stage = StageSpec::named("write");
        stage.command = Some("touch \"$FLEET_DIR_OUTPUT/done\"".into());

        let mut handler = shell_stage(&temp, vec![stage]);
        handler.process(0).unwrap();
        assert!(temp.path().join("shell/output/done").exists());
    }

    #[test]
    fn test_failing_command_fails_stage() {
        let temp = TempDir::new().unwrap();
        let mut stage = StageSpec::named("broken");
        stage.command = Some("exit 3".into());

        let mut handler = shell_stage(&temp, vec![stage]);
        let err = handler.process(0).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_stage_without_command_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut handler = shell_stage(&temp, vec![StageSpec::named("idle")]);
        assert!(handler.process(0).is_ok());
        assert!(handler.sync_peers().is_ok());
    }

    #[test]
    fn test_out_of_range_index() {
        let temp = TempDir::new().unwrap();
        let mut handler = shell_stage(&temp, vec![StageSpec::named("only")]);
        assert!(handler.process(1).is_err());
        assert!(handler.process(-1).is_err());
    }

    #[test]
    fn test_sync_runs_last_stage_sync_command() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("synced");
        let mut stage = StageSpec::named("calibrate");
        stage.share_data = true;
        stage.sync_command = Some(format!("echo $FLEET_STAGE_NAME > {}", marker.display()));

        let mut handler = shell_stage(&temp, vec![stage]);
        handler.process(0).unwrap();
        handler.sync_peers().unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "calibrate");
    }
}
