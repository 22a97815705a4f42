//! Mission executor seam.
//!
//! The [`MissionExecutor`] trait decouples the campaign engine from how an
//! attempt actually runs. The engine ships [`CommandMissionExecutor`], which runs
//! each flow's configured command once per mission; tests use scripted
//! executors that return predetermined flow results.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::reason_codes;
use crate::core::types::{AttemptOutcome, AttemptStatus, FlowRun, PlanMission};
use crate::io::cancel::CancelSignal;
use crate::io::config::FlowSpec;
use crate::io::process::{CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// One flow's invocation for one mission.
#[derive(Debug, Clone, Copy)]
pub struct MissionRequest<'a> {
    pub campaign_id: &'a str,
    pub flow: &'a FlowSpec,
    pub mission: &'a PlanMission,
    /// Cancelled when the mission envelope expires.
    pub signal: &'a CancelSignal,
}

/// Abstraction over mission execution backends.
///
/// `run_mission` may be called from several worker threads at once (one per
/// flow) when flows run in parallel.
pub trait MissionExecutor: Sync {
    /// Called once per flow before any mission runs.
    fn prepare(&self, flow: &FlowSpec) -> Result<()>;

    /// Run one mission. The returned flow result must carry the flow's identity
    /// and at least one attempt for the mission.
    fn run_mission(&self, request: &MissionRequest<'_>) -> Result<FlowRun>;

    /// Called once per flow after the mission loop; errors are logged only.
    fn cleanup(&self, flow: &FlowSpec) -> Result<()>;
}

/// Executor that spawns the flow's `command` with mission context in the environment.
///
/// Exit status 0 is a valid attempt, any other exit status is invalid. Spawn
/// failures and timeouts are infrastructure failures.
pub struct CommandMissionExecutor {
    attempts_root: PathBuf,
    attempt_timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandMissionExecutor {
    pub fn new(campaign_dir: &Path, attempt_timeout: Duration) -> Self {
        Self {
            attempts_root: campaign_dir.join("attempts"),
            attempt_timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    fn attempt_dir(&self, flow_id: &str, mission: &PlanMission) -> PathBuf {
        self.attempts_root
            .join(flow_id)
            .join(format!("{:03}-{}", mission.mission_index, mission.mission_id))
    }
}

impl MissionExecutor for CommandMissionExecutor {
    fn prepare(&self, flow: &FlowSpec) -> Result<()> {
        if flow.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("flow '{}' has no command", flow.flow_id));
        }
        let dir = self.attempts_root.join(&flow.flow_id);
        fs::create_dir_all(&dir).with_context(|| format!("create attempts dir {}", dir.display()))
    }

    #[instrument(skip_all, fields(flow = %request.flow.flow_id, mission = request.mission.mission_index))]
    fn run_mission(&self, request: &MissionRequest<'_>) -> Result<FlowRun> {
        let flow = request.flow;
        let mission = request.mission;
        let (program, args) = flow
            .command
            .split_first()
            .ok_or_else(|| anyhow!("flow '{}' has no command", flow.flow_id))?;

        let attempt_dir = self.attempt_dir(&flow.flow_id, mission);
        fs::create_dir_all(&attempt_dir)
            .with_context(|| format!("create attempt dir {}", attempt_dir.display()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("ZCL_CAMPAIGN_ID", request.campaign_id)
            .env("ZCL_FLOW_ID", &flow.flow_id)
            .env("ZCL_MISSION_INDEX", mission.mission_index.to_string())
            .env("ZCL_MISSION_ID", &mission.mission_id)
            .env("ZCL_ATTEMPT_DIR", &attempt_dir);

        info!(program = %program, "starting mission attempt");
        let (status, errors) = match run_command_with_timeout(
            cmd,
            self.attempt_timeout,
            request.signal,
            self.output_limit_bytes,
        ) {
            Ok(output) => {
                write_attempt_log(&attempt_dir.join("attempt.log"), &output)?;
                classify(&output)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "mission command could not run");
                (
                    AttemptOutcome::InfraFailed,
                    vec![reason_codes::SPAWN_FAILED.to_string()],
                )
            }
        };
        debug!(status = status.as_str(), "mission attempt finished");

        Ok(FlowRun {
            flow_id: flow.flow_id.clone(),
            runner_type: flow.runner_type.clone(),
            suite_file: flow.suite_file.clone(),
            ok: status == AttemptOutcome::Valid,
            attempts: vec![AttemptStatus {
                mission_index: mission.mission_index,
                mission_id: mission.mission_id.clone(),
                attempt_id: format!("{}-{:03}", flow.flow_id, mission.mission_index),
                attempt_dir: attempt_dir.display().to_string(),
                status,
                errors,
                claimed_status: None,
            }],
        })
    }

    fn cleanup(&self, flow: &FlowSpec) -> Result<()> {
        debug!(flow = %flow.flow_id, "cleanup");
        Ok(())
    }
}

fn classify(output: &CommandOutput) -> (AttemptOutcome, Vec<String>) {
    if output.cancelled {
        return (
            AttemptOutcome::InfraFailed,
            vec![reason_codes::MISSION_TIMEOUT.to_string()],
        );
    }
    if output.timed_out {
        return (
            AttemptOutcome::InfraFailed,
            vec![reason_codes::ATTEMPT_TIMEOUT.to_string()],
        );
    }
    if output.status.success() {
        (AttemptOutcome::Valid, Vec::new())
    } else {
        (
            AttemptOutcome::Invalid,
            vec![reason_codes::ATTEMPT_EXIT_NONZERO.to_string()],
        )
    }
}

fn write_attempt_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[stdout truncated {} bytes]\n", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[stderr truncated {} bytes]\n", output.stderr_truncated));
    }
    fs::write(path, buf).with_context(|| format!("write attempt log {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn flow(command: &[&str]) -> FlowSpec {
        FlowSpec {
            flow_id: "shell".to_string(),
            runner_type: "process".to_string(),
            suite_file: "suite.toml".to_string(),
            command: command.iter().map(|part| part.to_string()).collect(),
        }
    }

    fn run(executor: &CommandMissionExecutor, flow: &FlowSpec, signal: &CancelSignal) -> FlowRun {
        let mission = PlanMission::new(7, "fix-bug");
        executor
            .run_mission(&MissionRequest {
                campaign_id: "camp",
                flow,
                mission: &mission,
                signal,
            })
            .expect("run mission")
    }

    #[test]
    fn exit_status_decides_validity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = CommandMissionExecutor::new(temp.path(), Duration::from_secs(10));

        let ok_flow = flow(&["sh", "-c", "test \"$ZCL_MISSION_ID\" = fix-bug"]);
        executor.prepare(&ok_flow).expect("prepare");
        let result = run(&executor, &ok_flow, &CancelSignal::new());
        assert!(result.ok);
        assert_eq!(result.attempts[0].attempt_id, "shell-007");
        assert!(result.attempts[0].attempt_dir.ends_with("007-fix-bug"));

        let failing = run(&executor, &flow(&["sh", "-c", "exit 2"]), &CancelSignal::new());
        assert_eq!(failing.attempts[0].status, AttemptOutcome::Invalid);
        assert_eq!(
            failing.attempts[0].errors,
            vec![reason_codes::ATTEMPT_EXIT_NONZERO]
        );
    }

    #[test]
    fn missing_program_is_an_infra_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = CommandMissionExecutor::new(temp.path(), Duration::from_secs(10));
        let result = run(
            &executor,
            &flow(&["/definitely/not/a/program"]),
            &CancelSignal::new(),
        );
        assert_eq!(result.attempts[0].status, AttemptOutcome::InfraFailed);
        assert_eq!(result.attempts[0].errors, vec![reason_codes::SPAWN_FAILED]);
    }

    #[test]
    fn cancelled_attempt_reports_mission_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = CommandMissionExecutor::new(temp.path(), Duration::from_secs(10));
        let signal = CancelSignal::new();
        signal.cancel();
        let result = run(&executor, &flow(&["sleep", "5"]), &signal);
        assert_eq!(result.attempts[0].errors, vec![reason_codes::MISSION_TIMEOUT]);
    }

    #[test]
    fn prepare_rejects_empty_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = CommandMissionExecutor::new(temp.path(), Duration::from_secs(10));
        assert!(executor.prepare(&flow(&[])).is_err());
    }
}
