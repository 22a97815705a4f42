//! Lifecycle hook execution.
//!
//! Hook lists run strictly in order; the first failing command stops the rest
//! of its list. Each command gets its own timeout.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::{CampaignError, HookPhase};
use crate::io::cancel::CancelSignal;
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_command_with_timeout};

/// Runs a single hook command.
///
/// The signal already carries the per-command deadline.
pub trait HookRunner: Sync {
    fn run(&self, signal: &CancelSignal, command: &str) -> Result<()>;
}

/// Runs hooks through `sh -c`.
pub struct ShellHookRunner;

impl HookRunner for ShellHookRunner {
    #[instrument(skip_all, fields(command = %command))]
    fn run(&self, signal: &CancelSignal, command: &str) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let timeout = signal.remaining().unwrap_or(Duration::MAX);
        let output = run_command_with_timeout(cmd, timeout, signal, DEFAULT_OUTPUT_LIMIT_BYTES)?;
        if output.timed_out || signal.is_expired() {
            return Err(anyhow!("hook timed out"));
        }
        if output.cancelled {
            return Err(anyhow!("hook cancelled"));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "hook exited with {:?}: {}",
                output.status.code(),
                output.stderr_tail(400)
            ));
        }
        debug!("hook succeeded");
        Ok(())
    }
}

/// Run `commands` in order, stopping at the first failure.
pub fn run_hooks<H: HookRunner + ?Sized>(
    runner: &H,
    phase: HookPhase,
    commands: &[String],
    signal: &CancelSignal,
    timeout: Duration,
) -> Result<()> {
    for command in commands {
        debug!(%phase, command = %command, "running hook");
        let bounded = signal.with_timeout(timeout);
        if let Err(err) = runner.run(&bounded, command) {
            warn!(%phase, command = %command, err = %format!("{err:#}"), "hook failed");
            return Err(CampaignError::HookFailed {
                phase,
                command: command.clone(),
                message: format!("{err:#}"),
            }
            .into());
        }
    }
    Ok(())
}

/// Run failure hooks without letting their errors escape.
pub fn run_failure_hooks<H: HookRunner + ?Sized>(
    runner: &H,
    commands: &[String],
    signal: &CancelSignal,
    timeout: Duration,
) {
    if let Err(err) = run_hooks(runner, HookPhase::OnFailure, commands, signal, timeout) {
        warn!(err = %format!("{err:#}"), "on_failure hooks did not complete");
    }
}
