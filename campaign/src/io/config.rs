//! Campaign configuration (TOML).
//!
//! The file already carries the resolved mission selection; the engine never
//! parses suites itself. Missing sections fall back to defaults.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::PlanMission;
use crate::io::lock::{DEFAULT_POLL_INTERVAL, DEFAULT_STALE_AFTER, DEFAULT_WAIT_TIMEOUT, LockOptions};
use crate::io::paths::validate_id;

pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CampaignSpec {
    pub campaign_id: String,
    /// Identity of the mission selection; the plan is rebuilt when it changes.
    pub spec_path: String,
    /// Overridden by `--output-root` on the command line.
    pub output_root: Option<PathBuf>,
    pub missions: Vec<MissionSpec>,
    pub flows: Vec<FlowSpec>,
    pub hooks: HookSpec,
    pub execution: ExecutionSpec,
    pub lock: LockSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionSpec {
    pub index: u32,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowSpec {
    pub flow_id: String,
    #[serde(default = "default_runner_type")]
    pub runner_type: String,
    #[serde(default)]
    pub suite_file: String,
    /// Program and arguments run once per mission by the process executor.
    #[serde(default)]
    pub command: Vec<String>,
}

fn default_runner_type() -> String {
    "process".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookSpec {
    pub before_mission: Vec<String>,
    pub after_mission: Vec<String>,
    pub on_failure: Vec<String>,
    /// Bound applied to each hook command individually.
    pub timeout_ms: u64,
}

impl Default for HookSpec {
    fn default() -> Self {
        Self {
            before_mission: Vec::new(),
            after_mission: Vec::new(),
            on_failure: Vec::new(),
            timeout_ms: DEFAULT_HOOK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionSpec {
    pub mode: ExecutionMode,
    pub stop_on_first_mission_failure: bool,
    /// 0 disables the global deadline.
    pub global_timeout_ms: u64,
    /// 0 disables the mission envelope.
    pub mission_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub continue_on_mission_timeout: bool,
    pub attempt_timeout_ms: u64,
}

impl Default for ExecutionSpec {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            stop_on_first_mission_failure: false,
            global_timeout_ms: 0,
            mission_timeout_ms: 0,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            continue_on_mission_timeout: true,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockSpec {
    pub wait_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockSpec {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT.as_millis() as u64,
            stale_after_ms: DEFAULT_STALE_AFTER.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl CampaignSpec {
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.campaign_id).context("campaign_id")?;
        if self.spec_path.trim().is_empty() {
            return Err(anyhow!("spec_path must not be empty"));
        }
        if self.flows.is_empty() {
            return Err(anyhow!("at least one [[flows]] entry is required"));
        }
        let mut flow_ids = HashSet::new();
        for flow in &self.flows {
            validate_id(&flow.flow_id).with_context(|| format!("flow_id '{}'", flow.flow_id))?;
            if !flow_ids.insert(flow.flow_id.as_str()) {
                return Err(anyhow!("duplicate flow_id '{}'", flow.flow_id));
            }
        }
        let mut indexes = HashSet::new();
        for mission in &self.missions {
            validate_id(&mission.id).with_context(|| format!("mission {} id", mission.index))?;
            if !indexes.insert(mission.index) {
                return Err(anyhow!("duplicate mission index {}", mission.index));
            }
        }
        if self.hooks.timeout_ms == 0 {
            return Err(anyhow!("hooks.timeout_ms must be > 0"));
        }
        if self.execution.heartbeat_interval_ms == 0 {
            return Err(anyhow!("execution.heartbeat_interval_ms must be > 0"));
        }
        if self.execution.attempt_timeout_ms == 0 {
            return Err(anyhow!("execution.attempt_timeout_ms must be > 0"));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(anyhow!("lock.poll_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Process executor flows must name a program to run.
    pub fn validate_commands(&self) -> Result<()> {
        for flow in &self.flows {
            if flow.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!(
                    "flow '{}' command must be a non-empty array",
                    flow.flow_id
                ));
            }
        }
        Ok(())
    }

    /// Mission selection in configuration order.
    pub fn selected_missions(&self) -> Vec<PlanMission> {
        self.missions
            .iter()
            .map(|mission| PlanMission::new(mission.index, mission.id.clone()))
            .collect()
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            wait_timeout: Duration::from_millis(self.lock.wait_timeout_ms),
            stale_after: Duration::from_millis(self.lock.stale_after_ms),
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hooks.timeout_ms)
    }

    pub fn global_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.execution.global_timeout_ms)
    }

    pub fn mission_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.execution.mission_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.execution.heartbeat_interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.attempt_timeout_ms)
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Load and validate a campaign file.
pub fn load_spec(path: &Path) -> Result<CampaignSpec> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let spec: CampaignSpec =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
campaign_id = "nightly"
spec_path = "suites/nightly.toml"

[[missions]]
index = 0
id = "fix-bug"

[[missions]]
index = 1
id = "add-test"

[[flows]]
flow_id = "codex"
command = ["./run-agent.sh", "--fast"]

[execution]
mode = "parallel"
mission_timeout_ms = 60000
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let spec: CampaignSpec = toml::from_str(SAMPLE).expect("parse");
        spec.validate().expect("valid");
        spec.validate_commands().expect("commands");

        assert_eq!(spec.flows[0].runner_type, "process");
        assert_eq!(spec.execution.mode, ExecutionMode::Parallel);
        assert_eq!(spec.mission_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(spec.global_timeout(), None);
        assert_eq!(spec.hook_timeout(), Duration::from_secs(15));
        assert_eq!(spec.heartbeat_interval(), Duration::from_secs(5));
        assert!(spec.execution.continue_on_mission_timeout);
        assert_eq!(spec.lock_options(), LockOptions::default());
        assert_eq!(
            spec.selected_missions(),
            vec![PlanMission::new(0, "fix-bug"), PlanMission::new(1, "add-test")]
        );
    }

    #[test]
    fn duplicate_flow_ids_are_rejected() {
        let mut spec: CampaignSpec = toml::from_str(SAMPLE).expect("parse");
        spec.flows.push(spec.flows[0].clone());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate flow_id"));
    }

    #[test]
    fn duplicate_mission_indexes_are_rejected() {
        let mut spec: CampaignSpec = toml::from_str(SAMPLE).expect("parse");
        spec.missions[1].index = 0;
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate mission index"));
    }

    #[test]
    fn unsafe_campaign_id_is_rejected() {
        let mut spec: CampaignSpec = toml::from_str(SAMPLE).expect("parse");
        spec.campaign_id = "../escape".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn empty_command_is_rejected_for_process_flows() {
        let mut spec: CampaignSpec = toml::from_str(SAMPLE).expect("parse");
        spec.flows[0].command.clear();
        spec.validate().expect("structure is still valid");
        assert!(spec.validate_commands().is_err());
    }

    #[test]
    fn load_spec_reports_path_on_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("campaign.toml");
        fs::write(&path, "campaign_id = \"\"\n").expect("write");
        let err = load_spec(&path).unwrap_err();
        assert!(format!("{err:#}").contains("campaign.toml"));
    }
}
