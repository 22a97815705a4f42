//! Test doubles and builders for driving the engine without processes.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use crate::core::types::{
    AttemptOutcome, AttemptStatus, FlowRun, MissionGate, PlanMission, ProgressEvent, RunState,
};
use crate::io::cancel::CancelSignal;
use crate::io::clock::Clock;
use crate::io::config::{CampaignSpec, FlowSpec, MissionSpec};
use crate::io::evaluator::{AllFlowsValidEvaluator, GateEvaluator};
use crate::io::executor::{MissionExecutor, MissionRequest};
use crate::io::hooks::HookRunner;
use crate::io::paths::CampaignPaths;
use crate::io::progress::ProgressLog;
use crate::io::run_state::load_run_state_if_present;

/// Throwaway output root holding one campaign directory.
pub struct TestCampaign {
    temp: TempDir,
    paths: CampaignPaths,
}

impl TestCampaign {
    pub fn new(campaign_id: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let paths = CampaignPaths::new(temp.path(), campaign_id);
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> CampaignPaths {
        self.paths.clone()
    }

    /// Every ledger event, in append order.
    pub fn events(&self) -> Result<Vec<ProgressEvent>> {
        Ok(ProgressLog::new(&self.paths.progress_path).replay()?.events)
    }

    /// The persisted run-state snapshot, if one was written.
    pub fn state(&self) -> Result<Option<RunState>> {
        load_run_state_if_present(&self.paths.run_state_path)
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 2026-01-01T00:00:00Z.
    pub fn fixed() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_454))
    }

    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = locked(&self.now);
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *locked(&self.now)
    }
}

/// Behaviour of one scripted `run_mission` call.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Return one attempt with this outcome and these error codes.
    Attempt(AttemptOutcome, Vec<String>),
    /// Return an error from `run_mission`.
    Fail(String),
    /// Panic inside the worker.
    Panic,
    /// Advance the manual clock, then return a valid attempt.
    Slow { advance: Duration },
    /// Sleep `after` real time, advance the manual clock, then block until the
    /// signal is cancelled and return a valid attempt.
    Hang { after: Duration, advance: Duration },
    /// Advance the manual clock, then ignore cancellation and sleep `hold`
    /// real time before returning a valid attempt.
    Stuck { advance: Duration, hold: Duration },
}

/// Executor returning predetermined flow results keyed by (flow, mission index).
///
/// Unscripted calls return a single valid attempt.
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<(String, u32), ScriptedRun>>,
    clock: Option<Arc<ManualClock>>,
    failing_prepare: Option<String>,
    delay: Duration,
    calls: Mutex<Vec<(String, u32)>>,
    cleanups: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(BTreeMap::new()),
            clock: None,
            failing_prepare: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn script(self, flow_id: &str, mission_index: u32, run: ScriptedRun) -> Self {
        locked(&self.scripts).insert((flow_id.to_string(), mission_index), run);
        self
    }

    /// Shorthand for a non-valid attempt.
    pub fn outcome(self, flow_id: &str, mission_index: u32, outcome: AttemptOutcome) -> Self {
        self.script(flow_id, mission_index, ScriptedRun::Attempt(outcome, Vec::new()))
    }

    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn failing_prepare(mut self, flow_id: &str) -> Self {
        self.failing_prepare = Some(flow_id.to_string());
        self
    }

    /// Sleep this long inside every call (used to observe overlap).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `(flow_id, mission_index)` in call-start order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        locked(&self.calls).clone()
    }

    /// Mission indexes in call-start order, deduplicated across flows.
    pub fn missions_run(&self) -> Vec<u32> {
        let mut seen = Vec::new();
        for (_, index) in self.calls() {
            if !seen.contains(&index) {
                seen.push(index);
            }
        }
        seen
    }

    pub fn cleanups(&self) -> Vec<String> {
        locked(&self.cleanups).clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn scripted(&self, flow_id: &str, mission_index: u32) -> ScriptedRun {
        locked(&self.scripts)
            .get(&(flow_id.to_string(), mission_index))
            .cloned()
            .unwrap_or(ScriptedRun::Attempt(AttemptOutcome::Valid, Vec::new()))
    }
}

impl MissionExecutor for ScriptedExecutor {
    fn prepare(&self, flow: &FlowSpec) -> Result<()> {
        if self.failing_prepare.as_deref() == Some(flow.flow_id.as_str()) {
            return Err(anyhow!("prepare failed for {}", flow.flow_id));
        }
        Ok(())
    }

    fn run_mission(&self, request: &MissionRequest<'_>) -> Result<FlowRun> {
        let flow = request.flow;
        let mission = request.mission;
        locked(&self.calls).push((flow.flow_id.clone(), mission.mission_index));

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let script = self.scripted(&flow.flow_id, mission.mission_index);
        self.active.fetch_sub(1, Ordering::SeqCst);

        match script {
            ScriptedRun::Attempt(outcome, errors) => Ok(flow_result(flow, mission, outcome, &errors)),
            ScriptedRun::Fail(message) => Err(anyhow!(message)),
            ScriptedRun::Panic => panic!("scripted panic in {}", flow.flow_id),
            ScriptedRun::Slow { advance } => {
                if let Some(clock) = &self.clock {
                    clock.advance(advance);
                }
                Ok(flow_result(flow, mission, AttemptOutcome::Valid, &[]))
            }
            ScriptedRun::Hang { after, advance } => {
                thread::sleep(after);
                if let Some(clock) = &self.clock {
                    clock.advance(advance);
                }
                let started = Instant::now();
                while !request.signal.is_cancelled() && started.elapsed() < Duration::from_secs(5)
                {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(flow_result(flow, mission, AttemptOutcome::Valid, &[]))
            }
            ScriptedRun::Stuck { advance, hold } => {
                if let Some(clock) = &self.clock {
                    clock.advance(advance);
                }
                thread::sleep(hold);
                Ok(flow_result(flow, mission, AttemptOutcome::Valid, &[]))
            }
        }
    }

    fn cleanup(&self, flow: &FlowSpec) -> Result<()> {
        locked(&self.cleanups).push(flow.flow_id.clone());
        Ok(())
    }
}

/// "All flows valid" evaluator that records what it was shown.
#[derive(Default)]
pub struct ScriptedEvaluator {
    failing_mission: Option<u32>,
    seen: Mutex<Vec<(u32, Vec<String>)>>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error when asked about this mission.
    pub fn failing_on(mut self, mission_index: u32) -> Self {
        self.failing_mission = Some(mission_index);
        self
    }

    /// `(mission_index, flow ids)` per evaluation, in call order.
    pub fn evaluations(&self) -> Vec<(u32, Vec<String>)> {
        locked(&self.seen).clone()
    }
}

impl GateEvaluator for ScriptedEvaluator {
    fn evaluate(
        &self,
        spec: &CampaignSpec,
        mission_index: u32,
        mission_id: &str,
        flow_runs: &[FlowRun],
    ) -> Result<MissionGate> {
        locked(&self.seen).push((
            mission_index,
            flow_runs.iter().map(|run| run.flow_id.clone()).collect(),
        ));
        if self.failing_mission == Some(mission_index) {
            return Err(anyhow!("evaluator exploded on mission {mission_index}"));
        }
        AllFlowsValidEvaluator.evaluate(spec, mission_index, mission_id, flow_runs)
    }
}

/// Hook runner that records commands and fails the ones it is told to.
#[derive(Default)]
pub struct RecordingHookRunner {
    failing: HashSet<String>,
    seen: Mutex<Vec<String>>,
}

impl RecordingHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, command: &str) -> Self {
        self.failing.insert(command.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        locked(&self.seen).clone()
    }
}

impl HookRunner for RecordingHookRunner {
    fn run(&self, _signal: &CancelSignal, command: &str) -> Result<()> {
        locked(&self.seen).push(command.to_string());
        if self.failing.contains(command) {
            return Err(anyhow!("hook `{command}` exited 1"));
        }
        Ok(())
    }
}

/// Campaign with `mission_count` missions (`mission-<i>`) and the given flows.
///
/// Lock waits and heartbeats are shortened so tests stay fast.
pub fn campaign_spec(campaign_id: &str, flow_ids: &[&str], mission_count: u32) -> CampaignSpec {
    let mut spec = CampaignSpec {
        campaign_id: campaign_id.to_string(),
        spec_path: format!("suites/{campaign_id}.toml"),
        missions: (0..mission_count)
            .map(|index| MissionSpec {
                index,
                id: format!("mission-{index}"),
            })
            .collect(),
        flows: flow_ids
            .iter()
            .map(|flow_id| FlowSpec {
                flow_id: flow_id.to_string(),
                runner_type: "scripted".to_string(),
                suite_file: format!("suites/{campaign_id}.toml"),
                command: Vec::new(),
            })
            .collect(),
        ..CampaignSpec::default()
    };
    spec.execution.heartbeat_interval_ms = 10;
    spec.lock.wait_timeout_ms = 200;
    spec.lock.poll_interval_ms = 10;
    spec
}

/// Flow result carrying one attempt for `mission`.
pub fn flow_result(
    flow: &FlowSpec,
    mission: &PlanMission,
    outcome: AttemptOutcome,
    errors: &[String],
) -> FlowRun {
    FlowRun {
        flow_id: flow.flow_id.clone(),
        runner_type: flow.runner_type.clone(),
        suite_file: flow.suite_file.clone(),
        ok: outcome == AttemptOutcome::Valid,
        attempts: vec![AttemptStatus {
            mission_index: mission.mission_index,
            mission_id: mission.mission_id.clone(),
            attempt_id: format!("{}-{:03}", flow.flow_id, mission.mission_index),
            attempt_dir: String::new(),
            status: outcome,
            errors: errors.to_vec(),
            claimed_status: None,
        }],
    }
}
