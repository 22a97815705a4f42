//! Campaign orchestration: the per-invocation state machine.
//!
//! One call to [`CampaignEngine::run`] acquires the campaign lock, recovers the
//! plan and ledger, walks the pending missions, and leaves a terminal run-state
//! snapshot behind. Run state is only mutated here, at mission checkpoints.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::canonical::canonicalize_gate;
use crate::core::idempotency::{LedgerIndex, attempt_key, gate_key, mark_duplicate};
use crate::core::reason_codes;
use crate::core::selector::{MissionWindow, pending_missions};
use crate::core::state_update::{
    final_status, finish, mark_late, merge_flow_runs, record_gate, recover_gates,
    synthesized_failure, timeout_gate,
};
use crate::core::types::{
    FlowRun, MissionGate, PlanMission, ProgressEvent, ProgressStatus, RunState, RunStatus,
};
use crate::error::{CampaignError, HookPhase, is_lock_timeout};
use crate::exit_codes;
use crate::io::cancel::CancelSignal;
use crate::io::clock::Clock;
use crate::io::config::{CampaignSpec, ExecutionMode, FlowSpec};
use crate::io::evaluator::GateEvaluator;
use crate::io::executor::{MissionExecutor, MissionRequest};
use crate::io::hooks::{HookRunner, run_failure_hooks, run_hooks};
use crate::io::lock::with_lock;
use crate::io::paths::CampaignPaths;
use crate::io::plan_store::ensure_plan;
use crate::io::progress::ProgressLog;
use crate::io::run_state::{load_run_state_if_present, write_run_state};

/// Result of one engine invocation.
#[derive(Debug)]
pub struct CampaignOutcome {
    /// Terminal snapshot (persisted, except after a lock timeout).
    pub state: RunState,
    pub exit_code: i32,
    /// Cause of an abort or an invalid result.
    pub failure: Option<CampaignError>,
    /// Missions selected for this invocation, in plan order.
    pub pending: Vec<PlanMission>,
}

/// Orchestrates one campaign run over injected collaborators.
pub struct CampaignEngine<'a, E, G, H, C> {
    spec: &'a CampaignSpec,
    paths: CampaignPaths,
    executor: &'a E,
    evaluator: &'a G,
    hooks: &'a H,
    clock: &'a C,
    window: MissionWindow,
    run_id: Option<String>,
}

/// Mutable bookkeeping owned by the orchestrating control flow.
struct RunContext {
    run_id: String,
    log: ProgressLog,
    index: LedgerIndex,
    state: RunState,
    pending: Vec<PlanMission>,
    prepared: usize,
}

/// Flow results for one mission after every worker returned.
struct MissionResults {
    flows: Vec<FlowRun>,
    timed_out: bool,
}

struct Received {
    result: Result<FlowRun>,
    late: bool,
}

impl<'a, E, G, H, C> CampaignEngine<'a, E, G, H, C>
where
    E: MissionExecutor,
    G: GateEvaluator,
    H: HookRunner,
    C: Clock,
{
    pub fn new(
        spec: &'a CampaignSpec,
        paths: CampaignPaths,
        executor: &'a E,
        evaluator: &'a G,
        hooks: &'a H,
        clock: &'a C,
    ) -> Self {
        Self {
            spec,
            paths,
            executor,
            evaluator,
            hooks,
            clock,
            window: MissionWindow::default(),
            run_id: None,
        }
    }

    /// Restrict this invocation to a shard of plan positions.
    pub fn with_window(mut self, window: MissionWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Run the campaign to a terminal status.
    ///
    /// Handled failures (lock timeout, flow, hook, gate, deadlines) come back as
    /// an `Ok` outcome with a non-zero exit code. `Err` means the campaign
    /// directory itself could not be read or written.
    #[instrument(skip_all, fields(campaign = %self.spec.campaign_id))]
    pub fn run(&self) -> Result<CampaignOutcome> {
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| new_run_id(self.clock.now()));

        match with_lock(&self.paths.lock_path, &self.spec.lock_options(), || {
            self.run_locked(&run_id)
        }) {
            Ok(outcome) => Ok(outcome),
            Err(err) if is_lock_timeout(&err) => {
                warn!(run_id = %run_id, "campaign lock is held elsewhere");
                let now = self.clock.now();
                let mut state = RunState::new(
                    &self.spec.campaign_id,
                    &run_id,
                    &self.spec.spec_path,
                    now,
                );
                finish(
                    &mut state,
                    RunStatus::Aborted,
                    &[reason_codes::LOCK_TIMEOUT, reason_codes::ABORTED],
                );
                state.completed_at = Some(now);
                Ok(CampaignOutcome {
                    state,
                    exit_code: exit_codes::ABORTED,
                    failure: err.downcast::<CampaignError>().ok(),
                    pending: Vec::new(),
                })
            }
            Err(err) => Err(err),
        }
    }

    fn run_locked(&self, run_id: &str) -> Result<CampaignOutcome> {
        let started = self.clock.now();
        let global_deadline = self
            .spec
            .global_timeout()
            .and_then(|timeout| deadline_after(started, timeout));

        let plan = ensure_plan(
            &self.paths.plan_path,
            &self.spec.campaign_id,
            &self.spec.spec_path,
            &self.spec.selected_missions(),
            self.clock,
        )?;
        let log = ProgressLog::new(&self.paths.progress_path);
        let replay = log.replay()?;

        let mut state = self.seed_state(run_id, started)?;
        let recovered = recover_gates(&mut state, &replay.events);
        if recovered > 0 {
            info!(recovered, "recovered gates from progress ledger");
        }
        state.total_missions = plan.missions.len() as u32;
        state.mission_offset = self.window.offset;

        let pending = pending_missions(&plan.missions, replay.index.completed(), self.window);
        info!(
            run_id,
            total = plan.missions.len(),
            completed = replay.index.completed().len(),
            pending = pending.len(),
            "campaign starting"
        );
        write_run_state(&self.paths.run_state_path, &state)?;

        let mut ctx = RunContext {
            run_id: run_id.to_string(),
            log,
            index: replay.index,
            state,
            pending,
            prepared: 0,
        };

        for flow in &self.spec.flows {
            if let Err(err) = self.executor.prepare(flow) {
                let failure = CampaignError::FlowFailed {
                    flow_id: flow.flow_id.clone(),
                    stage: "prepare",
                    message: format!("{err:#}"),
                };
                return self.abort(ctx, failure, exit_codes::ABORTED, true);
            }
            ctx.prepared += 1;
        }

        let pending = ctx.pending.clone();
        for (position, mission) in pending.iter().enumerate() {
            if let Some(deadline) = global_deadline
                && self.clock.now() >= deadline
            {
                let failure = CampaignError::GlobalTimeout {
                    mission_index: mission.mission_index,
                };
                return self.abort(ctx, failure, exit_codes::INVALID, true);
            }

            if let Some((failure, exit_code, failure_hooks)) =
                self.run_mission(&mut ctx, mission, position == 0)?
            {
                return self.abort(ctx, failure, exit_code, failure_hooks);
            }
        }

        self.cleanup(ctx.prepared);
        self.complete(ctx)
    }

    /// Carry forward results of an earlier run of the same spec, or start fresh.
    fn seed_state(&self, run_id: &str, now: DateTime<Utc>) -> Result<RunState> {
        let fresh = RunState::new(
            &self.spec.campaign_id,
            run_id,
            &self.spec.spec_path,
            now,
        );
        match load_run_state_if_present(&self.paths.run_state_path)? {
            Some(previous)
                if previous.campaign_id == self.spec.campaign_id
                    && previous.spec_path == self.spec.spec_path =>
            {
                debug!(previous_run = %previous.run_id, "resuming from previous run state");
                Ok(RunState {
                    flows: previous.flows,
                    mission_gates: previous.mission_gates,
                    missions_completed: previous.missions_completed,
                    ..fresh
                })
            }
            Some(previous) => {
                info!(
                    previous_spec = %previous.spec_path,
                    "previous run state belongs to another spec; starting fresh"
                );
                Ok(fresh)
            }
            None => Ok(fresh),
        }
    }

    /// Hooks, flows, gate, and checkpoint for one mission.
    ///
    /// Returns the abort cause, exit code, and whether failure hooks still need
    /// to run, or `None` to continue with the next mission.
    #[instrument(skip_all, fields(mission = mission.mission_index, mission_id = %mission.mission_id))]
    fn run_mission(
        &self,
        ctx: &mut RunContext,
        mission: &PlanMission,
        first: bool,
    ) -> Result<Option<(CampaignError, i32, bool)>> {
        let hooks = &self.spec.hooks;
        let hook_timeout = self.spec.hook_timeout();
        let signal = CancelSignal::new();

        if let Err(err) = run_hooks(
            self.hooks,
            HookPhase::BeforeMission,
            &hooks.before_mission,
            &signal,
            hook_timeout,
        ) {
            return Ok(Some((hook_failure(err)?, exit_codes::ABORTED, true)));
        }

        let MissionResults {
            mut flows,
            timed_out,
        } = self.run_flows(ctx, mission)?;

        self.record_attempts(ctx, mission, &mut flows)?;

        let gate = if timed_out {
            let aborted = self.lifecycle_event(
                &ctx.run_id,
                mission,
                ProgressStatus::MissionAborted,
                vec![reason_codes::MISSION_TIMEOUT.to_string()],
            );
            self.append(ctx, aborted)?;
            timeout_gate(mission, &flows)
        } else {
            match self.evaluator.evaluate(
                self.spec,
                mission.mission_index,
                &mission.mission_id,
                &flows,
            ) {
                Ok(gate) => gate,
                Err(err) => {
                    let failure = CampaignError::FlowFailed {
                        flow_id: "gate-evaluator".to_string(),
                        stage: "evaluate",
                        message: format!("{err:#}"),
                    };
                    return Ok(Some((failure, exit_codes::ABORTED, true)));
                }
            }
        };
        let gate = self.settle_gate(ctx, mission, &flows, gate)?;

        if !gate.ok {
            warn!(reasons = ?gate.reasons, "mission gate failed");
            run_failure_hooks(self.hooks, &hooks.on_failure, &signal, hook_timeout);
        }

        if let Err(err) = run_hooks(
            self.hooks,
            HookPhase::AfterMission,
            &hooks.after_mission,
            &signal,
            hook_timeout,
        ) {
            return Ok(Some((hook_failure(err)?, exit_codes::ABORTED, true)));
        }

        ctx.state.updated_at = self.clock.now();
        write_run_state(&self.paths.run_state_path, &ctx.state)?;
        info!(ok = gate.ok, "mission recorded");

        if timed_out && !self.spec.execution.continue_on_mission_timeout {
            let failure = CampaignError::MissionTimeout {
                mission_index: mission.mission_index,
            };
            return Ok(Some((failure, exit_codes::INVALID, false)));
        }
        if first && !gate.ok && self.spec.execution.stop_on_first_mission_failure {
            let failure = CampaignError::FirstMissionGateFailed {
                mission_index: mission.mission_index,
            };
            return Ok(Some((failure, exit_codes::INVALID, false)));
        }
        Ok(None)
    }

    /// Run every flow for one mission and wait for all of them.
    ///
    /// Flows run on scoped workers: one per flow in parallel mode, a single
    /// worker walking the flows in order otherwise. Inside a mission envelope the
    /// wait emits watchdog heartbeats and cancels the signal on expiry; results
    /// that arrive after expiry are marked late. The flow signal is separate from
    /// the hook signal so hooks after an expiry still run.
    fn run_flows(&self, ctx: &mut RunContext, mission: &PlanMission) -> Result<MissionResults> {
        let flows = &self.spec.flows;
        let signal = &CancelSignal::new();
        let deadline = self
            .spec
            .mission_timeout()
            .and_then(|timeout| deadline_after(self.clock.now(), timeout));
        let (tx, rx) = mpsc::channel::<(usize, Result<FlowRun>)>();

        let (waited, timed_out) = thread::scope(|scope| {
            let mut handles = Vec::new();
            match self.spec.execution.mode {
                ExecutionMode::Parallel => {
                    for (position, flow) in flows.iter().enumerate() {
                        let tx = tx.clone();
                        handles.push(scope.spawn(move || {
                            let result = self.invoke(flow, mission, signal);
                            let _ = tx.send((position, result));
                        }));
                    }
                }
                ExecutionMode::Sequential => {
                    let tx = tx.clone();
                    handles.push(scope.spawn(move || {
                        for (position, flow) in flows.iter().enumerate() {
                            if signal.is_cancelled() {
                                break;
                            }
                            let result = self.invoke(flow, mission, signal);
                            if tx.send((position, result)).is_err() {
                                break;
                            }
                        }
                    }));
                }
            }
            drop(tx);

            let mut timed_out = false;
            let waited = self.await_flows(ctx, mission, &rx, deadline, signal, &mut timed_out);
            if waited.is_err() {
                signal.cancel();
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("flow worker panicked");
                }
            }
            (waited, timed_out)
        });
        let received = waited?;

        let results = flows
            .iter()
            .zip(received)
            .map(|(flow, slot)| self.settle_flow(flow, mission, slot, timed_out))
            .collect();
        Ok(MissionResults {
            flows: results,
            timed_out,
        })
    }

    fn invoke(&self, flow: &FlowSpec, mission: &PlanMission, signal: &CancelSignal) -> Result<FlowRun> {
        debug!(flow = %flow.flow_id, "invoking flow");
        self.executor.run_mission(&MissionRequest {
            campaign_id: &self.spec.campaign_id,
            flow,
            mission,
            signal,
        })
    }

    fn await_flows(
        &self,
        ctx: &mut RunContext,
        mission: &PlanMission,
        rx: &Receiver<(usize, Result<FlowRun>)>,
        deadline: Option<DateTime<Utc>>,
        signal: &CancelSignal,
        timed_out: &mut bool,
    ) -> Result<Vec<Option<Received>>> {
        let expected = self.spec.flows.len();
        let heartbeat = self.spec.heartbeat_interval();
        let mut slots: Vec<Option<Received>> = (0..expected).map(|_| None).collect();
        let mut received = 0;
        let mut last_heartbeat = Instant::now();

        while received < expected {
            // Heartbeats continue past expiry until every worker has returned.
            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let until_beat = heartbeat.saturating_sub(last_heartbeat.elapsed());
                    if *timed_out {
                        Some(until_beat.max(Duration::from_millis(1)))
                    } else {
                        let left =
                            (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                        if left.is_zero() {
                            warn!(mission = mission.mission_index, "mission envelope expired");
                            *timed_out = true;
                            signal.cancel();
                            continue;
                        }
                        Some(left.min(until_beat).max(Duration::from_millis(1)))
                    }
                }
            };

            let message = match wait {
                None => rx.recv().ok(),
                Some(wait) => match rx.recv_timeout(wait) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => {
                        if last_heartbeat.elapsed() >= heartbeat {
                            last_heartbeat = Instant::now();
                            let event = self.lifecycle_event(
                                &ctx.run_id,
                                mission,
                                ProgressStatus::WatchdogHeartbeat,
                                Vec::new(),
                            );
                            self.append(ctx, event)?;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                },
            };
            let Some((position, result)) = message else {
                break;
            };
            if let Some(slot) = slots.get_mut(position) {
                *slot = Some(Received {
                    result,
                    late: *timed_out,
                });
                received += 1;
            }
        }
        Ok(slots)
    }

    /// Turn one worker's raw outcome into the flow result the gate will see.
    fn settle_flow(
        &self,
        flow: &FlowSpec,
        mission: &PlanMission,
        slot: Option<Received>,
        timed_out: bool,
    ) -> FlowRun {
        let synthesize = |reason: &str| {
            synthesized_failure(
                &flow.flow_id,
                &flow.runner_type,
                &flow.suite_file,
                mission,
                reason,
            )
        };
        match slot {
            None if timed_out => synthesize(reason_codes::MISSION_TIMEOUT),
            None => synthesize(reason_codes::ATTEMPT_INVOCATION_FAILED),
            Some(Received {
                result: Err(err),
                late,
            }) => {
                warn!(flow = %flow.flow_id, err = %format!("{err:#}"), "flow invocation failed");
                let mut run = synthesize(reason_codes::ATTEMPT_INVOCATION_FAILED);
                if late {
                    mark_late(&mut run);
                }
                run
            }
            Some(Received {
                result: Ok(mut run),
                late,
            }) => {
                if run.flow_id != flow.flow_id {
                    warn!(expected = %flow.flow_id, got = %run.flow_id, "executor returned another flow id");
                    run.flow_id = flow.flow_id.clone();
                }
                if run.runner_type.is_empty() {
                    run.runner_type = flow.runner_type.clone();
                }
                if run.suite_file.is_empty() {
                    run.suite_file = flow.suite_file.clone();
                }
                run.attempts
                    .retain(|attempt| attempt.mission_index == mission.mission_index);
                for attempt in &mut run.attempts {
                    attempt.record_claim();
                }
                if late {
                    mark_late(&mut run);
                }
                run.refresh_ok();
                run
            }
        }
    }

    /// Idempotency check plus one ledger event per attempt.
    fn record_attempts(
        &self,
        ctx: &mut RunContext,
        mission: &PlanMission,
        flows: &mut [FlowRun],
    ) -> Result<()> {
        for flow in flows {
            let key = attempt_key(&self.spec.campaign_id, &flow.flow_id, mission.mission_index);
            for attempt in &mut flow.attempts {
                if ctx.index.has_seen(&key) {
                    warn!(key = %key, attempt = %attempt.attempt_id, "duplicate attempt");
                    mark_duplicate(attempt);
                }
                reason_codes::normalize(&mut attempt.errors);
                let event = ProgressEvent {
                    run_id: ctx.run_id.clone(),
                    mission_index: mission.mission_index,
                    mission_id: mission.mission_id.clone(),
                    flow_id: Some(flow.flow_id.clone()),
                    attempt_id: Some(attempt.attempt_id.clone()),
                    attempt_dir: (!attempt.attempt_dir.is_empty())
                        .then(|| attempt.attempt_dir.clone()),
                    status: attempt.status.into(),
                    reason_codes: attempt.errors.clone(),
                    idempotency_key: Some(key.clone()),
                    created_at: self.clock.now(),
                };
                self.append(ctx, event)?;
            }
            flow.refresh_ok();
        }
        Ok(())
    }

    /// Pin the gate to its mission, merge results, and append the gate event.
    fn settle_gate(
        &self,
        ctx: &mut RunContext,
        mission: &PlanMission,
        flows: &[FlowRun],
        mut gate: MissionGate,
    ) -> Result<MissionGate> {
        gate.mission_index = mission.mission_index;
        gate.mission_id = mission.mission_id.clone();
        canonicalize_gate(&mut gate);

        merge_flow_runs(&mut ctx.state, mission.mission_index, flows);
        record_gate(&mut ctx.state, gate.clone());

        let status = if gate.ok {
            ProgressStatus::GatePass
        } else {
            ProgressStatus::GateFail
        };
        let mut event = self.lifecycle_event(&ctx.run_id, mission, status, gate.reasons.clone());
        event.idempotency_key = Some(gate_key(&self.spec.campaign_id, mission.mission_index));
        self.append(ctx, event)?;
        Ok(gate)
    }

    fn lifecycle_event(
        &self,
        run_id: &str,
        mission: &PlanMission,
        status: ProgressStatus,
        reason_codes: Vec<String>,
    ) -> ProgressEvent {
        ProgressEvent {
            run_id: run_id.to_string(),
            mission_index: mission.mission_index,
            mission_id: mission.mission_id.clone(),
            flow_id: None,
            attempt_id: None,
            attempt_dir: None,
            status,
            reason_codes,
            idempotency_key: None,
            created_at: self.clock.now(),
        }
    }

    fn append(&self, ctx: &mut RunContext, event: ProgressEvent) -> Result<()> {
        ctx.log.append(&event)?;
        ctx.index.observe(&event);
        Ok(())
    }

    fn cleanup(&self, prepared: usize) {
        for flow in self.spec.flows.iter().take(prepared) {
            if let Err(err) = self.executor.cleanup(flow) {
                warn!(flow = %flow.flow_id, err = %format!("{err:#}"), "cleanup failed");
            }
        }
    }

    fn abort(
        &self,
        mut ctx: RunContext,
        failure: CampaignError,
        exit_code: i32,
        failure_hooks: bool,
    ) -> Result<CampaignOutcome> {
        warn!(reason = failure.reason_code(), err = %failure, "campaign aborted");
        if failure_hooks {
            run_failure_hooks(
                self.hooks,
                &self.spec.hooks.on_failure,
                &CancelSignal::new(),
                self.spec.hook_timeout(),
            );
        }
        self.cleanup(ctx.prepared);

        let now = self.clock.now();
        finish(
            &mut ctx.state,
            RunStatus::Aborted,
            &[failure.reason_code(), reason_codes::ABORTED],
        );
        ctx.state.updated_at = now;
        ctx.state.completed_at = Some(now);
        write_run_state(&self.paths.run_state_path, &ctx.state)?;
        Ok(CampaignOutcome {
            state: ctx.state,
            exit_code,
            failure: Some(failure),
            pending: ctx.pending,
        })
    }

    fn complete(&self, mut ctx: RunContext) -> Result<CampaignOutcome> {
        let now = self.clock.now();
        let status = final_status(&ctx.state);
        let (exit_code, failure) = match status {
            RunStatus::Valid => {
                finish(&mut ctx.state, RunStatus::Valid, &[]);
                (exit_codes::OK, None)
            }
            _ => {
                let failed = ctx.state.mission_gates.iter().filter(|gate| !gate.ok).count();
                let failure = CampaignError::GateFailed { failed };
                finish(&mut ctx.state, RunStatus::Invalid, &[failure.reason_code()]);
                (exit_codes::INVALID, Some(failure))
            }
        };
        ctx.state.updated_at = now;
        ctx.state.completed_at = Some(now);
        write_run_state(&self.paths.run_state_path, &ctx.state)?;
        info!(
            status = ctx.state.status.as_str(),
            missions_completed = ctx.state.missions_completed,
            "campaign finished"
        );
        Ok(CampaignOutcome {
            state: ctx.state,
            exit_code,
            failure,
            pending: ctx.pending,
        })
    }
}

fn hook_failure(err: anyhow::Error) -> Result<CampaignError> {
    match err.downcast::<CampaignError>() {
        Ok(failure) => Ok(failure),
        Err(other) => Err(other.context("run hooks")),
    }
}

fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), std::process::id())
}

/// `None` when the deadline lies beyond the representable range.
fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_embed_timestamp_and_pid() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap();
        let run_id = new_run_id(now);
        assert!(run_id.starts_with("run-20260504T030201000Z-"));
        assert!(run_id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn deadlines_beyond_range_are_unset() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap();
        assert_eq!(deadline_after(now, Duration::MAX), None);
        let deadline = deadline_after(now, Duration::from_secs(2)).expect("deadline");
        assert_eq!((deadline - now).num_seconds(), 2);
    }
}
