//! Plan executor: runs a plan stage by stage as a chain of checkpointed
//! transactions.
//!
//! Each stage is gated by the safety monitor (and the operator abort flag)
//! before and after its mutation. Any halt unwinds the checkpoint stack in
//! LIFO order; individual rollback failures are recorded and never stop the
//! remaining rollbacks.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::Technique;
use crate::checkpoint::{Checkpoint, CheckpointStack, RollbackStatus};
use crate::config::ExecutorConfig;
use crate::driver::{StageReport, TechniqueDriver};
use crate::error::{StageError, TargetError};
use crate::monitor::{AbortHandle, Check, SafetyMonitor, Trigger};
use crate::outcome::{Outcome, RollbackFailure, RunState, Termination};
use crate::selector::Plan;
use crate::target::TargetHandle;

/// Why the stage loop stopped early.
#[derive(Debug)]
enum Halt {
    Trigger(Trigger),
    Operator(String),
    MonitorDown(String),
    StageFailed { technique: String, reason: String },
    VerificationFailed(String),
}

impl Halt {
    fn terminal_state(&self) -> RunState {
        match self {
            Halt::Trigger(_) | Halt::Operator(_) => RunState::RolledBack,
            _ => RunState::Aborted,
        }
    }

    fn into_termination(self) -> Termination {
        match self {
            Halt::Trigger(trigger) => Termination::SecurityTrigger {
                severity: trigger.severity,
                flags: trigger.flags,
            },
            Halt::Operator(reason) => Termination::OperatorAbort { reason },
            Halt::MonitorDown(reason) => Termination::MonitorUnavailable { reason },
            Halt::StageFailed { technique, reason } => Termination::StageFailed { technique, reason },
            Halt::VerificationFailed(reason) => Termination::VerificationFailed { reason },
        }
    }
}

/// Owns one run against one target. Consumed by [`PlanExecutor::run`], so a
/// finished executor can never be restarted.
pub struct PlanExecutor {
    config: ExecutorConfig,
    driver: Arc<dyn TechniqueDriver>,
    abort: AbortHandle,
    state: RunState,
    stack: CheckpointStack,
    attempted: Vec<String>,
    applied: Vec<String>,
    artifacts: Vec<String>,
    rolled_back: Vec<String>,
    rollback_failures: Vec<RollbackFailure>,
}

impl PlanExecutor {
    pub fn new(config: ExecutorConfig, driver: Arc<dyn TechniqueDriver>) -> Self {
        Self {
            config,
            driver,
            abort: AbortHandle::new(),
            state: RunState::Idle,
            stack: CheckpointStack::new(),
            attempted: Vec::new(),
            applied: Vec::new(),
            artifacts: Vec::new(),
            rolled_back: Vec::new(),
            rollback_failures: Vec::new(),
        }
    }

    /// Honour `abort` at every stage boundary of this run.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Execute `plan` to a terminal state. Never fails: every error ends up
    /// in the returned outcome.
    pub async fn run(
        mut self,
        plan: &Plan,
        target: &dyn TargetHandle,
        monitor: &mut SafetyMonitor,
    ) -> Outcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        self.transition(RunState::Running);
        info!(
            run = %run_id,
            target = %plan.target_id,
            operation = %plan.operation,
            stages = plan.len(),
            "run started"
        );

        let termination = if plan.is_empty() {
            info!(run = %run_id, "no compatible plan, nothing to do");
            self.transition(RunState::Committed);
            Termination::NoViablePlan
        } else {
            match self.drive(plan, target, monitor).await {
                Ok(()) => {
                    self.transition(RunState::Committed);
                    info!(run = %run_id, applied = ?self.applied, "run committed");
                    Termination::Verified
                }
                Err(halt) => {
                    warn!(run = %run_id, cause = ?halt, "run halted, unwinding");
                    self.unwind_all(target).await;
                    self.transition(halt.terminal_state());
                    halt.into_termination()
                }
            }
        };

        let success = self.state == RunState::Committed;
        let cleanup_required = if success {
            !self.applied.is_empty()
        } else {
            !self.rollback_failures.is_empty()
        };
        if cleanup_required && !success {
            error!(
                run = %run_id,
                failures = self.rollback_failures.len(),
                "rollback incomplete, manual cleanup required"
            );
        }

        Outcome {
            run_id,
            target_id: plan.target_id.clone(),
            operation: plan.operation.clone(),
            success,
            state: self.state,
            risk_assessment: termination.risk_assessment(),
            termination,
            persistence_achieved: success && !self.applied.is_empty(),
            cleanup_required,
            techniques_applied: self.applied,
            techniques_attempted: self.attempted,
            artifacts: self.artifacts,
            rolled_back: self.rolled_back,
            rollback_failures: self.rollback_failures,
            not_applicable: plan.excluded.clone(),
            observed_flags: monitor.observed().clone(),
            monitor_events: monitor.events().to_vec(),
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
        }
    }

    async fn drive(
        &mut self,
        plan: &Plan,
        target: &dyn TargetHandle,
        monitor: &mut SafetyMonitor,
    ) -> Result<(), Halt> {
        for technique in &plan.steps {
            self.gate(target, monitor).await?;
            let report = self.execute_stage(technique, target).await?;
            // post-check runs before commit; a trigger here unwinds this stage too
            self.gate(target, monitor).await?;

            if let Some(checkpoint) = self.stack.top_mut() {
                checkpoint.commit();
            }
            self.applied.push(technique.name.clone());
            self.artifacts.extend(report.artifacts);
            info!(stage = %technique.stage, technique = %technique.name, "stage committed");
        }

        self.verify(plan, target).await
    }

    /// Abort flag first, then the safety monitor.
    async fn gate(&self, target: &dyn TargetHandle, monitor: &mut SafetyMonitor) -> Result<(), Halt> {
        if self.abort.is_requested() {
            let reason = self
                .abort
                .reason()
                .unwrap_or_else(|| "abort requested".to_string());
            return Err(Halt::Operator(reason));
        }
        match monitor.check(target).await {
            Ok(Check::Clear) => Ok(()),
            Ok(Check::Triggered(trigger)) => Err(Halt::Trigger(trigger)),
            Err(e) => Err(Halt::MonitorDown(e.to_string())),
        }
    }

    async fn execute_stage(
        &mut self,
        technique: &Arc<Technique>,
        target: &dyn TargetHandle,
    ) -> Result<StageReport, Halt> {
        let name = technique.name.clone();
        let limit = self.config.stage_timeout();
        info!(stage = %technique.stage, technique = %name, "stage started");
        self.attempted.push(name.clone());

        let token = timed(limit, &name, self.driver.capture(technique, target))
            .await
            .map_err(|e| {
                warn!(technique = %name, error = %e, "state capture failed");
                Halt::StageFailed {
                    technique: name.clone(),
                    reason: e.to_string(),
                }
            })?;
        self.stack.push(Checkpoint::new(Arc::clone(technique), token));

        match timed(limit, &name, self.driver.apply(technique, target)).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(technique = %name, error = %e, "stage failed");
                if let Some(checkpoint) = self.stack.pop() {
                    self.rollback_one(checkpoint, target).await;
                }
                Err(Halt::StageFailed {
                    technique: name,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn verify(&self, plan: &Plan, target: &dyn TargetHandle) -> Result<(), Halt> {
        let limit = self.config.verify_timeout();
        let verdict = match tokio::time::timeout(limit, self.driver.verify(plan, target)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Verification(TargetError::Timeout(limit).to_string())),
        };
        match verdict {
            Ok(true) => {
                debug!(operation = %plan.operation, "objective verified");
                Ok(())
            }
            Ok(false) => Err(Halt::VerificationFailed("objective not reached".to_string())),
            Err(e) => Err(Halt::VerificationFailed(e.to_string())),
        }
    }

    async fn rollback_one(&mut self, mut checkpoint: Checkpoint, target: &dyn TargetHandle) {
        let name = checkpoint.technique().name.clone();
        let result = checkpoint
            .rollback(self.driver.as_ref(), target, self.config.rollback_timeout())
            .await;
        debug!(technique = %name, status = ?checkpoint.status(), "checkpoint released");
        match result {
            Ok(RollbackStatus::Reverted) => self.rolled_back.push(name),
            Ok(RollbackStatus::AlreadyRolledBack) => {
                debug!(technique = %name, "checkpoint already rolled back")
            }
            Err(e) => self.rollback_failures.push(RollbackFailure {
                technique: name,
                reason: e.to_string(),
            }),
        }
    }

    /// Pop and roll back every remaining checkpoint, newest first.
    async fn unwind_all(&mut self, target: &dyn TargetHandle) {
        if self.stack.is_empty() {
            return;
        }
        info!(
            depth = self.stack.len(),
            committed = self.stack.committed_count(),
            pending = ?self.stack.names_top_down(),
            "unwinding checkpoints"
        );
        while let Some(checkpoint) = self.stack.pop() {
            self.rollback_one(checkpoint, target).await;
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(!self.state.is_terminal(), "run already finished");
        debug!(from = ?self.state, to = ?next, "executor state");
        self.state = next;
    }
}

async fn timed<T, F>(limit: Duration, technique: &str, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(StageError::target(technique, TargetError::Timeout(limit))))
}
