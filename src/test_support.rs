//! Hand-written fakes shared by unit tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::{RiskTier, Stage, Technique};
use crate::checkpoint::RollbackToken;
use crate::driver::{StageReport, TechniqueDriver};
use crate::error::{StageError, TargetError};
use crate::monitor::AbortHandle;
use crate::selector::Plan;
use crate::target::TargetHandle;

pub fn technique(name: &str) -> Arc<Technique> {
    technique_at(name, Stage::Unlock)
}

pub fn technique_at(name: &str, stage: Stage) -> Arc<Technique> {
    Arc::new(Technique {
        name: name.to_string(),
        stage,
        requires: vec![],
        rollback_method: format!("undo-{}", name),
        risk: RiskTier::Medium,
        success_weight: 0.5,
        script: None,
    })
}

/// Plan over the given (name, stage) pairs, in order.
pub fn plan_of(steps: &[(&str, Stage)]) -> Plan {
    Plan {
        target_id: "dev".to_string(),
        operation: "test-op".to_string(),
        template: "test-op".to_string(),
        steps: steps.iter().map(|(n, s)| technique_at(n, *s)).collect(),
        alternates: vec![],
        excluded: vec![],
        verification: None,
    }
}

/// Attribute values the fake target reports; shared so a driver can raise a
/// defensive signal mid-run.
pub type SignalBoard = Arc<Mutex<HashMap<String, String>>>;

#[derive(Default)]
pub struct FakeTarget {
    responses: HashMap<String, String>,
    attributes: SignalBoard,
    commands: Mutex<Vec<String>>,
    transfers: Mutex<Vec<(String, usize)>>,
    queries: Mutex<usize>,
}

impl FakeTarget {
    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses.insert(command.to_string(), output.to_string());
        self
    }

    pub fn with_attribute(self, key: &str, value: &str) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&self, key: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn board(&self) -> SignalBoard {
        Arc::clone(&self.attributes)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn transfers(&self) -> Vec<(String, usize)> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl TargetHandle for FakeTarget {
    async fn execute(&self, command: &str) -> Result<String, TargetError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.responses.get(command).cloned().unwrap_or_default())
    }

    async fn transfer(&self, payload: &[u8], destination: &str) -> Result<bool, TargetError> {
        self.transfers
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.len()));
        Ok(true)
    }

    async fn query_attributes(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, TargetError> {
        *self.queries.lock().unwrap() += 1;
        let attributes = self.attributes.lock().unwrap();
        Ok(attributes
            .iter()
            .filter(|(k, _)| keys.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Driver that records every call and fails on demand.
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    failing_capture: HashSet<String>,
    failing_apply: HashSet<String>,
    failing_rollback: HashSet<String>,
    slow_apply: HashMap<String, Duration>,
    slow_rollback: HashMap<String, Duration>,
    raise_on_apply: HashMap<String, (SignalBoard, String, String)>,
    abort_on_apply: HashMap<String, (AbortHandle, String)>,
    verify_result: bool,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_capture: HashSet::new(),
            failing_apply: HashSet::new(),
            failing_rollback: HashSet::new(),
            slow_apply: HashMap::new(),
            slow_rollback: HashMap::new(),
            raise_on_apply: HashMap::new(),
            abort_on_apply: HashMap::new(),
            verify_result: true,
        }
    }
}

impl RecordingDriver {
    pub fn failing_capture(mut self, name: &str) -> Self {
        self.failing_capture.insert(name.to_string());
        self
    }

    pub fn failing_apply(mut self, name: &str) -> Self {
        self.failing_apply.insert(name.to_string());
        self
    }

    pub fn failing_rollback(mut self, name: &str) -> Self {
        self.failing_rollback.insert(name.to_string());
        self
    }

    pub fn slow_apply(mut self, name: &str, delay: Duration) -> Self {
        self.slow_apply.insert(name.to_string(), delay);
        self
    }

    pub fn slow_rollback(mut self, name: &str, delay: Duration) -> Self {
        self.slow_rollback.insert(name.to_string(), delay);
        self
    }

    /// When `name` applies successfully, set `key = value` on the board.
    pub fn raise_on_apply(mut self, name: &str, board: SignalBoard, key: &str, value: &str) -> Self {
        self.raise_on_apply
            .insert(name.to_string(), (board, key.to_string(), value.to_string()));
        self
    }

    /// While `name` is applying, request an operator abort through `handle`.
    pub fn abort_on_apply(mut self, name: &str, handle: AbortHandle, reason: &str) -> Self {
        self.abort_on_apply
            .insert(name.to_string(), (handle, reason.to_string()));
        self
    }

    pub fn verify_fails(mut self) -> Self {
        self.verify_result = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn of_kind(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn applies(&self) -> Vec<String> {
        self.of_kind("apply")
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.of_kind("rollback")
    }

    fn record(&self, kind: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", kind, name));
    }
}

#[async_trait]
impl TechniqueDriver for RecordingDriver {
    async fn capture(
        &self,
        technique: &Technique,
        _target: &dyn TargetHandle,
    ) -> Result<RollbackToken, StageError> {
        self.record("capture", &technique.name);
        if self.failing_capture.contains(&technique.name) {
            return Err(StageError::capture(&technique.name, "state unreadable"));
        }
        Ok(RollbackToken::new(
            technique.rollback_method.clone(),
            serde_json::json!({ "before": technique.name }),
        ))
    }

    async fn apply(
        &self,
        technique: &Technique,
        _target: &dyn TargetHandle,
    ) -> Result<StageReport, StageError> {
        self.record("apply", &technique.name);
        if let Some(delay) = self.slow_apply.get(&technique.name) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_apply.contains(&technique.name) {
            return Err(StageError::apply(&technique.name, "device refused"));
        }
        if let Some((handle, reason)) = self.abort_on_apply.get(&technique.name) {
            handle.abort(reason.clone());
        }
        if let Some((board, key, value)) = self.raise_on_apply.get(&technique.name) {
            board.lock().unwrap().insert(key.clone(), value.clone());
        }
        Ok(StageReport {
            artifacts: vec![format!("{}.log", technique.name)],
        })
    }

    async fn rollback(
        &self,
        technique: &Technique,
        _token: &RollbackToken,
        _target: &dyn TargetHandle,
    ) -> Result<(), StageError> {
        self.record("rollback", &technique.name);
        if let Some(delay) = self.slow_rollback.get(&technique.name) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_rollback.contains(&technique.name) {
            return Err(StageError::rollback(&technique.name, "restore rejected"));
        }
        Ok(())
    }

    async fn verify(&self, _plan: &Plan, _target: &dyn TargetHandle) -> Result<bool, StageError> {
        self.record("verify", "plan");
        Ok(self.verify_result)
    }
}
