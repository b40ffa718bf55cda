//! Technique drivers: the seam between the executor's sequencing and what a
//! technique actually does to the target.
//!
//! The executor never interprets a technique. It asks a driver to capture
//! rollback state, apply, roll back and verify, and sequences those calls
//! under its transaction rules.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{ScriptStep, Technique, TechniqueScript};
use crate::checkpoint::RollbackToken;
use crate::error::StageError;
use crate::selector::Plan;
use crate::target::TargetHandle;

/// Result of a successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub artifacts: Vec<String>,
}

#[async_trait]
pub trait TechniqueDriver: Send + Sync {
    /// Capture the state needed to undo `technique`. Must not mutate the target.
    async fn capture(
        &self,
        technique: &Technique,
        target: &dyn TargetHandle,
    ) -> Result<RollbackToken, StageError>;

    /// Perform the technique's mutation.
    async fn apply(
        &self,
        technique: &Technique,
        target: &dyn TargetHandle,
    ) -> Result<StageReport, StageError>;

    /// Undo the technique using the state captured before it ran.
    async fn rollback(
        &self,
        technique: &Technique,
        token: &RollbackToken,
        target: &dyn TargetHandle,
    ) -> Result<(), StageError>;

    /// End-to-end check once every stage of `plan` has committed.
    async fn verify(&self, plan: &Plan, target: &dyn TargetHandle) -> Result<bool, StageError>;
}

/// Driver backed by the command scripts declared in the catalog.
#[derive(Debug, Default, Clone)]
pub struct ScriptedDriver;

impl ScriptedDriver {
    pub fn new() -> Self {
        Self
    }

    fn script<'a>(technique: &'a Technique) -> Option<&'a TechniqueScript> {
        technique.script.as_ref()
    }
}

#[async_trait]
impl TechniqueDriver for ScriptedDriver {
    async fn capture(
        &self,
        technique: &Technique,
        target: &dyn TargetHandle,
    ) -> Result<RollbackToken, StageError> {
        let script = Self::script(technique)
            .ok_or_else(|| StageError::capture(&technique.name, "technique has no script"))?;
        let output = target
            .execute(&script.capture)
            .await
            .map_err(|e| StageError::target(&technique.name, e))?;
        debug!(technique = %technique.name, bytes = output.len(), "rollback state captured");
        Ok(RollbackToken::new(
            technique.rollback_method.clone(),
            serde_json::Value::String(output.trim().to_string()),
        ))
    }

    async fn apply(
        &self,
        technique: &Technique,
        target: &dyn TargetHandle,
    ) -> Result<StageReport, StageError> {
        let script = Self::script(technique)
            .ok_or_else(|| StageError::apply(&technique.name, "technique has no script"))?;

        for (i, step) in script.apply.iter().enumerate() {
            match step {
                ScriptStep::Exec { command, expect } => {
                    let output = target
                        .execute(command)
                        .await
                        .map_err(|e| StageError::target(&technique.name, e))?;
                    if let Some(expect) = expect {
                        if !output.contains(expect.as_str()) {
                            return Err(StageError::apply(
                                &technique.name,
                                format!("step {}: expected {:?} in output", i + 1, expect),
                            ));
                        }
                    }
                }
                ScriptStep::Transfer {
                    source,
                    destination,
                } => {
                    let payload = tokio::fs::read(source).await.map_err(|e| {
                        StageError::apply(
                            &technique.name,
                            format!("step {}: cannot read {}: {}", i + 1, source.display(), e),
                        )
                    })?;
                    let delivered = target
                        .transfer(&payload, destination)
                        .await
                        .map_err(|e| StageError::target(&technique.name, e))?;
                    if !delivered {
                        return Err(StageError::apply(
                            &technique.name,
                            format!("step {}: transfer to {} rejected", i + 1, destination),
                        ));
                    }
                }
            }
        }

        info!(technique = %technique.name, steps = script.apply.len(), "technique applied");
        Ok(StageReport {
            artifacts: script.artifacts.clone(),
        })
    }

    async fn rollback(
        &self,
        technique: &Technique,
        token: &RollbackToken,
        target: &dyn TargetHandle,
    ) -> Result<(), StageError> {
        let script = Self::script(technique)
            .ok_or_else(|| StageError::rollback(&technique.name, "technique has no script"))?;
        if token.method != technique.rollback_method {
            return Err(StageError::rollback(
                &technique.name,
                format!(
                    "token captured for {}, technique restores through {}",
                    token.method, technique.rollback_method
                ),
            ));
        }
        let state = match &token.state {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        let command = script.rollback.replace("{state}", &state);
        target
            .execute(&command)
            .await
            .map_err(|e| StageError::target(&technique.name, e))?;
        Ok(())
    }

    async fn verify(&self, plan: &Plan, target: &dyn TargetHandle) -> Result<bool, StageError> {
        let Some(check) = &plan.verification else {
            return Ok(true);
        };
        let output = target
            .execute(&check.command)
            .await
            .map_err(|e| StageError::Verification(e.to_string()))?;
        Ok(output.contains(check.expect.as_str()))
    }
}
