//! Per-stage transaction records and the LIFO stack that owns them.
//!
//! A checkpoint is pushed before its technique mutates anything, then either
//! committed or rolled back. The stack is the only record of what must be
//! undone when a run aborts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::Technique;
use crate::driver::TechniqueDriver;
use crate::error::{StageError, TargetError};
use crate::target::TargetHandle;

/// Opaque state captured before a stage mutates the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackToken {
    /// Rollback method the state was captured for. A driver must refuse to
    /// restore through a different method.
    pub method: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

impl RollbackToken {
    pub fn new(method: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Committed,
    RolledBack,
    RollbackFailed(String),
}

/// What a rollback call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    Reverted,
    /// The checkpoint was already rolled back; nothing was sent to the target.
    AlreadyRolledBack,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    technique: Arc<Technique>,
    token: RollbackToken,
    status: CheckpointStatus,
}

impl Checkpoint {
    pub fn new(technique: Arc<Technique>, token: RollbackToken) -> Self {
        Self {
            technique,
            token,
            status: CheckpointStatus::Pending,
        }
    }

    pub fn technique(&self) -> &Arc<Technique> {
        &self.technique
    }

    pub fn status(&self) -> &CheckpointStatus {
        &self.status
    }

    pub fn is_committed(&self) -> bool {
        self.status == CheckpointStatus::Committed
    }

    pub fn commit(&mut self) {
        self.status = CheckpointStatus::Committed;
    }

    /// Undo this stage through its rollback method. Calling it again after a
    /// successful rollback is a no-op.
    pub async fn rollback(
        &mut self,
        driver: &dyn TechniqueDriver,
        target: &dyn TargetHandle,
        timeout: Duration,
    ) -> Result<RollbackStatus, StageError> {
        if self.status == CheckpointStatus::RolledBack {
            return Ok(RollbackStatus::AlreadyRolledBack);
        }

        let name = self.technique.name.clone();
        let attempt = tokio::time::timeout(
            timeout,
            driver.rollback(&self.technique, &self.token, target),
        )
        .await
        .unwrap_or_else(|_| Err(StageError::target(&name, TargetError::Timeout(timeout))));

        match attempt {
            Ok(()) => {
                info!(technique = %name, method = %self.token.method, "stage rolled back");
                self.status = CheckpointStatus::RolledBack;
                Ok(RollbackStatus::Reverted)
            }
            Err(e) => {
                warn!(technique = %name, error = %e, "rollback failed");
                self.status = CheckpointStatus::RollbackFailed(e.to_string());
                Err(e)
            }
        }
    }
}

/// Last-in-first-out ownership list of checkpoints for one run.
#[derive(Debug, Default)]
pub struct CheckpointStack {
    entries: Vec<Checkpoint>,
}

impl CheckpointStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, checkpoint: Checkpoint) {
        self.entries.push(checkpoint);
    }

    pub fn pop(&mut self) -> Option<Checkpoint> {
        self.entries.pop()
    }

    pub fn top_mut(&mut self) -> Option<&mut Checkpoint> {
        self.entries.last_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn committed_count(&self) -> usize {
        self.entries.iter().filter(|c| c.is_committed()).count()
    }

    /// Technique names from top to bottom.
    pub fn names_top_down(&self) -> Vec<String> {
        self.entries
            .iter()
            .rev()
            .map(|c| c.technique.name.clone())
            .collect()
    }
}
