//! Safety monitor: watches the target's defensive indicators during a run.
//!
//! Each run gets a fresh monitor. Observed flags are monotonic for the life
//! of the monitor; only flags that are new since the previous check can
//! raise a trigger.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{IndicatorConfig, MonitorConfig, Severity};
use crate::error::TargetError;
use crate::target::{bounded, TargetHandle};

/// Raised when newly observed flags reach high or critical severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub severity: Severity,
    pub flags: BTreeSet<String>,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags: Vec<&str> = self.flags.iter().map(String::as_str).collect();
        write!(f, "{} [{}]", self.severity, flags.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Clear,
    Triggered(Trigger),
}

/// Event logged by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: String,
    pub details: String,
}

pub struct SafetyMonitor {
    indicators: Vec<IndicatorConfig>,
    query_timeout: Duration,
    observed: BTreeSet<String>,
    checks: u64,
    events: Vec<MonitorEvent>,
}

impl SafetyMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            indicators: config.indicators.clone(),
            query_timeout: config.query_timeout(),
            observed: BTreeSet::new(),
            checks: 0,
            events: Vec::new(),
        }
    }

    /// Query the indicator attributes once and report whether anything new
    /// warrants aborting. Medium-severity flags are recorded but never trigger.
    /// Every call appends exactly one event to the log.
    pub async fn check(&mut self, target: &dyn TargetHandle) -> Result<Check, TargetError> {
        self.checks += 1;
        let keys: BTreeSet<String> = self.indicators.iter().map(|i| i.attribute.clone()).collect();
        let values: HashMap<String, String> =
            match bounded(self.query_timeout, target.query_attributes(&keys)).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(check = self.checks, error = %e, "indicator query failed");
                    self.log_event("query_failed", &e.to_string());
                    return Err(e);
                }
            };

        let current: Vec<&IndicatorConfig> = self
            .indicators
            .iter()
            .filter(|i| {
                values
                    .get(&i.attribute)
                    .map_or(false, |v| i.matcher.matches(v))
            })
            .collect();

        let fresh: Vec<&IndicatorConfig> = current
            .into_iter()
            .filter(|i| !self.observed.contains(&i.flag))
            .collect();

        if fresh.is_empty() {
            debug!(check = self.checks, observed = self.observed.len(), "safety check clear");
            self.log_event("check", &format!("clear, {} flags observed", self.observed.len()));
            return Ok(Check::Clear);
        }

        let flags: BTreeSet<String> = fresh.iter().map(|i| i.flag.clone()).collect();
        let severity = fresh
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or(Severity::Medium);
        self.observed.extend(flags.iter().cloned());

        let trigger = Trigger { severity, flags };
        if severity >= Severity::High {
            warn!(severity = %severity, flags = ?trigger.flags, "security trigger");
            self.log_event("trigger", &trigger.to_string());
            Ok(Check::Triggered(trigger))
        } else {
            debug!(flags = ?trigger.flags, "medium severity flags observed");
            self.log_event("observed", &trigger.to_string());
            Ok(Check::Clear)
        }
    }

    pub fn observed(&self) -> &BTreeSet<String> {
        &self.observed
    }

    pub fn check_count(&self) -> u64 {
        self.checks
    }

    pub fn events(&self) -> &[MonitorEvent] {
        &self.events
    }

    fn log_event(&mut self, event_type: &str, details: &str) {
        self.events.push(MonitorEvent {
            timestamp: chrono::Utc::now(),
            event_type: event_type.to_string(),
            details: details.to_string(),
        });
    }
}

/// Operator-side cancellation. Cloned handles share one flag; the executor
/// honours it between stages only.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    requested: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.requested.store(true, Ordering::SeqCst);
        warn!("operator abort requested");
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }
}
