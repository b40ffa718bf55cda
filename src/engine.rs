use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::TechniqueCatalog;
use crate::config::Config;
use crate::driver::TechniqueDriver;
use crate::executor::PlanExecutor;
use crate::monitor::{AbortHandle, SafetyMonitor};
use crate::outcome::Outcome;
use crate::profile::CapabilityProfile;
use crate::selector::{self, Plan};
use crate::target::TargetHandle;

/// Select a plan for `operation` and run it against `target` with a fresh
/// safety monitor.
pub async fn run_plan(
    profile: &CapabilityProfile,
    operation: &str,
    catalog: &TechniqueCatalog,
    target: &dyn TargetHandle,
    driver: Arc<dyn TechniqueDriver>,
    config: &Config,
    abort: AbortHandle,
) -> Outcome {
    let plan = selector::select(profile, operation, catalog);
    let mut monitor = SafetyMonitor::new(&config.monitor);
    let outcome = PlanExecutor::new(config.executor.clone(), driver)
        .with_abort(abort)
        .run(&plan, target, &mut monitor)
        .await;

    info!(
        run = %outcome.run_id,
        success = outcome.success,
        checks = monitor.check_count(),
        "{}",
        outcome.narrative()
    );
    outcome
}

/// Drives runs against one target. Runs are serialized: a second
/// `run_plan` waits until the first reaches a terminal state.
pub struct Orchestrator {
    config: Config,
    catalog: Arc<TechniqueCatalog>,
    driver: Arc<dyn TechniqueDriver>,
    target: Arc<dyn TargetHandle>,
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        catalog: Arc<TechniqueCatalog>,
        driver: Arc<dyn TechniqueDriver>,
        target: Arc<dyn TargetHandle>,
    ) -> Self {
        Self {
            config,
            catalog,
            driver,
            target,
            run_lock: Mutex::new(()),
        }
    }

    /// Build the capability profile for this target from the configured
    /// attribute keys.
    pub async fn profile(&self, id: &str) -> CapabilityProfile {
        CapabilityProfile::query(
            id,
            self.target.as_ref(),
            &self.config.profile.attribute_keys,
            self.config.monitor.query_timeout(),
        )
        .await
    }

    /// Plan without executing.
    pub fn plan(&self, profile: &CapabilityProfile, operation: &str) -> Plan {
        selector::select(profile, operation, &self.catalog)
    }

    pub async fn run_plan(&self, profile: &CapabilityProfile, operation: &str) -> Outcome {
        self.run_plan_with_abort(profile, operation, AbortHandle::new())
            .await
    }

    /// Like [`Orchestrator::run_plan`], honouring `abort` between stages.
    pub async fn run_plan_with_abort(
        &self,
        profile: &CapabilityProfile,
        operation: &str,
        abort: AbortHandle,
    ) -> Outcome {
        let _guard = self.run_lock.lock().await;
        run_plan(
            profile,
            operation,
            &self.catalog,
            self.target.as_ref(),
            Arc::clone(&self.driver),
            &self.config,
            abort,
        )
        .await
    }
}
