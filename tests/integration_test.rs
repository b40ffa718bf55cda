use async_trait::async_trait;
use stagechain::config::Config;
use stagechain::driver::ScriptedDriver;
use stagechain::error::TargetError;
use stagechain::outcome::{RunState, Termination};
use stagechain::target::TargetHandle;
use stagechain::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

const CATALOG: &str = r#"
default_template = "full"

[prerequisites.unlocked]
rule = "flag_false"
key = "bootloader-locked"

[templates.full]
techniques = ["oem-unlock", "image-bypass", "service-exploit"]
verify = { command = "get service", expect = "hooked" }

[templates.noisy]
techniques = ["oem-unlock", "noisy-bypass", "service-exploit"]

[templates.broken]
techniques = ["oem-unlock", "image-bypass", "broken-mod"]

[[techniques]]
name = "oem-unlock"
stage = "unlock"
rollback_method = "relock"
risk = "medium"
success_weight = 0.9

[techniques.script]
capture = "get lock"
apply = [{ op = "exec", command = "set lock open", expect = "ok" }]
rollback = "set lock {state}"
artifacts = ["unlock.log"]

[[techniques]]
name = "image-bypass"
stage = "bypass-a"
rollback_method = "restore-image"
risk = "high"
success_weight = 0.8
requires = [{ kind = "prerequisite", name = "unlocked" }]

[techniques.script]
capture = "get image"
apply = [{ op = "exec", command = "set image patched", expect = "ok" }]
rollback = "set image {state}"
artifacts = ["image.bak"]

[[techniques]]
name = "noisy-bypass"
stage = "bypass-b"
rollback_method = "reset-counter"
risk = "critical"
success_weight = 0.4

[techniques.script]
capture = "get signal.tamper-counter"
apply = [{ op = "exec", command = "set signal.tamper-counter 1" }]
rollback = "set signal.tamper-counter {state}"

[[techniques]]
name = "service-exploit"
stage = "payload-exploit"
rollback_method = "restart-service"
risk = "high"
success_weight = 0.7
requires = [{ kind = "target", patterns = ["SM-", "Pixel"] }]

[techniques.script]
capture = "get service"
apply = [{ op = "exec", command = "set service hooked", expect = "ok" }]
rollback = "set service {state}"

[[techniques]]
name = "broken-mod"
stage = "modification"
rollback_method = "restore-config"
risk = "high"
success_weight = 0.5

[techniques.script]
capture = "get config"
apply = [{ op = "exec", command = "set config custom", expect = "applied" }]
rollback = "set config {state}"
"#;

/// Key/value device: `get <key>` reads, `set <key> <value>` writes. Attribute
/// queries read the same store.
struct SimDevice {
    store: Mutex<HashMap<String, String>>,
}

impl SimDevice {
    fn new(overrides: &[(&str, &str)]) -> Self {
        let mut store: HashMap<String, String> = [
            ("model", "SM-G960F"),
            ("version", "10"),
            ("bootloader-locked", "false"),
            ("root-present", "false"),
            ("lock", "closed"),
            ("image", "stock"),
            ("service", "idle"),
            ("config", "base"),
            ("signal.tamper-counter", "0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in overrides {
            store.insert(k.to_string(), v.to_string());
        }
        Self {
            store: Mutex::new(store),
        }
    }

    fn get(&self, key: &str) -> String {
        self.store.lock().unwrap().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TargetHandle for SimDevice {
    async fn execute(&self, command: &str) -> Result<String, TargetError> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.as_slice() {
            ["get", key] => Ok(self.get(key)),
            ["set", key, value] => {
                self.store
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), value.to_string());
                Ok("ok".to_string())
            }
            _ => Err(TargetError::Transport(format!("unknown command: {}", command))),
        }
    }

    async fn transfer(&self, _payload: &[u8], _destination: &str) -> Result<bool, TargetError> {
        Ok(true)
    }

    async fn query_attributes(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<HashMap<String, String>, TargetError> {
        let store = self.store.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| store.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }
}

fn orchestrator(device: Arc<SimDevice>) -> Orchestrator {
    let catalog = TechniqueCatalog::from_toml(CATALOG).unwrap();
    Orchestrator::new(
        Config::default(),
        Arc::new(catalog),
        Arc::new(ScriptedDriver::new()),
        device,
    )
}

/// Full chain commits, is verified, and the device keeps the changes
#[tokio::test]
async fn test_scripted_chain_commits() {
    let device = Arc::new(SimDevice::new(&[]));
    let orch = orchestrator(device.clone());
    let profile = orch.profile("sm-1").await;

    let outcome = orch.run_plan(&profile, "full").await;

    assert!(outcome.success, "{}", outcome.narrative());
    assert_eq!(outcome.state, RunState::Committed);
    assert_eq!(
        outcome.techniques_applied,
        vec!["oem-unlock", "image-bypass", "service-exploit"]
    );
    assert_eq!(outcome.artifacts, vec!["unlock.log", "image.bak"]);
    assert!(outcome.persistence_achieved);
    assert_eq!(device.get("lock"), "open");
    assert_eq!(device.get("image"), "patched");
    assert_eq!(device.get("service"), "hooked");
}

/// Round-trip: the applied list matches the plan's stage sequence
#[tokio::test]
async fn test_applied_matches_plan_order() {
    let device = Arc::new(SimDevice::new(&[]));
    let orch = orchestrator(device);
    let profile = orch.profile("sm-1").await;

    let plan = orch.plan(&profile, "full");
    let outcome = orch.run_plan(&profile, "full").await;
    assert_eq!(outcome.techniques_applied, plan.technique_names());
}

/// Locked bootloader: the bypass is not applicable, the rest still runs
#[tokio::test]
async fn test_locked_bootloader_leaves_gap() {
    let device = Arc::new(SimDevice::new(&[("bootloader-locked", "true")]));
    let orch = orchestrator(device.clone());
    let profile = orch.profile("sm-2").await;

    let plan = orch.plan(&profile, "full");
    assert_eq!(plan.stages(), vec![Stage::Unlock, Stage::PayloadExploit]);

    let outcome = orch.run_plan(&profile, "full").await;
    assert!(outcome.success);
    assert_eq!(outcome.techniques_applied, vec!["oem-unlock", "service-exploit"]);
    assert_eq!(outcome.not_applicable.len(), 1);
    assert_eq!(outcome.not_applicable[0].technique, "image-bypass");
    assert_eq!(device.get("image"), "stock");
}

/// A late stage failure restores every earlier stage from its captured state
#[tokio::test]
async fn test_failure_restores_device() {
    let device = Arc::new(SimDevice::new(&[]));
    let orch = orchestrator(device.clone());
    let profile = orch.profile("sm-1").await;

    let outcome = orch.run_plan(&profile, "broken").await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, RunState::Aborted);
    assert!(outcome.risk_assessment.starts_with("exploitation failed"));
    assert_eq!(
        outcome.rolled_back,
        vec!["broken-mod", "image-bypass", "oem-unlock"]
    );
    assert!(!outcome.cleanup_required);
    assert_eq!(device.get("config"), "base");
    assert_eq!(device.get("image"), "stock");
    assert_eq!(device.get("lock"), "closed");
}

/// A stage that raises a tamper signal is caught by the post-check
#[tokio::test]
async fn test_tamper_signal_aborts_and_unwinds() {
    let device = Arc::new(SimDevice::new(&[]));
    let orch = orchestrator(device.clone());
    let profile = orch.profile("sm-1").await;

    let outcome = orch.run_plan(&profile, "noisy").await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, RunState::RolledBack);
    assert!(outcome.risk_assessment.contains("security trigger"));
    assert_eq!(outcome.rolled_back, vec!["noisy-bypass", "oem-unlock"]);
    assert_eq!(outcome.techniques_applied, vec!["oem-unlock"]);
    assert!(outcome.observed_flags.contains("tamper-counter"));
    assert!(matches!(
        outcome.termination,
        Termination::SecurityTrigger { .. }
    ));
    // stage 3 never touched the device
    assert_eq!(device.get("service"), "idle");
    assert_eq!(device.get("lock"), "closed");
}

/// Plans never repeat or reorder stages, whatever the profile
#[test]
fn test_plan_stages_strictly_increase() {
    let catalog = TechniqueCatalog::from_toml(CATALOG).unwrap();
    let profiles = [
        vec![("model", "SM-G960F"), ("bootloader-locked", "false")],
        vec![("model", "Pixel 4"), ("bootloader-locked", "true")],
        vec![("model", "unknown-phone")],
        vec![],
    ];

    for attrs in profiles {
        let attributes: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let profile = CapabilityProfile::new("p", attributes);
        for operation in ["full", "noisy", "broken", "unknown-op"] {
            let plan = selector::select(&profile, operation, &catalog);
            let stages = plan.stages();
            assert!(
                stages.windows(2).all(|w| w[0] < w[1]),
                "{} on {:?}: {:?}",
                operation,
                profile.model(),
                stages
            );
        }
    }
}

/// Outcome serializes for reporting
#[tokio::test]
async fn test_outcome_json() {
    let device = Arc::new(SimDevice::new(&[]));
    let orch = orchestrator(device);
    let profile = orch.profile("sm-1").await;

    let outcome = orch.run_plan(&profile, "full").await;
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["state"], "committed");
    assert_eq!(json["termination"]["cause"], "verified");
    assert_eq!(json["target_id"], "sm-1");
}

/// The bundled demo catalog, config and profile load and plan together
#[test]
fn test_demo_files() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let catalog = TechniqueCatalog::from_file(root.join("catalog.toml")).unwrap();
    let config = Config::from_file(root.join("stagechain.toml")).unwrap();
    assert_eq!(config.monitor.indicators.len(), 5);

    let attributes: BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(root.join("profile.json")).unwrap()).unwrap();
    let profile = CapabilityProfile::new("demo", attributes);

    let plan = selector::select(&profile, "full", &catalog);
    assert_eq!(
        plan.technique_names(),
        vec!["oem-unlock", "service-hook", "config-persist"]
    );
    let excluded: Vec<&str> = plan.excluded.iter().map(|e| e.technique.as_str()).collect();
    assert_eq!(excluded, vec!["image-bypass", "alt-bypass"]);
}
