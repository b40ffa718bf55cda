//! Plan selection: filter a chain template against a capability profile and
//! order the survivors into an executable plan.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::{contains_ci, Requirement, Stage, Technique, TechniqueCatalog, VerificationCheck};
use crate::profile::{CapabilityProfile, UNKNOWN};

/// Ordered techniques for one run, at most one per stage.
#[derive(Debug, Clone)]
pub struct Plan {
    pub target_id: String,
    pub operation: String,
    pub template: String,
    pub steps: Vec<Arc<Technique>>,
    /// Compatible techniques that lost their stage to a higher-weight entry.
    pub alternates: Vec<Arc<Technique>>,
    /// Template entries excluded as not applicable to this target.
    pub excluded: Vec<Exclusion>,
    pub verification: Option<VerificationCheck>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.steps.iter().map(|t| t.stage).collect()
    }

    pub fn technique_names(&self) -> Vec<String> {
        self.steps.iter().map(|t| t.name.clone()).collect()
    }

    /// Serializable view for reporting.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            target_id: self.target_id.clone(),
            operation: self.operation.clone(),
            template: self.template.clone(),
            steps: self
                .steps
                .iter()
                .map(|t| PlannedStep {
                    technique: t.name.clone(),
                    stage: t.stage,
                    success_weight: t.success_weight,
                })
                .collect(),
            alternates: self.alternates.iter().map(|t| t.name.clone()).collect(),
            excluded: self.excluded.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub target_id: String,
    pub operation: String,
    pub template: String,
    pub steps: Vec<PlannedStep>,
    pub alternates: Vec<String>,
    pub excluded: Vec<Exclusion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub technique: String,
    pub stage: Stage,
    pub success_weight: f64,
}

/// Why a template entry was left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub technique: String,
    pub stage: Stage,
    pub reason: Incompatibility,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dimension", content = "detail", rename_all = "snake_case")]
pub enum Incompatibility {
    Target(String),
    Chip(String),
    Version(String),
    Prerequisite(String),
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(model) => write!(f, "model {} not targeted", model),
            Self::Chip(chip) => write!(f, "chip family {} not supported", chip),
            Self::Version(version) => write!(f, "version {} not whitelisted", version),
            Self::Prerequisite(name) => write!(f, "prerequisite {} unmet", name),
        }
    }
}

/// `*` matches anything. Other patterns never match an unknown value.
fn pattern_matches(value: &str, pattern: &str) -> bool {
    pattern == "*" || (value != UNKNOWN && contains_ci(value, pattern))
}

/// Check every declared dimension; the first unmet one is reported.
pub fn check_compatibility(
    technique: &Technique,
    profile: &CapabilityProfile,
    catalog: &TechniqueCatalog,
) -> Result<(), Incompatibility> {
    for requirement in &technique.requires {
        match requirement {
            Requirement::Target { patterns } => {
                if !patterns.iter().any(|p| pattern_matches(profile.model(), p)) {
                    return Err(Incompatibility::Target(profile.model().to_string()));
                }
            }
            Requirement::Chip { patterns } => {
                if !patterns.iter().any(|p| pattern_matches(profile.chip_family(), p)) {
                    return Err(Incompatibility::Chip(profile.chip_family().to_string()));
                }
            }
            Requirement::Version { allowed } => {
                if !allowed.iter().any(|v| v == profile.version()) {
                    return Err(Incompatibility::Version(profile.version().to_string()));
                }
            }
            Requirement::Prerequisite { name } => match catalog.prerequisite(name) {
                Some(rule) => {
                    if !rule.holds(profile) {
                        return Err(Incompatibility::Prerequisite(name.clone()));
                    }
                }
                None => {
                    debug!(prerequisite = %name, technique = %technique.name, "no rule for prerequisite, assuming met");
                }
            },
        }
    }
    Ok(())
}

/// Select a plan for `operation`. An empty plan means no compatible chain and
/// is not an error.
pub fn select(profile: &CapabilityProfile, operation: &str, catalog: &TechniqueCatalog) -> Plan {
    let (template_name, template) = catalog.template(operation);
    if template_name != operation {
        debug!(operation = %operation, fallback = %template_name, "no template for operation, using default");
    }

    let mut compatible = Vec::new();
    let mut excluded = Vec::new();

    for name in &template.techniques {
        let Some(technique) = catalog.get(name) else {
            debug!(technique = %name, "template entry missing from catalog");
            continue;
        };
        match check_compatibility(technique, profile, catalog) {
            Ok(()) => compatible.push(Arc::clone(technique)),
            Err(reason) => {
                info!(technique = %name, stage = %technique.stage, reason = %reason, "technique not applicable");
                excluded.push(Exclusion {
                    technique: name.clone(),
                    stage: technique.stage,
                    reason,
                });
            }
        }
    }

    compatible.sort_by(|a, b| {
        a.stage
            .cmp(&b.stage)
            .then_with(|| b.success_weight.total_cmp(&a.success_weight))
            .then_with(|| position(catalog, a).cmp(&position(catalog, b)))
    });

    let mut steps: Vec<Arc<Technique>> = Vec::new();
    let mut alternates = Vec::new();
    for technique in compatible {
        match steps.last() {
            Some(last) if last.stage == technique.stage => alternates.push(technique),
            _ => steps.push(technique),
        }
    }

    info!(
        operation = %operation,
        template = %template_name,
        stages = steps.len(),
        excluded = excluded.len(),
        "plan selected"
    );

    Plan {
        target_id: profile.id().to_string(),
        operation: operation.to_string(),
        template: template_name.to_string(),
        steps,
        alternates,
        excluded,
        verification: template.verify.clone(),
    }
}

fn position(catalog: &TechniqueCatalog, technique: &Technique) -> usize {
    catalog.position(&technique.name).unwrap_or(usize::MAX)
}
