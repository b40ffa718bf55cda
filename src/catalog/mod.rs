//! Technique catalog: stage-tagged techniques with declarative compatibility
//! rules, plus the chain templates that name them.

pub mod registry;

pub use registry::TechniqueCatalog;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::profile::CapabilityProfile;

/// Fixed pipeline position. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Unlock,
    BypassA,
    BypassB,
    PayloadExploit,
    Modification,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Unlock => "unlock",
            Stage::BypassA => "bypass-a",
            Stage::BypassB => "bypass-b",
            Stage::PayloadExploit => "payload-exploit",
            Stage::Modification => "modification",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

/// One compatibility dimension. Dimensions a technique does not declare are
/// vacuously satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    /// Model must contain one of the patterns (case-insensitive); `*` matches anything.
    Target { patterns: Vec<String> },
    /// Chip family must contain one of the patterns (case-insensitive).
    Chip { patterns: Vec<String> },
    /// Version must be one of the listed values exactly.
    Version { allowed: Vec<String> },
    /// Named prerequisite, resolved through the catalog's prerequisite table.
    Prerequisite { name: String },
}

/// Attribute rule a named prerequisite resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AttributeRule {
    FlagTrue { key: String },
    FlagFalse { key: String },
    Equals { key: String, value: String },
    Contains { key: String, needle: String },
    NotContains { key: String, needle: String },
    All { rules: Vec<AttributeRule> },
}

impl AttributeRule {
    pub fn holds(&self, profile: &CapabilityProfile) -> bool {
        match self {
            AttributeRule::FlagTrue { key } => profile.flag(key) == Some(true),
            AttributeRule::FlagFalse { key } => profile.flag(key) == Some(false),
            AttributeRule::Equals { key, value } => profile.attr(key) == value,
            AttributeRule::Contains { key, needle } => contains_ci(profile.attr(key), needle),
            AttributeRule::NotContains { key, needle } => {
                !contains_ci(profile.attr(key), needle)
            }
            AttributeRule::All { rules } => rules.iter().all(|r| r.holds(profile)),
        }
    }
}

pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Catalog entry. Shared read-only by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technique {
    pub name: String,
    pub stage: Stage,
    #[serde(default)]
    pub requires: Vec<Requirement>,
    /// Identifier of the undo procedure; rollback through it is idempotent.
    pub rollback_method: String,
    pub risk: RiskTier,
    pub success_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<TechniqueScript>,
}

/// Command-level description used by the scripted driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueScript {
    /// Command whose output is kept as the rollback state.
    pub capture: String,
    pub apply: Vec<ScriptStep>,
    /// Undo command; `{state}` is replaced by the captured state.
    pub rollback: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    Exec {
        command: String,
        #[serde(default)]
        expect: Option<String>,
    },
    Transfer {
        source: PathBuf,
        destination: String,
    },
}

/// End-to-end check run after every stage has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub command: String,
    pub expect: String,
}

/// Named ordered list of technique names for one operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTemplate {
    pub techniques: Vec<String>,
    #[serde(default)]
    pub verify: Option<VerificationCheck>,
}

/// On-disk catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub default_template: String,
    #[serde(default)]
    pub prerequisites: BTreeMap<String, AttributeRule>,
    #[serde(default)]
    pub templates: BTreeMap<String, ChainTemplate>,
    #[serde(default)]
    pub techniques: Vec<Technique>,
}
