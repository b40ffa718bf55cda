//! Capability profile: an immutable snapshot of target attributes used by the
//! plan selector.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{info, warn};

use crate::target::{bounded, TargetHandle};

pub const MODEL_KEY: &str = "model";
pub const VERSION_KEY: &str = "version";
pub const CHIP_FAMILY_KEY: &str = "chip-family";

/// Value of any attribute the target did not report.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    id: String,
    model: String,
    version: String,
    attributes: BTreeMap<String, String>,
}

impl CapabilityProfile {
    /// Build a profile from raw attributes. `model` and `version` are read
    /// from their well-known keys.
    pub fn new(id: impl Into<String>, attributes: BTreeMap<String, String>) -> Self {
        let lookup = |key: &str| {
            attributes
                .get(key)
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        Self {
            id: id.into(),
            model: lookup(MODEL_KEY),
            version: lookup(VERSION_KEY),
            attributes,
        }
    }

    /// Query the target once for `keys`. Missing keys, or a failed query,
    /// resolve to [`UNKNOWN`].
    pub async fn query(
        id: impl Into<String>,
        target: &dyn TargetHandle,
        keys: &[String],
        timeout: Duration,
    ) -> Self {
        let id = id.into();
        let wanted: BTreeSet<String> = keys.iter().cloned().collect();
        let reported = match bounded(timeout, target.query_attributes(&wanted)).await {
            Ok(map) => map,
            Err(e) => {
                warn!(target_id = %id, error = %e, "attribute query failed, profile is unknown");
                Default::default()
            }
        };

        let attributes: BTreeMap<String, String> = wanted
            .into_iter()
            .map(|key| {
                let value = reported
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN.to_string());
                (key, value)
            })
            .collect();

        let profile = Self::new(id, attributes);
        info!(
            target_id = %profile.id,
            model = %profile.model,
            version = %profile.version,
            attributes = profile.attributes.len(),
            "target profiled"
        );
        profile
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn chip_family(&self) -> &str {
        self.attr(CHIP_FAMILY_KEY)
    }

    /// Attribute value, or [`UNKNOWN`].
    pub fn attr(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or(UNKNOWN)
    }

    /// Boolean view of an attribute. `None` when the value is not a
    /// recognizable boolean.
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.attr(key).trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}
