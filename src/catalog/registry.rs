use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::{AttributeRule, CatalogDocument, ChainTemplate, Technique};
use crate::error::CatalogError;

/// Validated, read-only technique registry. Techniques are handed out as
/// shared references; nothing a run does can mutate them.
#[derive(Debug, Clone)]
pub struct TechniqueCatalog {
    techniques: Vec<Arc<Technique>>,
    by_name: HashMap<String, usize>,
    prerequisites: BTreeMap<String, AttributeRule>,
    templates: BTreeMap<String, ChainTemplate>,
    default_template: String,
}

impl TechniqueCatalog {
    /// Validate a parsed document into a catalog.
    pub fn from_document(doc: CatalogDocument) -> Result<Self, CatalogError> {
        let mut techniques = Vec::with_capacity(doc.techniques.len());
        let mut by_name = HashMap::new();

        for technique in doc.techniques {
            if !(0.0..=1.0).contains(&technique.success_weight) {
                return Err(CatalogError::WeightOutOfRange {
                    name: technique.name,
                    weight: technique.success_weight,
                });
            }
            if by_name.contains_key(&technique.name) {
                return Err(CatalogError::DuplicateTechnique(technique.name));
            }
            by_name.insert(technique.name.clone(), techniques.len());
            techniques.push(Arc::new(technique));
        }

        for (template, chain) in &doc.templates {
            let mut seen = HashSet::new();
            for name in &chain.techniques {
                if !by_name.contains_key(name) {
                    return Err(CatalogError::UnknownTechnique {
                        template: template.clone(),
                        technique: name.clone(),
                    });
                }
                if !seen.insert(name.as_str()) {
                    return Err(CatalogError::DuplicateTemplateEntry {
                        template: template.clone(),
                        technique: name.clone(),
                    });
                }
            }
        }

        if !doc.templates.contains_key(&doc.default_template) {
            return Err(CatalogError::MissingDefaultTemplate(doc.default_template));
        }

        Ok(Self {
            techniques,
            by_name,
            prerequisites: doc.prerequisites,
            templates: doc.templates,
            default_template: doc.default_template,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument = toml::from_str(content)?;
        Self::from_document(doc)
    }

    /// Load a catalog from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml(&content)?;
        info!(
            techniques = catalog.technique_count(),
            templates = catalog.templates.len(),
            default_template = %catalog.default_template,
            "technique catalog loaded"
        );
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Technique>> {
        self.by_name.get(name).map(|&i| &self.techniques[i])
    }

    /// Insertion position of a technique, used as the final sort tie-break.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn prerequisite(&self, name: &str) -> Option<&AttributeRule> {
        self.prerequisites.get(name)
    }

    /// Template for `operation`, falling back to the default template.
    /// Returns the name actually resolved alongside the template.
    pub fn template(&self, operation: &str) -> (&str, &ChainTemplate) {
        match self.templates.get_key_value(operation) {
            Some((name, template)) => (name.as_str(), template),
            None => (
                self.default_template.as_str(),
                &self.templates[&self.default_template],
            ),
        }
    }

    pub fn default_template(&self) -> &str {
        &self.default_template
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn techniques(&self) -> impl Iterator<Item = &Arc<Technique>> {
        self.techniques.iter()
    }

    pub fn technique_count(&self) -> usize {
        self.techniques.len()
    }
}
