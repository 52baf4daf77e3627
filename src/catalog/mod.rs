//! Processor event catalog.
//!
//! Answers two questions for a processor model: which events can be
//! described, and how many fixed and general-purpose counter slots the
//! hardware offers. Event names follow the `EVENT` / `EVENT:UMASK`
//! convention of the hardware event library.

pub mod cpuid;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of a processor performance event, unique per model.
pub type EventId = String;

/// Hardware counter slots available on a processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterBudget {
    /// Counters hard-wired to a single event.
    pub fixed_slots: usize,
    /// Programmable counters.
    pub general_slots: usize,
}

/// Errors surfaced by catalog lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unsupported processor model {model:?} (available: {})", .available.join(", "))]
    UnsupportedModel {
        model: String,
        available: Vec<String>,
    },

    #[error("counter budget for {model:?} is not configured and could not be probed: {reason}")]
    CounterProbe { model: String, reason: String },
}

/// Lookup of events and counter budget per processor model.
pub trait EventCatalog {
    /// Processor models this catalog can describe.
    fn models(&self) -> Vec<String>;

    /// All describable events of a model, in catalog order.
    fn list_events(&self, model: &str) -> Result<Vec<EventId>, CatalogError>;

    /// Counter slots available for a model.
    fn counter_budget(&self, model: &str) -> Result<CounterBudget, CatalogError>;
}

/// On-disk catalog document.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

/// One processor model in the catalog document.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ModelEntry {
    /// Fixed counter count. Probed from the host when omitted.
    #[serde(default)]
    pub fixed_counters: Option<usize>,

    /// General-purpose counter count. Probed from the host when omitted.
    #[serde(default)]
    pub general_counters: Option<usize>,

    #[serde(default)]
    pub events: Vec<EventEntry>,
}

/// Event description with its unit masks.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EventEntry {
    pub name: String,

    #[serde(default)]
    pub umasks: Vec<UmaskEntry>,

    /// Name of the event this one aliases. Aliases are not listed.
    #[serde(default)]
    pub equiv: Option<String>,
}

/// Unit mask, either a bare name or a name with an alias target.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UmaskEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        equiv: Option<String>,
    },
}

impl UmaskEntry {
    fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }

    fn is_alias(&self) -> bool {
        matches!(self, Self::Detailed { equiv: Some(_), .. })
    }
}

impl EventEntry {
    /// Expand into event identifiers: the bare name when there are no unit
    /// masks, one `NAME:UMASK` per non-alias mask otherwise.
    pub fn identifiers(&self) -> Vec<EventId> {
        if self.equiv.is_some() {
            return Vec::new();
        }

        if self.umasks.is_empty() {
            return vec![self.name.clone()];
        }

        self.umasks
            .iter()
            .filter(|umask| !umask.is_alias())
            .map(|umask| format!("{}:{}", self.name, umask.name()))
            .collect()
    }
}

/// Catalog backed by a YAML document.
#[derive(Debug)]
pub struct StaticCatalog {
    models: BTreeMap<String, ModelEntry>,
    host_budget: Option<CounterBudget>,
}

impl StaticCatalog {
    /// Load a catalog from a YAML file, probing the host counter budget for
    /// models that do not declare one.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading event catalog {}", path.display()))?;

        let catalog = Self::from_yaml(&data)
            .with_context(|| format!("parsing event catalog {}", path.display()))?;

        let host_budget = match cpuid::probe() {
            Ok(budget) => {
                debug!(
                    fixed = budget.fixed_slots,
                    general = budget.general_slots,
                    "probed host counter budget",
                );
                Some(budget)
            }
            Err(e) => {
                warn!(error = %e, "counter probe unavailable, relying on catalog counts");
                None
            }
        };

        Ok(catalog.with_host_budget(host_budget))
    }

    /// Parse a catalog document without probing the host.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_yaml::from_str(data)?;
        Ok(Self::from_document(doc))
    }

    pub fn from_document(doc: CatalogDocument) -> Self {
        Self {
            models: doc.models,
            host_budget: None,
        }
    }

    /// Budget used for models that omit their counter counts.
    pub fn with_host_budget(mut self, budget: Option<CounterBudget>) -> Self {
        self.host_budget = budget;
        self
    }

    fn entry(&self, model: &str) -> Result<&ModelEntry, CatalogError> {
        self.models
            .get(model)
            .ok_or_else(|| CatalogError::UnsupportedModel {
                model: model.to_string(),
                available: self.models(),
            })
    }
}

impl EventCatalog for StaticCatalog {
    fn models(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    fn list_events(&self, model: &str) -> Result<Vec<EventId>, CatalogError> {
        let entry = self.entry(model)?;
        Ok(entry
            .events
            .iter()
            .flat_map(EventEntry::identifiers)
            .collect())
    }

    fn counter_budget(&self, model: &str) -> Result<CounterBudget, CatalogError> {
        let entry = self.entry(model)?;

        let probed = |field: &str| {
            self.host_budget.ok_or_else(|| CatalogError::CounterProbe {
                model: model.to_string(),
                reason: format!("{field} not set and no host probe available"),
            })
        };

        let fixed_slots = match entry.fixed_counters {
            Some(n) => n,
            None => probed("fixed_counters")?.fixed_slots,
        };
        let general_slots = match entry.general_counters {
            Some(n) => n,
            None => probed("general_counters")?.general_slots,
        };

        Ok(CounterBudget {
            fixed_slots,
            general_slots,
        })
    }
}
