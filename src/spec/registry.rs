use crate::error::SpecError;
use crate::events::{IssueCategory, Severity};
use crate::spec::document::{split_transition_key, ModuleDocument, SpecDocument};
use chrono::Duration;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Default minutes an entity may stay in one state before it counts as stuck
pub const DEFAULT_STUCK_MINUTES: u64 = 30;

/// Default minutes without activity before an entity counts as stale
pub const DEFAULT_STALE_MINUTES: u64 = 60;

/// Largest accepted liveness threshold, one year
pub const MAX_SLA_MINUTES: u64 = 366 * 24 * 60;

/// Supported specification document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecFormat {
    Toml,
    Json,
}

impl SpecFormat {
    /// Pick the format from a file extension, TOML unless it ends in `.json`
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SpecFormat::Json,
            _ => SpecFormat::Toml,
        }
    }
}

/// Time thresholds for liveness detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sla {
    pub stuck_minutes: u64,
    pub stale_minutes: u64,
}

impl Default for Sla {
    fn default() -> Self {
        Self {
            stuck_minutes: DEFAULT_STUCK_MINUTES,
            stale_minutes: DEFAULT_STALE_MINUTES,
        }
    }
}

impl Sla {
    pub fn stuck_after(&self) -> Duration {
        Duration::minutes(self.stuck_minutes.min(MAX_SLA_MINUTES) as i64)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::minutes(self.stale_minutes.min(MAX_SLA_MINUTES) as i64)
    }
}

/// Indexed state machine of one module
#[derive(Debug, Clone)]
struct ModuleSpec {
    states: HashSet<String>,
    terminal: HashSet<String>,
    /// from -> to -> required writes
    transitions: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
    sla: Sla,
    severities: HashMap<IssueCategory, Severity>,
}

impl ModuleSpec {
    fn build(name: &str, doc: &ModuleDocument) -> Result<Self, SpecError> {
        if doc.states.is_empty() {
            return Err(SpecError::NoStates {
                module: name.to_string(),
            });
        }

        let states: HashSet<String> = doc.states.iter().cloned().collect();
        let require_state = |state: &str, context: &str| -> Result<(), SpecError> {
            if states.contains(state) {
                Ok(())
            } else {
                Err(SpecError::UndefinedState {
                    module: name.to_string(),
                    state: state.to_string(),
                    context: context.to_string(),
                })
            }
        };

        let mut terminal = HashSet::new();
        for state in &doc.terminal {
            require_state(state, "terminal states")?;
            terminal.insert(state.clone());
        }

        let mut transitions: HashMap<String, BTreeMap<String, BTreeSet<String>>> = HashMap::new();
        for transition in &doc.transitions {
            let context = format!("transition {} -> {}", transition.from, transition.to);
            require_state(&transition.from, &context)?;
            require_state(&transition.to, &context)?;
            transitions
                .entry(transition.from.clone())
                .or_default()
                .entry(transition.to.clone())
                .or_default();
        }

        for (key, writes) in &doc.writes {
            let (from, to) =
                split_transition_key(key).ok_or_else(|| SpecError::MalformedWriteKey {
                    module: name.to_string(),
                    key: key.clone(),
                })?;
            let context = format!("writes key '{}'", key);
            require_state(from, &context)?;
            require_state(to, &context)?;

            let expected = transitions
                .get_mut(from)
                .and_then(|targets| targets.get_mut(to))
                .ok_or_else(|| SpecError::UndeclaredTransition {
                    module: name.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                })?;
            expected.extend(writes.iter().cloned());
        }

        let defaults = Sla::default();
        let sla = Sla {
            stuck_minutes: doc.sla.stuck_minutes.unwrap_or(defaults.stuck_minutes),
            stale_minutes: doc.sla.stale_minutes.unwrap_or(defaults.stale_minutes),
        };
        if sla.stuck_minutes == 0 || sla.stale_minutes == 0 {
            return Err(SpecError::InvalidSla {
                module: name.to_string(),
                reason: "thresholds must be at least one minute".to_string(),
            });
        }
        if sla.stuck_minutes > MAX_SLA_MINUTES || sla.stale_minutes > MAX_SLA_MINUTES {
            return Err(SpecError::InvalidSla {
                module: name.to_string(),
                reason: format!("thresholds must not exceed {} minutes", MAX_SLA_MINUTES),
            });
        }

        let mut severities = HashMap::new();
        for (category_name, severity) in &doc.severities {
            let category = IssueCategory::ALL
                .into_iter()
                .find(|category| category.as_str() == category_name)
                .ok_or_else(|| SpecError::UnknownCategory {
                    module: name.to_string(),
                    category: category_name.clone(),
                })?;
            severities.insert(category, *severity);
        }

        Ok(Self {
            states,
            terminal,
            transitions,
            sla,
            severities,
        })
    }
}

/// Loaded, validated and indexed behavioral specification
///
/// Immutable after construction. Modules the specification does not mention
/// are *unvalidated*: every transition for them is accepted, so a partial
/// rollout of the specification never produces false alarms.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    modules: HashMap<String, ModuleSpec>,
}

impl SpecRegistry {
    /// Parse and validate a specification document
    ///
    /// # Errors
    ///
    /// Returns `SpecError` on malformed input or on any reference to an
    /// undefined state. Nothing is loaded in that case.
    pub fn load(source: &str, format: SpecFormat) -> Result<Self, SpecError> {
        let document: SpecDocument = match format {
            SpecFormat::Toml => {
                toml::from_str(source).map_err(|e| SpecError::ParseError(e.to_string()))?
            }
            SpecFormat::Json => {
                serde_json::from_str(source).map_err(|e| SpecError::ParseError(e.to_string()))?
            }
        };
        Self::from_document(&document)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, SpecError> {
        Self::load(source, SpecFormat::Toml)
    }

    pub fn from_json_str(source: &str) -> Result<Self, SpecError> {
        Self::load(source, SpecFormat::Json)
    }

    /// Load a specification file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, SpecError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| SpecError::ReadError(format!("{}: {}", path.display(), e)))?;
        let registry = Self::load(&source, SpecFormat::from_path(path))?;
        info!(
            "Loaded specification from {} ({} modules)",
            path.display(),
            registry.modules.len()
        );
        Ok(registry)
    }

    /// Validate and index an already deserialized document
    pub fn from_document(document: &SpecDocument) -> Result<Self, SpecError> {
        let mut modules = HashMap::with_capacity(document.modules.len());
        for (name, module) in &document.modules {
            let spec = ModuleSpec::build(name, module)?;
            debug!(
                "Indexed module '{}': {} states, {} source states with transitions",
                name,
                spec.states.len(),
                spec.transitions.len()
            );
            modules.insert(name.clone(), spec);
        }
        Ok(Self { modules })
    }

    /// Whether the module is covered by the specification
    pub fn contains_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Names of all specified modules, sorted
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether `from -> to` is allowed; always true for unvalidated modules
    pub fn is_valid_transition(&self, module: &str, from: &str, to: &str) -> bool {
        match self.modules.get(module) {
            None => true,
            Some(spec) => spec
                .transitions
                .get(from)
                .is_some_and(|targets| targets.contains_key(to)),
        }
    }

    /// Write identifiers required by `from -> to`, empty when none are declared
    pub fn expected_writes(&self, module: &str, from: &str, to: &str) -> BTreeSet<&str> {
        self.modules
            .get(module)
            .and_then(|spec| spec.transitions.get(from))
            .and_then(|targets| targets.get(to))
            .map(|writes| writes.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Declared target states reachable from `from`, sorted
    pub fn allowed_from(&self, module: &str, from: &str) -> Vec<&str> {
        self.modules
            .get(module)
            .and_then(|spec| spec.transitions.get(from))
            .map(|targets| targets.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Liveness thresholds, the defaults (30, 60) when the module sets none
    pub fn sla(&self, module: &str) -> Sla {
        self.modules
            .get(module)
            .map(|spec| spec.sla)
            .unwrap_or_default()
    }

    pub fn severity_for(&self, module: &str, category: IssueCategory) -> Severity {
        self.modules
            .get(module)
            .and_then(|spec| spec.severities.get(&category).copied())
            .unwrap_or_else(|| category.default_severity())
    }

    /// Whether entities may rest in `state` without counting as stuck or stale
    pub fn is_terminal(&self, module: &str, state: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|spec| spec.terminal.contains(state))
    }
}
