//! Per-phase tunables and the resolver that merges store rows over
//! built-in defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::store::PhaseConfigStore;

use super::phase::{FlowPhase, Phase7Step};

/// Resolved configuration for a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCfg {
    pub phase: FlowPhase,
    /// `None` marks the terminal phase.
    pub next_phase: Option<FlowPhase>,
    pub min_readiness_to_advance: f64,
    pub max_reprompts: u32,
    pub allow_deepthink: bool,
    pub substate_order: Vec<Phase7Step>,
    pub enabled: bool,
}

impl PhaseCfg {
    fn exploratory(phase: FlowPhase) -> Self {
        Self {
            phase,
            next_phase: phase.next(),
            min_readiness_to_advance: 0.7,
            max_reprompts: 2,
            allow_deepthink: false,
            substate_order: Vec::new(),
            enabled: true,
        }
    }
}

/// A raw row as kept by the configuration store.
///
/// Phase names are free text here; they are validated when merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfigRow {
    pub phase: String,
    pub next_phase: Option<String>,
    pub min_readiness_to_advance: f64,
    pub max_reprompts: i64,
    pub allow_deepthink: bool,
    pub substate_order: Vec<String>,
    pub enabled: bool,
}

impl From<&PhaseCfg> for PhaseConfigRow {
    fn from(cfg: &PhaseCfg) -> Self {
        Self {
            phase: cfg.phase.to_string(),
            next_phase: cfg.next_phase.map(|p| p.to_string()),
            min_readiness_to_advance: cfg.min_readiness_to_advance,
            max_reprompts: i64::from(cfg.max_reprompts),
            allow_deepthink: cfg.allow_deepthink,
            substate_order: cfg.substate_order.iter().map(|s| s.to_string()).collect(),
            enabled: cfg.enabled,
        }
    }
}

impl TryFrom<&PhaseConfigRow> for PhaseCfg {
    type Error = ConfigError;

    fn try_from(row: &PhaseConfigRow) -> Result<Self, Self::Error> {
        let phase: FlowPhase = row.phase.parse()?;
        let next_phase = match row.next_phase.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(name.parse::<FlowPhase>()?),
        };
        match next_phase {
            Some(next) if !phase.can_transition_to(next) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{phase}.next_phase"),
                    message: format!("{next} does not follow {phase}"),
                });
            }
            None if !phase.is_terminal() => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{phase}.next_phase"),
                    message: "only the terminal phase may omit next_phase".into(),
                });
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&row.min_readiness_to_advance) {
            return Err(ConfigError::InvalidValue {
                key: format!("{phase}.min_readiness_to_advance"),
                message: format!("{} is outside 0.0..=1.0", row.min_readiness_to_advance),
            });
        }
        let max_reprompts = u32::try_from(row.max_reprompts).map_err(|_| ConfigError::InvalidValue {
            key: format!("{phase}.max_reprompts"),
            message: format!("{} is negative or too large", row.max_reprompts),
        })?;
        let substate_order = row
            .substate_order
            .iter()
            .map(|s| s.parse::<Phase7Step>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            phase,
            next_phase,
            min_readiness_to_advance: row.min_readiness_to_advance,
            max_reprompts,
            allow_deepthink: row.allow_deepthink,
            substate_order,
            enabled: row.enabled,
        })
    }
}

/// The full phase policy for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTable {
    phases: BTreeMap<FlowPhase, PhaseCfg>,
    disabled: BTreeSet<FlowPhase>,
}

impl PhaseTable {
    /// Built-in defaults. These also seed the `phase_config` table.
    pub fn builtin() -> Self {
        let mut phases = BTreeMap::new();
        for phase in FlowPhase::ALL {
            if phase.is_exploratory() {
                phases.insert(phase, PhaseCfg::exploratory(phase));
            }
        }
        phases.insert(
            FlowPhase::Options,
            PhaseCfg {
                min_readiness_to_advance: 0.75,
                ..PhaseCfg::exploratory(FlowPhase::Options)
            },
        );
        phases.insert(
            FlowPhase::Message,
            PhaseCfg {
                phase: FlowPhase::Message,
                next_phase: None,
                min_readiness_to_advance: 0.8,
                max_reprompts: 3,
                allow_deepthink: true,
                substate_order: Phase7Step::DEFAULT_ORDER.to_vec(),
                enabled: true,
            },
        );
        Self {
            phases,
            disabled: BTreeSet::new(),
        }
    }

    /// Build a table from explicit configs, e.g. test fixtures.
    pub fn from_configs(configs: impl IntoIterator<Item = PhaseCfg>) -> Self {
        let mut table = Self::builtin();
        for cfg in configs {
            table.insert(cfg);
        }
        table
    }

    fn insert(&mut self, cfg: PhaseCfg) {
        if !cfg.enabled && cfg.phase.is_terminal() {
            warn!(phase = %cfg.phase, "The terminal phase cannot be disabled, ignoring row");
            return;
        }
        if cfg.enabled {
            self.disabled.remove(&cfg.phase);
            self.phases.insert(cfg.phase, cfg);
        } else {
            self.phases.remove(&cfg.phase);
            self.disabled.insert(cfg.phase);
        }
    }

    /// Overlay store rows. Invalid rows are skipped with a warning.
    pub fn merge_rows(&mut self, rows: &[PhaseConfigRow]) {
        for row in rows {
            match PhaseCfg::try_from(row) {
                Ok(cfg) => self.insert(cfg),
                Err(e) => warn!(phase = %row.phase, error = %e, "Ignoring invalid phase_config row"),
            }
        }
    }

    /// Configuration for `phase`. Disabled phases are a hard error.
    pub fn resolve(&self, phase: FlowPhase) -> Result<&PhaseCfg, ConfigError> {
        if self.disabled.contains(&phase) {
            return Err(ConfigError::PhaseDisabled {
                phase: phase.to_string(),
            });
        }
        self.phases.get(&phase).ok_or_else(|| ConfigError::UnknownPhase {
            phase: phase.to_string(),
        })
    }

    pub fn is_enabled(&self, phase: FlowPhase) -> bool {
        self.phases.contains_key(&phase) && !self.disabled.contains(&phase)
    }

    /// The phase an advance from `phase` lands on, skipping disabled phases.
    pub fn effective_next(&self, phase: FlowPhase) -> Option<FlowPhase> {
        let mut candidate = self.phases.get(&phase)?.next_phase;
        while let Some(p) = candidate {
            if self.is_enabled(p) {
                return Some(p);
            }
            candidate = p.next();
        }
        None
    }

    /// The first enabled phase in flow order.
    pub fn first_phase(&self) -> Option<FlowPhase> {
        FlowPhase::ALL.into_iter().find(|p| self.is_enabled(*p))
    }

    /// Enabled configs in flow order.
    pub fn enabled(&self) -> impl Iterator<Item = &PhaseCfg> {
        self.phases.values()
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Loads phase policy per request.
///
/// Store failures degrade to the defaults: the engine must always be able
/// to proceed with some policy.
pub struct PhaseConfigResolver {
    store: Option<Arc<dyn PhaseConfigStore>>,
    defaults: PhaseTable,
}

impl PhaseConfigResolver {
    pub fn new(store: Option<Arc<dyn PhaseConfigStore>>, defaults: PhaseTable) -> Self {
        Self { store, defaults }
    }

    /// Defaults only, no store.
    pub fn builtin() -> Self {
        Self::new(None, PhaseTable::builtin())
    }

    /// Load every row in one call and merge over the defaults.
    pub async fn load(&self) -> PhaseTable {
        let mut table = self.defaults.clone();
        let Some(store) = &self.store else {
            return table;
        };
        match store.load_phase_rows().await {
            Ok(rows) => {
                debug!(rows = rows.len(), "Loaded phase configuration");
                table.merge_rows(&rows);
            }
            Err(e) => {
                warn!(error = %e, "Phase config store unavailable, using built-in defaults");
            }
        }
        table
    }

    /// Resolve a single phase by name.
    pub async fn resolve_named(&self, phase: &str) -> Result<PhaseCfg, ConfigError> {
        let phase: FlowPhase = phase.parse()?;
        self.load().await.resolve(phase).cloned()
    }
}
