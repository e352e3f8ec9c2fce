//! Patrol run configuration and turn budget

use pulse_core::config::{AiSettings, PatrolSettings};
use pulse_core::StateSnapshot;
use pulse_store::ResourceCounts;
use std::time::Duration;

const MIN_TURNS: usize = 20;
const MAX_TURNS: usize = 80;
const QUICK_MIN_TURNS: usize = 10;
const QUICK_MAX_TURNS: usize = 30;
const TURNS_PER_50_RESOURCES: usize = 5;

/// Turns granted to the evaluation pass
pub const EVAL_MAX_TURNS: usize = 5;

/// Which resource categories a run looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisScope {
    pub nodes: bool,
    pub guests: bool,
    pub docker: bool,
    pub storage: bool,
    pub pbs: bool,
    pub hosts: bool,
    pub kubernetes: bool,
    pub pmg: bool,
}

impl Default for AnalysisScope {
    fn default() -> Self {
        Self {
            nodes: true,
            guests: true,
            docker: true,
            storage: true,
            pbs: true,
            hosts: true,
            kubernetes: true,
            pmg: true,
        }
    }
}

impl AnalysisScope {
    /// Resources per enabled category; disabled categories count zero
    pub fn counts(&self, state: &StateSnapshot) -> ResourceCounts {
        let pick = |enabled: bool, n: usize| if enabled { n } else { 0 };
        ResourceCounts {
            nodes: pick(self.nodes, state.nodes.len()),
            guests: pick(self.guests, state.vms.len() + state.containers.len()),
            docker: pick(self.docker, state.docker_hosts.len()),
            storage: pick(self.storage, state.storage.len()),
            pbs: pick(self.pbs, state.pbs_instances.len()),
            hosts: pick(self.hosts, state.hosts.len()),
            kubernetes: pick(self.kubernetes, state.kubernetes_clusters.len()),
            pmg: pick(self.pmg, state.pmg_instances.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatrolConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub scope: AnalysisScope,
    /// Scheduled runs use the quick turn budget
    pub quick_scope: bool,
    pub auto_fix: bool,
    /// `provider:model`; empty leaves the runtime default
    pub model: String,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self::from_settings(&PatrolSettings::default(), &AiSettings::default())
    }
}

impl PatrolConfig {
    pub fn from_settings(patrol: &PatrolSettings, ai: &AiSettings) -> Self {
        Self {
            enabled: patrol.enabled,
            interval: patrol.interval(),
            scope: AnalysisScope {
                nodes: patrol.analyze_nodes,
                guests: patrol.analyze_guests,
                docker: patrol.analyze_docker,
                storage: patrol.analyze_storage,
                pbs: patrol.analyze_pbs,
                hosts: patrol.analyze_hosts,
                kubernetes: patrol.analyze_kubernetes,
                pmg: patrol.analyze_pmg,
            },
            quick_scope: patrol.quick_scope,
            auto_fix: ai.patrol_auto_fix,
            model: ai.effective_patrol_model().to_string(),
        }
    }
}

/// `clamp(min + floor(n/50)*5, min, max)` with the quick bounds when `quick`
pub fn max_turns(resource_count: usize, quick: bool) -> usize {
    let (min, max) = if quick {
        (QUICK_MIN_TURNS, QUICK_MAX_TURNS)
    } else {
        (MIN_TURNS, MAX_TURNS)
    };
    (min + (resource_count / 50) * TURNS_PER_50_RESOURCES).clamp(min, max)
}
