//! The Update Engine: the core state machine described in spec.md §4.E.
//! Owns the Engine/Orchestrator gateways, the cycle-scoped and
//! process-lifetime ignore sets, and runs the ordered
//! Prune -> Stacks -> Containers cycle.

mod container_phase;
mod prune;
mod stack_phase;
mod state_machine;

pub use state_machine::HealthProbeConfig;

use crate::config::MaidConfig;
use crate::engine_gateway::EngineGateway;
use crate::freshness::FreshnessOracle;
use crate::orchestrator_gateway::OrchestratorGateway;
use log::info;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

pub struct UpdateEngine {
    engine: Box<dyn EngineGateway>,
    orchestrator: Option<Box<dyn OrchestratorGateway>>,
    exclude_patterns: Vec<String>,
    backup_retention: chrono::Duration,
    health: HealthProbeConfig,
    registry_direct_mode: bool,
    /// Rollback-victim container names, never reset: spec.md §9 carves
    /// this out of the otherwise cycle-scoped ignore set.
    permanently_ignored: HashSet<String>,
}

impl UpdateEngine {
    pub fn new(engine: Box<dyn EngineGateway>, orchestrator: Option<Box<dyn OrchestratorGateway>>, config: &MaidConfig) -> Self {
        Self {
            engine,
            orchestrator,
            exclude_patterns: config.exclude_patterns.clone(),
            backup_retention: config.backup_retention,
            health: HealthProbeConfig { poll_interval: std::time::Duration::from_secs(2), window: config.container_check },
            registry_direct_mode: config.registry_direct_mode,
            permanently_ignored: HashSet::new(),
        }
    }

    /// Runs one full Prune -> Stacks -> Containers cycle. Failure in any
    /// phase is scoped to that phase and logged; the cycle always
    /// completes and returns so the scheduler can compute the next delay.
    ///
    /// `cancel` is checked between phases and within each phase's
    /// per-item loop, so a shutdown request stops the cycle from
    /// starting new work without forcibly interrupting whatever
    /// engine/orchestrator call is already in flight.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) {
        info!("Housekeeping cycle starting.");

        prune::prune(self.engine.as_ref(), self.backup_retention, cancel).await;

        if cancel.is_cancelled() {
            info!("Housekeeping cycle cut short by cancellation after the prune phase.");
            return;
        }

        let freshness = FreshnessOracle::new(self.engine.as_ref(), self.registry_direct_mode);

        let mut cycle_ignored: HashSet<String> = self.permanently_ignored.clone();
        let mut stack_repos: HashSet<String> = HashSet::new();

        if let Some(orchestrator) = &self.orchestrator {
            let result = stack_phase::run(self.engine.as_ref(), orchestrator.as_ref(), &freshness, &self.exclude_patterns, cancel).await;
            cycle_ignored.extend(result.ignored_containers);
            stack_repos = result.stack_repos;
        } else {
            info!("No orchestrator configured, skipping stack phase.");
        }

        if cancel.is_cancelled() {
            info!("Housekeeping cycle cut short by cancellation after the stack phase.");
            return;
        }

        let result = container_phase::run(
            self.engine.as_ref(),
            &freshness,
            &self.exclude_patterns,
            &cycle_ignored,
            &stack_repos,
            &self.health,
            cancel,
        )
        .await;

        for name in result.rolled_back {
            self.permanently_ignored.insert(name);
        }

        info!("Housekeeping cycle complete.");
    }
}
