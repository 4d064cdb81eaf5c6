//! Container phase, spec.md §4.E.3: walks every container not already
//! claimed by the stack phase and drives the update state machine for
//! any that have a newer image available.

use super::state_machine::{self, HealthProbeConfig, Outcome};
use crate::engine_gateway::EngineGateway;
use crate::freshness::FreshnessOracle;
use crate::reference;
use log::{info, warn};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

pub struct ContainerPhaseResult {
    pub rolled_back: Vec<String>,
}

pub async fn run(
    engine: &dyn EngineGateway,
    freshness: &FreshnessOracle<'_>,
    exclude_patterns: &[String],
    ignored_containers: &HashSet<String>,
    stack_repos: &HashSet<String>,
    health: &HealthProbeConfig,
    cancel: &CancellationToken,
) -> ContainerPhaseResult {
    info!("Container phase starting.");
    let mut rolled_back = Vec::new();

    let containers = match engine.list_containers(true).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Container phase: failed to list containers, skipping this cycle: {e}");
            return ContainerPhaseResult { rolled_back };
        }
    };

    for container in containers {
        if cancel.is_cancelled() {
            info!("Container phase: cancellation requested, stopping before `{}`.", container.name);
            break;
        }

        if container.image.starts_with("sha256:") {
            continue;
        }
        if exclude_patterns.iter().any(|p| container.image.contains(p.as_str()) || container.name.contains(p.as_str())) {
            continue;
        }
        if ignored_containers.contains(&container.name) {
            continue;
        }

        let reference = match reference::parse(&container.image) {
            Ok(r) => r,
            Err(e) => {
                warn!("Container phase: skipping `{}`, unparsable image `{}`: {e}", container.name, container.image);
                continue;
            }
        };

        if stack_repos.contains(reference.repository_root()) {
            continue;
        }
        if reference.is_digest_pinned() {
            continue;
        }

        info!("Checking container `{}` (image `{}`).", container.name, container.image);
        match freshness.has_newer(&reference).await {
            Ok(false) => {
                info!("`{}` is up to date.", container.name);
                continue;
            }
            Err(e) => {
                warn!("Container phase: freshness check failed for `{}`, skipping: {e}", container.name);
                continue;
            }
            Ok(true) => {}
        }

        info!("New image available for `{}`, starting update.", container.name);
        let outcome = state_machine::update_container(
            engine,
            &container.id,
            &container.name,
            &container.image_id,
            &reference,
            health,
            cancel,
        )
        .await;

        match outcome {
            Outcome::Committed => info!("`{}` committed to new image.", container.name),
            Outcome::RolledBack => {
                warn!("`{}` rolled back; will be ignored in future cycles until operator intervention.", container.name);
                rolled_back.push(container.name.clone());
            }
            Outcome::Abandoned => warn!("`{}` update abandoned before any change was made.", container.name),
        }
    }

    info!("Container phase complete.");
    ContainerPhaseResult { rolled_back }
}
