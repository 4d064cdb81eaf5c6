//! Per-container recreate/rollback state machine, spec.md §4.E.4.
//!
//! Generalizes the teacher's `update_container` (inspect → stop → remove
//! → recreate → conditionally start) with backup tagging before the
//! swap and a health probe + rollback after it.

use crate::engine_gateway::{ContainerRunState, EngineGateway};
use crate::reference::Reference;
use chrono::Utc;
use log::{error, info, warn};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
    Abandoned,
}

pub struct HealthProbeConfig {
    pub poll_interval: Duration,
    pub window: Duration,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), window: Duration::from_secs(10) }
    }
}

/// Runs the full state machine for one container against a reference
/// already known to have a newer image. On `RolledBack`, the caller is
/// responsible for adding `container_name` to `ignored_containers`.
///
/// `cancel` is checked before the Idle -> BackupTagging transition (the
/// only point where abandoning costs nothing) and during the health
/// probe; once a create/start is in flight it always runs to completion,
/// per spec.md §5's "no forcible interruption" rule.
pub async fn update_container(
    engine: &dyn EngineGateway,
    container_id: &str,
    container_name: &str,
    old_image_id: &str,
    reference: &Reference,
    health: &HealthProbeConfig,
    cancel: &CancellationToken,
) -> Outcome {
    if cancel.is_cancelled() {
        info!("Update of `{container_name}` abandoned: cancellation requested.");
        return Outcome::Abandoned;
    }

    let repo = reference.repository.clone();
    let tag = reference.tag_or_default().to_string();
    let backup_tag = format!("backup-{}", Utc::now().format("%Y%m%d%H%M%S"));

    // Idle -> BackupTagging
    if let Err(e) = engine.tag(old_image_id, &repo, &backup_tag).await {
        error!("Update of `{container_name}` abandoned: failed to create backup tag: {e}");
        return Outcome::Abandoned;
    }
    info!("Tagged `{repo}:{backup_tag}` as rollback point for `{container_name}`.");

    // BackupTagging -> Replacing
    let snapshot = match engine.capture_snapshot(container_id).await {
        Ok(s) => s,
        Err(e) => {
            error!("Update of `{container_name}` abandoned: failed to capture snapshot: {e}");
            return Outcome::Abandoned;
        }
    };

    // stop/remove are best-effort: a transport error here must not block
    // the subsequent create, per spec.md's Replacing transition.
    if let Err(e) = engine.stop(container_id).await {
        warn!("Failed to stop `{container_name}` cleanly, continuing: {e}");
    }
    if let Err(e) = engine.remove(container_id, true).await {
        warn!("Failed to remove `{container_name}` cleanly, continuing: {e}");
    }

    let new_image = format!("{repo}:{tag}");
    let new_id = match engine.create(&snapshot, &new_image).await {
        Ok(id) => id,
        Err(e) => {
            return roll_back(engine, &snapshot, &repo, &backup_tag, container_name, None, format!("create failed: {e}")).await
        }
    };
    if let Err(e) = engine.start(&new_id).await {
        return roll_back(
            engine,
            &snapshot,
            &repo,
            &backup_tag,
            container_name,
            Some(new_id.clone()),
            format!("start failed: {e}"),
        )
        .await;
    }

    // Replacing -> HealthProbing
    let deadline = tokio::time::Instant::now() + health.window;
    loop {
        match engine.inspect_run_state(&new_id).await {
            Ok(ContainerRunState::Exited { code: 0 }) => {
                info!("`{container_name}` exited cleanly (code 0) during health probe; committed.");
                return Outcome::Committed;
            }
            Ok(ContainerRunState::Exited { code }) => {
                return roll_back(
                    engine,
                    &snapshot,
                    &repo,
                    &backup_tag,
                    container_name,
                    Some(new_id.clone()),
                    format!("new container exited with code {code} during health probe"),
                )
                .await;
            }
            Ok(ContainerRunState::Running) => {}
            Ok(ContainerRunState::Other(state)) => {
                warn!("`{container_name}` reported unexpected state `{state}` during health probe, continuing to poll.");
            }
            Err(e) => {
                warn!("Health probe inspect failed for `{container_name}`, continuing to poll: {e}");
            }
        }

        if tokio::time::Instant::now() >= deadline {
            info!("`{container_name}` reached the end of the probe window without a fatal exit; committed.");
            return Outcome::Committed;
        }

        tokio::select! {
            _ = sleep(health.poll_interval) => {}
            _ = cancel.cancelled() => {
                info!("`{container_name}` health probe cut short by cancellation; the new container is already up, so it is committed as-is.");
                return Outcome::Committed;
            }
        }
    }
}

async fn roll_back(
    engine: &dyn EngineGateway,
    snapshot: &crate::engine_gateway::ContainerSnapshot,
    repo: &str,
    backup_tag: &str,
    container_name: &str,
    failed_new_id: Option<String>,
    reason: String,
) -> Outcome {
    error!("Rolling back `{container_name}`: {reason}");

    if let Some(id) = failed_new_id {
        let _ = engine.stop(&id).await;
        let _ = engine.remove(&id, true).await;
    }

    let rollback_image = format!("{repo}:{backup_tag}");
    match engine.create(snapshot, &rollback_image).await {
        Ok(id) => match engine.start(&id).await {
            Ok(()) => {
                warn!("`{container_name}` rolled back to `{rollback_image}`; added to ignored set until operator intervention.");
                Outcome::RolledBack
            }
            Err(e) => {
                error!("Rollback start failed for `{container_name}`: {e}");
                Outcome::RolledBack
            }
        },
        Err(e) => {
            error!("Rollback create failed for `{container_name}`: {e}");
            Outcome::RolledBack
        }
    }
}
