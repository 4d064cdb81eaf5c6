//! Stack phase, spec.md §4.E.2: walks every orchestrator-managed stack,
//! redeploying any whose images have a newer remote version and
//! recording its containers into `ignored_containers` so the container
//! phase leaves them alone this cycle.

use crate::engine_gateway::EngineGateway;
use crate::freshness::FreshnessOracle;
use crate::orchestrator_gateway::{OrchestratorGateway, Stack};
use crate::reference;
use log::{info, warn};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

pub struct StackPhaseResult {
    pub ignored_containers: HashSet<String>,
    pub stack_repos: HashSet<String>,
}

/// Scans `manifest` for lines of the form `image: <ref>` after trimming,
/// as the fallback image source when the engine reports no containers
/// yet labeled for this stack. This over-approximates (can match inside
/// multi-line strings); it exists only as a fallback, per spec.md §9.
fn images_from_manifest(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("image:"))
        .map(|rest| rest.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn run(
    engine: &dyn EngineGateway,
    orchestrator: &dyn OrchestratorGateway,
    freshness: &FreshnessOracle<'_>,
    exclude_patterns: &[String],
    cancel: &CancellationToken,
) -> StackPhaseResult {
    info!("Stack phase starting.");
    let mut ignored_containers = HashSet::new();
    let mut stack_repos = HashSet::new();

    let stacks = match orchestrator.list_stacks().await {
        Ok(s) => s,
        Err(e) => {
            warn!("Stack phase: failed to list stacks, skipping this cycle: {e}");
            return StackPhaseResult { ignored_containers, stack_repos };
        }
    };

    for stack in stacks {
        if cancel.is_cancelled() {
            info!("Stack phase: cancellation requested, stopping before `{}`.", stack.name);
            break;
        }

        if let Err(outcome) = process_stack(engine, orchestrator, freshness, exclude_patterns, &stack, &mut ignored_containers, &mut stack_repos).await {
            warn!("Stack phase: {outcome} (stack `{}`).", stack.name);
        }
    }

    info!("Stack phase complete.");
    StackPhaseResult { ignored_containers, stack_repos }
}

async fn process_stack(
    engine: &dyn EngineGateway,
    orchestrator: &dyn OrchestratorGateway,
    freshness: &FreshnessOracle<'_>,
    exclude_patterns: &[String],
    stack: &Stack,
    ignored_containers: &mut HashSet<String>,
    stack_repos: &mut HashSet<String>,
) -> Result<(), String> {
    let manifest = match orchestrator.get_manifest(stack.id).await {
        Ok(Some(m)) => m,
        Ok(None) => return Err("manifest not retrievable, skipping".to_string()),
        Err(e) => return Err(format!("failed to fetch manifest: {e}")),
    };

    let label_value = stack.name.clone();
    let labeled_containers = engine
        .list_containers_by_label("com.docker.compose.project", &label_value)
        .await
        .unwrap_or_default();

    let image_refs: Vec<String> = if !labeled_containers.is_empty() {
        labeled_containers.iter().map(|c| c.image.clone()).collect()
    } else {
        images_from_manifest(&manifest)
    };

    let mut needs_update = false;
    for image_ref in &image_refs {
        let Ok(reference) = reference::parse(image_ref) else { continue };
        stack_repos.insert(reference.repository_root().to_string());

        if exclude_patterns.iter().any(|p| image_ref.contains(p.as_str())) {
            continue;
        }
        if reference.is_digest_pinned() {
            continue;
        }

        match freshness.has_newer(&reference).await {
            Ok(true) => needs_update = true,
            Ok(false) => {}
            Err(e) => warn!("Stack phase: freshness check failed for `{image_ref}` in stack `{}`: {e}", stack.name),
        }
    }

    if !needs_update {
        info!("Stack `{}` is up to date.", stack.name);
        return Ok(());
    }

    let env = orchestrator.get_stack_env(stack.id).await.unwrap_or_default();
    match orchestrator.redeploy(stack, &manifest, &env).await {
        Ok(()) => {
            info!("Stack `{}` redeployed.", stack.name);
            let refreshed = engine
                .list_containers_by_label("com.docker.compose.project", &label_value)
                .await
                .unwrap_or_default();
            for c in refreshed {
                ignored_containers.insert(c.name);
            }
            Ok(())
        }
        Err(e) => Err(format!("redeploy failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_gateway::{ContainerInfo, ContainerRunState, ContainerSnapshot, ImageInfo, PullOutcome};
    use crate::orchestrator_gateway::StackType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeEngine {
        labeled: Vec<ContainerInfo>,
    }

    #[async_trait]
    impl EngineGateway for FakeEngine {
        async fn list_containers(&self, _all: bool) -> crate::errors::Result<Vec<ContainerInfo>> {
            Ok(vec![])
        }
        async fn list_containers_by_label(&self, _k: &str, _v: &str) -> crate::errors::Result<Vec<ContainerInfo>> {
            Ok(self.labeled.clone())
        }
        async fn capture_snapshot(&self, _id: &str) -> crate::errors::Result<ContainerSnapshot> {
            unimplemented!()
        }
        async fn stop(&self, _id: &str) -> crate::errors::Result<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str, _force: bool) -> crate::errors::Result<()> {
            Ok(())
        }
        async fn create(&self, _s: &ContainerSnapshot, _image: &str) -> crate::errors::Result<String> {
            unimplemented!()
        }
        async fn start(&self, _id: &str) -> crate::errors::Result<()> {
            Ok(())
        }
        async fn inspect_run_state(&self, _id: &str) -> crate::errors::Result<ContainerRunState> {
            Ok(ContainerRunState::Running)
        }
        async fn list_images(&self, _all: bool) -> crate::errors::Result<Vec<ImageInfo>> {
            Ok(vec![])
        }
        async fn inspect_image(&self, _reference: &str) -> crate::errors::Result<Option<ImageInfo>> {
            Ok(None)
        }
        async fn pull(&self, _repo: &str, _tag: &str) -> crate::errors::Result<PullOutcome> {
            Ok(PullOutcome { pulled_newer: true })
        }
        async fn tag(&self, _id: &str, _repo: &str, _tag: &str) -> crate::errors::Result<()> {
            Ok(())
        }
        async fn delete_image(&self, _reference: &str, _force: bool) -> crate::errors::Result<()> {
            Ok(())
        }
    }

    struct FakeOrchestrator {
        stacks: Vec<Stack>,
        manifest: String,
        redeployed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl OrchestratorGateway for FakeOrchestrator {
        async fn list_stacks(&self) -> crate::errors::Result<Vec<Stack>> {
            Ok(self.stacks.clone())
        }
        async fn get_manifest(&self, _stack_id: i64) -> crate::errors::Result<Option<String>> {
            Ok(Some(self.manifest.clone()))
        }
        async fn get_stack_env(&self, _stack_id: i64) -> crate::errors::Result<Vec<(String, String)>> {
            Ok(vec![])
        }
        async fn redeploy(&self, stack: &Stack, _yaml: &str, _env: &[(String, String)]) -> crate::errors::Result<()> {
            self.redeployed.lock().unwrap().push(stack.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stale_stack_redeploys_and_ignores_its_containers() {
        let stack = Stack { id: 1, name: "s".to_string(), endpoint_id: 1, stack_type: StackType::Compose };
        let engine = FakeEngine {
            labeled: vec![ContainerInfo {
                id: "c1".to_string(),
                name: "svc".to_string(),
                image: "myrepo/svc:prod".to_string(),
                image_id: "A".to_string(),
                state: ContainerRunState::Running,
                labels: Default::default(),
            }],
        };
        let orchestrator = FakeOrchestrator {
            stacks: vec![stack.clone()],
            manifest: "services:\n  svc:\n    image: myrepo/svc:prod\n".to_string(),
            redeployed: Mutex::new(vec![]),
        };
        let freshness = FreshnessOracle::new(&engine, false);
        let result = run(&engine, &orchestrator, &freshness, &[], &CancellationToken::new()).await;

        assert_eq!(orchestrator.redeployed.lock().unwrap().as_slice(), [1]);
        assert!(result.ignored_containers.contains("svc"));
        assert!(result.stack_repos.contains("myrepo"));
    }

    #[tokio::test]
    async fn manifest_fallback_is_used_when_no_labeled_containers() {
        let lines = images_from_manifest("version: '3'\nservices:\n  web:\n    image: nginx:1.25\n    ports:\n      - 80:80\n");
        assert_eq!(lines, vec!["nginx:1.25".to_string()]);
    }
}
