//! Thin capability over the Docker engine, grounded in the teacher's
//! `utils.rs` (`connect_to_docker`, `get_all_containers`, `pull_image`)
//! and `maid.rs`'s inline `docker.*` calls, generalized into a trait so
//! the update engine can be exercised against an in-memory fake.

use crate::errors::{MaidError, Result};
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, NetworkingConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptionsBuilder,
    ListContainersOptionsBuilder, ListImagesOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveImageOptionsBuilder, StartContainerOptionsBuilder, StopContainerOptionsBuilder,
    TagImageOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRunState {
    Running,
    Exited { code: i64 },
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub state: ContainerRunState,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created_at: i64,
}

/// The fields needed to reconstruct an equivalent container under a new
/// image, captured verbatim from an inspect call. `host_config` and
/// `networking_config` are kept as the raw bollard types, the same way
/// the teacher's `update_container` round-trips them, since re-deriving
/// volumes/port-bindings/resource-limits field by field would just be a
/// worse copy of what bollard already models.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub name: String,
    pub image_ref: String,
    pub env: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub platform: Option<String>,
    pub host_config: Option<HostConfig>,
    pub networking_config: Option<NetworkingConfig>,
    pub config_value: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub pulled_newer: bool,
}

#[async_trait]
pub trait EngineGateway: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;
    async fn list_containers_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>>;
    async fn capture_snapshot(&self, id: &str) -> Result<ContainerSnapshot>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str, force: bool) -> Result<()>;
    async fn create(&self, snapshot: &ContainerSnapshot, image: &str) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn inspect_run_state(&self, id: &str) -> Result<ContainerRunState>;
    async fn list_images(&self, all: bool) -> Result<Vec<ImageInfo>>;
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;
    async fn pull(&self, repo: &str, tag: &str) -> Result<PullOutcome>;
    async fn tag(&self, image_id: &str, repo: &str, tag: &str) -> Result<()>;
    async fn delete_image(&self, reference: &str, force: bool) -> Result<()>;
}

pub struct BollardEngineGateway {
    docker: Docker,
}

impl BollardEngineGateway {
    /// Connects following `DOCKER_HOST` when set, else the platform
    /// default socket/pipe, matching the teacher's `connect_to_docker`
    /// but surfacing the failure instead of panicking, since startup
    /// connect failure is the one place spec.md requires a clean
    /// non-zero exit rather than a panic.
    pub fn connect() -> Result<Self> {
        let docker = if env::var("DOCKER_HOST").is_ok() {
            Docker::connect_with_defaults()
        } else {
            Docker::connect_with_socket_defaults()
        }
        .map_err(|e| MaidError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl EngineGateway for BollardEngineGateway {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptionsBuilder::new().all(all).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))?;
        Ok(containers.into_iter().filter_map(to_container_info).collect())
    }

    async fn list_containers_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([("label".to_string(), vec![format!("{key}={value}")])]);
        let options = ListContainersOptionsBuilder::new().all(true).filters(&filters).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))?;
        Ok(containers.into_iter().filter_map(to_container_info).collect())
    }

    async fn capture_snapshot(&self, id: &str) -> Result<ContainerSnapshot> {
        let options = InspectContainerOptionsBuilder::new().build();
        let inspect = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))?;

        let config = inspect
            .config
            .ok_or_else(|| MaidError::EngineTransient(format!("container `{id}` has no config")))?;
        let config_value = serde_json::to_value(&config)
            .map_err(|e| MaidError::EngineTransient(format!("failed to serialize container config: {e}")))?;

        Ok(ContainerSnapshot {
            name: inspect.name.unwrap_or_default(),
            image_ref: config.image.clone().unwrap_or_default(),
            env: config.env.clone(),
            cmd: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            user: config.user.clone(),
            working_dir: config.working_dir.clone(),
            labels: config.labels.clone().unwrap_or_default(),
            platform: inspect.platform,
            host_config: inspect.host_config,
            networking_config: inspect.network_settings.map(|ns| NetworkingConfig { endpoints_config: ns.networks }),
            config_value,
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptionsBuilder::new().t(10).build();
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(force).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))
    }

    async fn create(&self, snapshot: &ContainerSnapshot, image: &str) -> Result<String> {
        let mut body: ContainerCreateBody = serde_json::from_value(snapshot.config_value.clone())
            .map_err(|e| MaidError::CreateOrStartFailed(format!("failed to deserialize container config: {e}")))?;
        body.image = Some(image.to_string());
        body.host_config = snapshot.host_config.clone();
        body.networking_config = snapshot.networking_config.clone();

        let options = CreateContainerOptionsBuilder::new()
            .name(&snapshot.name)
            .platform(snapshot.platform.as_deref().unwrap_or_default())
            .build();

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| MaidError::CreateOrStartFailed(e.to_string()))?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let options = StartContainerOptionsBuilder::new().build();
        self.docker
            .start_container(id, Some(options))
            .await
            .map_err(|e| MaidError::CreateOrStartFailed(e.to_string()))
    }

    async fn inspect_run_state(&self, id: &str) -> Result<ContainerRunState> {
        let options = InspectContainerOptionsBuilder::new().build();
        let inspect = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))?;
        Ok(inspect.state.map(to_run_state).unwrap_or(ContainerRunState::Other("unknown".to_string())))
    }

    async fn list_images(&self, all: bool) -> Result<Vec<ImageInfo>> {
        let options = ListImagesOptionsBuilder::new().all(all).build();
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|e| MaidError::EngineTransient(e.to_string()))?;
        Ok(images
            .into_iter()
            .map(|i| ImageInfo {
                id: i.id,
                repo_tags: i.repo_tags,
                repo_digests: i.repo_digests,
                created_at: i.created,
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(ImageInfo {
                id: image.id.unwrap_or_default(),
                repo_tags: image.repo_tags.unwrap_or_default(),
                repo_digests: image.repo_digests.unwrap_or_default(),
                created_at: image.created.map(|c| c.timestamp()).unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(MaidError::EngineTransient(e.to_string())),
        }
    }

    async fn pull(&self, repo: &str, tag: &str) -> Result<PullOutcome> {
        let options = CreateImageOptionsBuilder::new().from_image(repo).tag(tag).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        let mut outcome = PullOutcome::default();
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| MaidError::PullFailed(e.to_string()))?;
            if let Some(status) = info.status.as_deref() {
                let lower = status.to_lowercase();
                if lower.contains("downloaded newer image")
                    || lower.contains("pulling fs layer")
                    || lower.contains("downloading")
                    || lower.contains("extracting")
                {
                    outcome.pulled_newer = true;
                }
            }
        }
        Ok(outcome)
    }

    async fn tag(&self, image_id: &str, repo: &str, tag: &str) -> Result<()> {
        let options = TagImageOptionsBuilder::new().repo(repo).tag(tag).build();
        self.docker
            .tag_image(image_id, Some(options))
            .await
            .map_err(|e| MaidError::BackupTagFailed(e.to_string()))
    }

    async fn delete_image(&self, reference: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptionsBuilder::new().force(force).build();
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| MaidError::DeleteImageFailed(e.to_string()))?;
        Ok(())
    }
}

fn to_container_info(c: bollard::models::ContainerSummary) -> Option<ContainerInfo> {
    let id = c.id?;
    let name = c.names.unwrap_or_default().into_iter().next().unwrap_or_default();
    let image = c.image.unwrap_or_default();
    let image_id = c.image_id.unwrap_or_default();
    let state = c.state.map(container_state_to_run_state).unwrap_or(ContainerRunState::Other("unknown".to_string()));
    let labels = c.labels.unwrap_or_default();
    Some(ContainerInfo { id, name, image, image_id, state, labels })
}

fn container_state_to_run_state(state: bollard::models::ContainerSummaryStateEnum) -> ContainerRunState {
    use bollard::models::ContainerSummaryStateEnum as S;
    match state {
        S::RUNNING => ContainerRunState::Running,
        other => ContainerRunState::Other(other.to_string()),
    }
}

fn to_run_state(state: bollard::models::ContainerState) -> ContainerRunState {
    if state.running.unwrap_or(false) {
        ContainerRunState::Running
    } else {
        ContainerRunState::Exited { code: state.exit_code.unwrap_or(0) }
    }
}
