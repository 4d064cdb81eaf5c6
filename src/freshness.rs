//! Decides whether a reference has a newer remote image than the local
//! one. The default path consults the Engine Gateway (pull-and-compare);
//! the optional registry-direct path is grounded line-for-line in the
//! example pack's closest sibling, `dockge`'s update checker
//! (`fetch_remote_digest`/`fetch_bearer_token`: HEAD the manifest,
//! follow a single Bearer challenge, compare `Docker-Content-Digest`).

use crate::engine_gateway::EngineGateway;
use crate::errors::{MaidError, Result};
use crate::reference::Reference;
use log::debug;
use regex::Regex;
use std::time::Duration;

const REGISTRY_TIMEOUT_SECS: u64 = 15;

pub struct FreshnessOracle<'a> {
    engine: &'a dyn EngineGateway,
    registry_direct: bool,
    http: reqwest::Client,
}

impl<'a> FreshnessOracle<'a> {
    pub fn new(engine: &'a dyn EngineGateway, registry_direct: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REGISTRY_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { engine, registry_direct, http }
    }

    pub async fn has_newer(&self, reference: &Reference) -> Result<bool> {
        if reference.is_digest_pinned() {
            return Ok(false);
        }

        if self.registry_direct {
            return self.has_newer_registry_direct(reference).await;
        }

        let aliases = reference.canonical_aliases();
        let (old_id, old_digest) = self.resolve_local(&aliases).await?;

        let pull_outcome = self
            .engine
            .pull(&reference.repository, reference.tag_or_default())
            .await;
        let pulled_newer = match pull_outcome {
            Ok(outcome) => outcome.pulled_newer,
            Err(e) => {
                debug!("pull failed while probing freshness for `{}`: {e}", reference.render());
                false
            }
        };

        let (new_id, new_digest) = self.resolve_local(&aliases).await?;

        let newer = (old_id.is_none() && new_id.is_some())
            || (old_id.is_some() && old_id != new_id)
            || (old_digest != new_digest)
            || pulled_newer;

        Ok(newer)
    }

    async fn resolve_local(&self, aliases: &std::collections::HashSet<String>) -> Result<(Option<String>, Option<String>)> {
        for alias in aliases {
            if let Some(image) = self.engine.inspect_image(alias).await? {
                let digest = image.repo_digests.first().cloned();
                return Ok((Some(image.id), digest));
            }
        }
        Ok((None, None))
    }

    async fn has_newer_registry_direct(&self, reference: &Reference) -> Result<bool> {
        let aliases = reference.canonical_aliases();
        let (_, old_digest) = self.resolve_local(&aliases).await?;

        let registry = reference.registry.as_deref().unwrap_or(crate::reference::DOCKER_HUB_REGISTRY);
        let registry_url = if registry == crate::reference::DOCKER_HUB_REGISTRY {
            "https://registry-1.docker.io".to_string()
        } else {
            format!("https://{registry}")
        };
        let manifest_url = format!("{}/v2/{}/manifests/{}", registry_url, reference.repository, reference.tag_or_default());
        const ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";

        let initial = self
            .http
            .head(&manifest_url)
            .header("Accept", ACCEPT)
            .send()
            .await
            .map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;

        let response = if initial.status() == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = initial
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let token = self.fetch_bearer_token(&www_auth, &reference.repository).await?;
            self.http
                .head(&manifest_url)
                .header("Accept", ACCEPT)
                .header("Authorization", format!("Bearer {token}"))
                .send()
                .await
                .map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?
        } else {
            initial
        };

        if !response.status().is_success() {
            return Ok(false);
        }

        let remote_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(match (old_digest, remote_digest) {
            (Some(old), Some(remote)) => old != remote,
            (None, Some(_)) => true,
            _ => false,
        })
    }

    async fn fetch_bearer_token(&self, www_auth: &str, repository: &str) -> Result<String> {
        let realm = Regex::new(r#"realm="([^"]+)""#)
            .ok()
            .and_then(|re| re.captures(www_auth))
            .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
            .ok_or_else(|| MaidError::Other(anyhow::anyhow!("missing realm in WWW-Authenticate header")))?;

        let service = Regex::new(r#"service="([^"]+)""#)
            .ok()
            .and_then(|re| re.captures(www_auth))
            .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
            .unwrap_or_default();

        let scope = format!("repository:{repository}:pull");
        let token_url = format!(
            "{}?service={}&scope={}",
            realm,
            urlencoding::encode(&service),
            urlencoding::encode(&scope)
        );

        let response = self.http.get(&token_url).send().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        if !response.status().is_success() {
            return Err(MaidError::Other(anyhow::anyhow!("token endpoint returned status {}", response.status())));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| MaidError::Other(anyhow::anyhow!("token response missing `token`/`access_token`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_gateway::{ContainerInfo, ContainerRunState, ContainerSnapshot, ImageInfo, PullOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeEngine {
        images_by_ref: Mutex<HashMap<String, ImageInfo>>,
        pull_outcome: PullOutcome,
        post_pull_image: Option<ImageInfo>,
        post_pull_ref: String,
    }

    #[async_trait]
    impl EngineGateway for FakeEngine {
        async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerInfo>> {
            Ok(vec![])
        }
        async fn list_containers_by_label(&self, _k: &str, _v: &str) -> Result<Vec<ContainerInfo>> {
            Ok(vec![])
        }
        async fn capture_snapshot(&self, _id: &str) -> Result<ContainerSnapshot> {
            unimplemented!()
        }
        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _id: &str, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn create(&self, _s: &ContainerSnapshot, _image: &str) -> Result<String> {
            unimplemented!()
        }
        async fn start(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn inspect_run_state(&self, _id: &str) -> Result<ContainerRunState> {
            Ok(ContainerRunState::Running)
        }
        async fn list_images(&self, _all: bool) -> Result<Vec<ImageInfo>> {
            Ok(vec![])
        }
        async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
            Ok(self.images_by_ref.lock().unwrap().get(reference).cloned())
        }
        async fn pull(&self, _repo: &str, _tag: &str) -> Result<PullOutcome> {
            if let Some(img) = &self.post_pull_image {
                self.images_by_ref.lock().unwrap().insert(self.post_pull_ref.clone(), img.clone());
            }
            Ok(self.pull_outcome.clone())
        }
        async fn tag(&self, _id: &str, _repo: &str, _tag: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_image(&self, _reference: &str, _force: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn digest_pinned_is_never_newer() {
        let engine = FakeEngine {
            images_by_ref: Mutex::new(HashMap::new()),
            pull_outcome: PullOutcome { pulled_newer: true },
            post_pull_image: None,
            post_pull_ref: String::new(),
        };
        let oracle = FreshnessOracle::new(&engine, false);
        let reference = crate::reference::parse("myrepo/app@sha256:abcd").unwrap();
        assert!(!oracle.has_newer(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn unchanged_id_and_no_pull_signal_is_not_newer() {
        let reference = crate::reference::parse("myrepo/app:prod").unwrap();
        let mut images = HashMap::new();
        for alias in reference.canonical_aliases() {
            images.insert(alias, ImageInfo { id: "sha256:A".into(), repo_tags: vec![], repo_digests: vec![], created_at: 0 });
        }
        let engine = FakeEngine {
            images_by_ref: Mutex::new(images),
            pull_outcome: PullOutcome { pulled_newer: false },
            post_pull_image: None,
            post_pull_ref: String::new(),
        };
        let oracle = FreshnessOracle::new(&engine, false);
        assert!(!oracle.has_newer(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn changed_id_after_pull_is_newer() {
        let reference = crate::reference::parse("myrepo/app:prod").unwrap();
        let alias = reference.render();
        let mut images = HashMap::new();
        images.insert(alias.clone(), ImageInfo { id: "sha256:A".into(), repo_tags: vec![], repo_digests: vec![], created_at: 0 });
        let engine = FakeEngine {
            images_by_ref: Mutex::new(images),
            pull_outcome: PullOutcome { pulled_newer: false },
            post_pull_image: Some(ImageInfo { id: "sha256:B".into(), repo_tags: vec![], repo_digests: vec![], created_at: 0 }),
            post_pull_ref: alias,
        };
        let oracle = FreshnessOracle::new(&engine, false);
        assert!(oracle.has_newer(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn absent_locally_but_present_after_pull_is_newer() {
        let reference = crate::reference::parse("myrepo/app:prod").unwrap();
        let alias = reference.render();
        let engine = FakeEngine {
            images_by_ref: Mutex::new(HashMap::new()),
            pull_outcome: PullOutcome { pulled_newer: false },
            post_pull_image: Some(ImageInfo { id: "sha256:B".into(), repo_tags: vec![], repo_digests: vec![], created_at: 0 }),
            post_pull_ref: alias,
        };
        let oracle = FreshnessOracle::new(&engine, false);
        assert!(oracle.has_newer(&reference).await.unwrap());
    }
}
