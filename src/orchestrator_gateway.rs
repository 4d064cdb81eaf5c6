//! Thin capability over the stack orchestrator (modeled on Portainer's
//! `/api/stacks` surface), grounded in the example pack's closest
//! sibling for an HTTP registry/API client shape — the `dockge`
//! update-checker's bounded `reqwest::Client` and bearer-challenge flow
//! (`fetch_remote_digest`/`fetch_bearer_token`).
//!
//! Per design note §9 ("avoiding misuse of inheritance"), there is no
//! null-object implementation: the update engine holds an
//! `Option<Box<dyn OrchestratorGateway>>` and skips the stack phase
//! outright when it is `None`.

use crate::config::PortainerConfig;
use crate::errors::{MaidError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackType {
    Swarm,
    Compose,
}

impl StackType {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Swarm),
            2 => Some(Self::Compose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stack {
    pub id: i64,
    pub name: String,
    pub endpoint_id: i64,
    pub stack_type: StackType,
}

#[derive(Debug, Deserialize)]
struct StackDto {
    #[serde(rename = "Id")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "EndpointId")]
    endpoint_id: i64,
    #[serde(rename = "Type")]
    stack_type: i64,
}

#[derive(Debug, Deserialize)]
struct StackFileDto {
    #[serde(rename = "StackFileContent")]
    stack_file_content: String,
}

#[derive(Debug, Deserialize)]
struct EnvVarDto {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponseDto {
    jwt: String,
}

#[async_trait]
pub trait OrchestratorGateway: Send + Sync {
    async fn list_stacks(&self) -> Result<Vec<Stack>>;
    async fn get_manifest(&self, stack_id: i64) -> Result<Option<String>>;
    async fn get_stack_env(&self, stack_id: i64) -> Result<Vec<(String, String)>>;
    async fn redeploy(&self, stack: &Stack, yaml: &str, env: &[(String, String)]) -> Result<()>;
}

enum Credential {
    ApiKey(String),
    Password { username: String, password: String, jwt: RwLock<Option<String>> },
}

pub struct PortainerGateway {
    base_url: String,
    client: reqwest::Client,
    credential: Credential,
}

impl PortainerGateway {
    pub fn new(cfg: &PortainerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(cfg.insecure_tls)
            .build()
            .map_err(|e| MaidError::ConfigInvalid(format!("failed to build Portainer HTTP client: {e}")))?;

        let credential = match (&cfg.api_key, &cfg.username, &cfg.password) {
            (Some(key), _, _) => Credential::ApiKey(key.clone()),
            (None, Some(user), Some(pass)) => Credential::Password {
                username: user.clone(),
                password: pass.clone(),
                jwt: RwLock::new(None),
            },
            _ => {
                return Err(MaidError::ConfigInvalid(
                    "Portainer requires either an API key or a username/password pair".to_string(),
                ))
            }
        };

        Ok(Self { base_url: cfg.url.trim_end_matches('/').to_string(), client, credential })
    }

    async fn authed_request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, url);
        match &self.credential {
            Credential::ApiKey(key) => {
                req = req.header("X-API-Key", key);
            }
            Credential::Password { jwt, .. } => {
                let token = self.ensure_jwt().await?;
                let _ = jwt;
                req = req.header("Authorization", format!("Bearer {token}"));
            }
        }
        Ok(req)
    }

    async fn ensure_jwt(&self) -> Result<String> {
        let Credential::Password { username, password, jwt } = &self.credential else {
            unreachable!("ensure_jwt only called for password credentials");
        };
        if let Some(token) = jwt.read().await.as_ref() {
            return Ok(token.clone());
        }
        let mut guard = jwt.write().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let response = self
            .client
            .post(format!("{}/api/auth", self.base_url))
            .json(&serde_json::json!({ "Username": username, "Password": password }))
            .send()
            .await
            .map_err(|e| MaidError::OrchestratorAuth(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MaidError::OrchestratorAuth(format!("login rejected with status {}", response.status())));
        }
        let body: AuthResponseDto = response.json().await.map_err(|e| MaidError::OrchestratorAuth(e.to_string()))?;
        *guard = Some(body.jwt.clone());
        Ok(body.jwt)
    }
}

#[async_trait]
impl OrchestratorGateway for PortainerGateway {
    async fn list_stacks(&self) -> Result<Vec<Stack>> {
        let req = self.authed_request(reqwest::Method::GET, "/api/stacks").await?;
        let response = req.send().await.map_err(|e| MaidError::OrchestratorAuth(e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(MaidError::OrchestratorAuth("Portainer rejected credentials".to_string()));
        }
        let dtos: Vec<StackDto> = response
            .json()
            .await
            .map_err(|e| MaidError::Other(anyhow::anyhow!("failed to decode stack list: {e}")))?;
        Ok(dtos
            .into_iter()
            .filter_map(|d| {
                StackType::from_raw(d.stack_type).map(|stack_type| Stack {
                    id: d.id,
                    name: d.name,
                    endpoint_id: d.endpoint_id,
                    stack_type,
                })
            })
            .collect())
    }

    async fn get_manifest(&self, stack_id: i64) -> Result<Option<String>> {
        let req = self.authed_request(reqwest::Method::GET, &format!("/api/stacks/{stack_id}/file")).await?;
        let response = req.send().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MaidError::Other(anyhow::anyhow!(
                "failed to fetch manifest for stack {stack_id}: status {}",
                response.status()
            )));
        }
        // Unwrap the `{"StackFileContent": "..."}` envelope when present,
        // else treat the body as the raw manifest text.
        let text = response.text().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        match serde_json::from_str::<StackFileDto>(&text) {
            Ok(dto) => Ok(Some(dto.stack_file_content)),
            Err(_) => Ok(Some(text)),
        }
    }

    async fn get_stack_env(&self, stack_id: i64) -> Result<Vec<(String, String)>> {
        let req = self.authed_request(reqwest::Method::GET, &format!("/api/stacks/{stack_id}")).await?;
        let response = req.send().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        if !response.status().is_success() {
            return Err(MaidError::Other(anyhow::anyhow!(
                "failed to fetch stack {stack_id}: status {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct StackDetailDto {
            #[serde(rename = "Env", default)]
            env: Vec<EnvVarDto>,
        }
        let detail: StackDetailDto = response.json().await.map_err(|e| MaidError::Other(anyhow::anyhow!(e)))?;
        Ok(detail.env.into_iter().map(|e| (e.name, e.value)).collect())
    }

    async fn redeploy(&self, stack: &Stack, yaml: &str, env: &[(String, String)]) -> Result<()> {
        let path = format!(
            "/api/stacks/{}?endpointId={}&method=string&pullImage=true&recreate=always",
            stack.id, stack.endpoint_id
        );
        let req = self.authed_request(reqwest::Method::PUT, &path).await?;
        let body = serde_json::json!({
            "StackFileContent": yaml,
            "Env": env.iter().map(|(name, value)| serde_json::json!({"name": name, "value": value})).collect::<Vec<_>>(),
            "Prune": true,
        });
        let response = req.json(&body).send().await.map_err(|e| {
            MaidError::OrchestratorRedeployFailed(stack.id, e.to_string())
        })?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(MaidError::OrchestratorRedeployFailed(stack.id, format!("status {status}")));
        }
        Ok(())
    }
}
