//! Crate-wide error taxonomy, per the policy table in the update engine
//! design: only `ConfigInvalid` and `EngineUnavailable` are fatal, every
//! other kind is scoped to the smallest unit (one container, one stack,
//! one image) by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaidError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("docker engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("transient engine error: {0}")]
    EngineTransient(String),

    #[error("pull failed: {0}")]
    PullFailed(String),

    #[error("backup tagging failed: {0}")]
    BackupTagFailed(String),

    #[error("create or start failed: {0}")]
    CreateOrStartFailed(String),

    #[error("health probe failed: {0}")]
    HealthFailed(String),

    #[error("orchestrator authentication failed: {0}")]
    OrchestratorAuth(String),

    #[error("orchestrator stack file missing for stack {0}")]
    OrchestratorStackFileMissing(i64),

    #[error("orchestrator redeploy failed for stack {0}: {1}")]
    OrchestratorRedeployFailed(i64, String),

    #[error("image delete failed: {0}")]
    DeleteImageFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MaidError>;
