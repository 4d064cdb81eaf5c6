mod config;
mod engine;
mod engine_gateway;
mod errors;
mod freshness;
mod orchestrator_gateway;
mod reference;
mod scheduler;

use crate::config::MaidConfig;
use crate::engine::UpdateEngine;
use crate::engine_gateway::BollardEngineGateway;
use crate::orchestrator_gateway::PortainerGateway;
use log::{error, info};
use std::env;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Waits for Ctrl+C or SIGTERM and cancels `token`, so every in-flight
/// cycle sees the request at its next safe checkpoint instead of the
/// process being killed out from under an in-flight create/start.
async fn wait_for_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received, finishing the current housekeeping step before exiting.");
    token.cancel();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    colog::init();
    info!("Doing some checks before planning housekeeping duties...");

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    let config = match MaidConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration is invalid: {e}");
            return ExitCode::FAILURE;
        }
    };

    let engine_gateway = match BollardEngineGateway::connect() {
        Ok(g) => g,
        Err(e) => {
            error!("Unable to reach the Docker engine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator_gateway = match &config.portainer {
        Some(portainer_cfg) => match PortainerGateway::new(portainer_cfg) {
            Ok(g) => Some(Box::new(g) as Box<dyn orchestrator_gateway::OrchestratorGateway>),
            Err(e) => {
                error!("Portainer is configured but could not be initialized: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    info!(
        "Initializing with schedule `{:?}`, {} exclude pattern(s), backup retention {} day(s), orchestrator {}.",
        config.schedule,
        config.exclude_patterns.len(),
        config.backup_retention.num_days(),
        if orchestrator_gateway.is_some() { "enabled" } else { "disabled" }
    );

    let mut update_engine = UpdateEngine::new(Box::new(engine_gateway), orchestrator_gateway, &config);

    if env::var("MAID_RUN_ON_STARTUP").map(|v| v == "true").unwrap_or(false) {
        info!("MAID_RUN_ON_STARTUP is set to `true`, running housekeeping duties immediately.");
        update_engine.run_cycle(&cancel).await;
    }

    info!("House is quiet. Maid standing by.");
    while !cancel.is_cancelled() {
        let delay = scheduler::next_delay(&config.schedule, chrono::Local::now());
        info!("Next housekeeping round in {:?}.", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
        if cancel.is_cancelled() {
            break;
        }

        update_engine.run_cycle(&cancel).await;
    }

    info!("Cancellation complete, exiting cleanly.");
    ExitCode::SUCCESS
}
