//! Application server
//!
//! Startup wiring and graceful shutdown.

use crate::{
    config::Settings,
    server::{routes, state::AppState},
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::signal;

pub struct App {
    settings: Settings,
    state: AppState,
}

impl App {
    /// Build state, restore and register credentials, start the monitor
    pub async fn new(settings: Settings) -> Result<Self> {
        tracing::debug!("Initializing application state");
        let state = AppState::new(settings.clone()).await?;
        state.bootstrap().await?;

        state.monitor.start();

        Ok(Self { settings, state })
    }

    /// Serve until SIGINT/SIGTERM, then stop the monitor and flush records
    pub async fn run_with_graceful_shutdown(self) -> Result<()> {
        let addr = self
            .settings
            .server_addr()
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}", self.settings.server_addr()))?;
        let router = routes::create_router(self.state.clone());

        tracing::info!("Starting server on {} with graceful shutdown enabled", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        tracing::info!("Cleaning up application resources");
        self.state.monitor.stop().await;

        match self.state.pool.persist().await {
            Ok(count) => tracing::info!(records = count, "Flushed credential records"),
            Err(e) => tracing::error!(error = %e, "Failed to flush credential records"),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_starts_monitor_and_cleans_up() {
        let mut settings = Settings::default();
        settings.upstream.api_keys = vec!["sk-or-app-test-key-0000001".to_string()];

        let app = App::new(settings).await.unwrap();
        assert!(app.state().monitor.is_running());
        assert_eq!(app.state().pool.len(), 1);

        app.cleanup().await;
        assert!(!app.state().monitor.is_running());
    }
}
