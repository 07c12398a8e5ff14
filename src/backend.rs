//! Backend module for pushgate
//!
//! This module handles taking in a configuration, wiring up shared state,
//! and running the web service until shutdown.

use crate::authority::CloudAuthorityProvider;
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::web::{AppState, build_router};
use eyre::Result;
use futures::future::select_all;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Manages the lifecycle of background services (tasks)
struct ServiceManager {
    handles: Vec<JoinHandle<()>>,
}

impl ServiceManager {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    /// Aborts all managed tasks.
    fn shutdown(&self) {
        tracing::info!("Aborting all service tasks...");
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Waits for any of the managed services to complete.
    /// This is useful for detecting unexpected shutdowns.
    async fn wait_for_any_completion(&mut self) {
        if self.handles.is_empty() {
            // If there are no tasks, wait indefinitely.
            std::future::pending::<()>().await;
            return;
        }
        let (result, index, _) = select_all(self.handles.iter_mut()).await;
        tracing::warn!("Service task at index {} completed unexpectedly.", index);
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("The task panicked!");
            }
        }
    }
}

/// Represents the actual backend service
pub struct Backend {
    state: Arc<AppState>,
    service_manager: ServiceManager,
}

impl Backend {
    /// Create a new backend from configuration. The event bus is created
    /// here and owned through `AppState`; the webhook receiver and every
    /// live session share this one instance.
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(AppState {
            bus: Arc::new(EventBus::new()),
            config: config.clone(),
            authority: Arc::new(CloudAuthorityProvider::new(config)),
        });
        Self {
            state,
            service_manager: ServiceManager::new(),
        }
    }

    /// Spawn a service task with automatic management
    fn spawn_service<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("Spawning service: {}", name);
        self.service_manager.spawn(future);
    }

    /// Start all configured backend services
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("Starting backend services...");

        if self.state.config.monitor.public_url.trim().is_empty() {
            tracing::warn!(
                "No public webhook url configured; cloud monitors cannot be created. \
                 Set monitor.public_url or PUSHGATE_PUBLIC_URL."
            );
        }

        self.start_web_service();

        tracing::info!("All backend services started successfully");
        Ok(())
    }

    /// Start the web service (webhook + live sessions + device API)
    fn start_web_service(&mut self) {
        let bind_addr_str = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        tracing::info!("Starting web service on {bind_addr_str}");

        let state = self.state.clone();
        self.spawn_service("web_service", async move {
            match bind_addr_str.parse::<SocketAddr>() {
                Ok(bind_addr) => {
                    let router = build_router(state);
                    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!("Failed to bind {bind_addr}: {e}");
                            return;
                        }
                    };
                    if let Err(e) = axum::serve(
                        listener,
                        router.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .await
                    {
                        tracing::error!("Web service error: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Invalid web service address: {}", e);
                }
            }
        });
    }

    /// Wait for all services to complete or handle shutdown
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        tracing::info!("Waiting for shutdown signal...");

        tokio::select! {
            signal_result = tokio::signal::ctrl_c() => {
                match signal_result {
                    Ok(_) => tracing::info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
                }
            }
            _ = self.service_manager.wait_for_any_completion() => {
                tracing::warn!("One or more services completed unexpectedly, shutting down...");
            }
        }

        self.shutdown().await?;
        Ok(())
    }

    /// Gracefully shutdown all services
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down backend services...");
        self.service_manager.shutdown();
        tracing::info!("Backend shutdown complete");
        Ok(())
    }
}

/// Convenience function to create and start a backend from configuration
pub async fn setup_and_run_backend(config: AppConfig) -> Result<()> {
    let mut backend = Backend::new(config);
    backend.start().await?;
    backend.wait_for_shutdown().await?;
    Ok(())
}
