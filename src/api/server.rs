//! REST API Server

use super::rest::RestRouter;
use crate::driver::BlockDeviceDriver;
use crate::error::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

/// REST server over one driver
pub struct ApiServer {
    config: ApiServerConfig,
    driver: Arc<BlockDeviceDriver>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, driver: Arc<BlockDeviceDriver>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            driver,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve on `listener` until `signal` fires or [`shutdown`](Self::shutdown) is called
    pub async fn serve(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        let app = RestRouter::new(self.driver.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(%addr, "REST API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal => {}
                    _ = shutdown_rx.recv() => {}
                }
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
