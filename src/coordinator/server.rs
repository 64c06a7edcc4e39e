//! Controller server

use crate::common::{ControllerConfig, Result};
use crate::coordinator::session::serve_connection;
use crate::coordinator::state::Coordinator;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct Controller {
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
}

impl Controller {
    /// Validate the config and bind the listening socket. Port 0 picks a free port.
    pub async fn bind(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        Ok(Self {
            coordinator: Coordinator::new(config),
            listener,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Accept clients and dstores until the task is dropped.
    pub async fn serve(self) -> Result<()> {
        let config = self.coordinator.config();
        tracing::info!("Starting controller on port {}", self.local_port()?);
        tracing::info!("  Replication factor: {}", config.replication_factor);
        tracing::info!("  Timeout: {:?}", config.timeout());
        tracing::info!("  Rebalance period: {:?}", config.rebalance_period());

        let rebalance = self.coordinator.start_rebalance_loop();
        let result = self.accept_loop().await;
        rebalance.abort();
        result
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }
            tracing::debug!("Accepted connection from {}", peer);
            tokio::spawn(serve_connection(self.coordinator.clone(), stream, peer));
        }
    }
}
