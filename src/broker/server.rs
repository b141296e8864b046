//! TCP accept loop, session lifecycle, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::web;

use super::{scheduler, session, Broker};

pub struct GearServer {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl GearServer {
    /// Bind the job-protocol listener and prepare the broker. Binding
    /// separately from [`run`](Self::run) lets tests use ephemeral ports.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let broker = Arc::new(Broker::new(config)?);
        Ok(Self { broker, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// Accept connections until shutdown, then drain Running jobs within
    /// the grace window and close remaining sessions.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.broker.shutdown_token();

        let scheduler_broker = self.broker.clone();
        let scheduler_cancel = shutdown.child_token();
        tokio::spawn(async move {
            scheduler::run(scheduler_broker, scheduler_cancel).await;
        });

        if let Some(web_addr) = self.broker.config().web_addr.clone() {
            let web_broker = self.broker.clone();
            let web_cancel = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = web::serve(&web_addr, web_broker, web_cancel).await {
                    tracing::error!(addr = %web_addr, error = %e, "Web listener failed");
                }
            });
        }

        tracing::info!(
            addr = %self.listener.local_addr()?,
            "Broker listening"
        );

        let mut next_session: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            next_session += 1;
                            let id = next_session;
                            let broker = self.broker.clone();
                            tokio::spawn(async move {
                                session::run_session(broker, stream, addr, id).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("Shutting down, draining running jobs");
        let grace = self.broker.config().shutdown_grace;
        self.broker.drain(grace).await;
        self.broker.close_sessions();
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
