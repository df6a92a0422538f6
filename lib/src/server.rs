//! Server entry points
//!
//! The agent speaks JSON-RPC over stdio, over an in-process duplex pipe, or
//! over WebSocket connections. Each stream gets its own [`Agent`] session.

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::connection::ExitReason;
use crate::error::{AgentError, Result};
use crate::extension::Extension;
use crate::transport::{stream_transport, websocket_transport};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Buffer size of each direction of the in-process pipe
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Hosts agent sessions for one extension
pub struct AgentServer {
    config: AgentConfig,
    extension: Arc<dyn Extension>,
}

impl AgentServer {
    pub fn new(config: AgentConfig, extension: Arc<dyn Extension>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, extension })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn new_session(&self) -> Result<Arc<Agent>> {
        Agent::new(self.config.clone(), Arc::clone(&self.extension))
    }

    /// Serve one session on stdin/stdout
    pub async fn start_stdio(&self) -> Result<ExitReason> {
        info!("Starting agent on stdio");
        self.start_with_streams(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve one session on stdio, stopping early on SIGINT or SIGTERM
    pub async fn start_with_shutdown(&self) -> Result<ExitReason> {
        tokio::select! {
            result = self.start_stdio() => {
                info!("Session ended: {:?}", result);
                result
            }
            result = wait_for_shutdown_signal() => {
                result?;
                info!("Received shutdown signal, stopping agent");
                Ok(ExitReason::Requested)
            }
        }
    }

    /// Serve one session on an arbitrary byte stream pair
    pub async fn start_with_streams<R, W>(&self, reader: R, writer: W) -> Result<ExitReason>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let agent = self.new_session()?;
        let (source, sink) = stream_transport(reader, writer, self.config.server.framing);
        let reason = agent.run(source, sink).await;
        info!("Agent session finished: {:?}", reason);
        Ok(reason)
    }

    /// Run a session on a background task, returning the client end of the pipe
    ///
    /// The returned stream uses the configured framing.
    pub fn spawn_in_process(&self) -> Result<(DuplexStream, JoinHandle<ExitReason>)> {
        let agent = self.new_session()?;
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let (reader, writer) = tokio::io::split(server);
        let (source, sink) = stream_transport(reader, writer, self.config.server.framing);
        let handle = tokio::spawn(async move { agent.run(source, sink).await });
        Ok((client, handle))
    }

    /// Accept WebSocket clients until a shutdown signal arrives
    ///
    /// Every connection is an independent session; one failing does not
    /// affect the others.
    pub async fn serve_websocket(&self, listener: TcpListener) -> Result<()> {
        match listener.local_addr() {
            Ok(address) => info!("Listening for WebSocket clients on {}", address),
            Err(e) => warn!("WebSocket listener has no local address: {}", e),
        }

        let shutdown = wait_for_shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                result = &mut shutdown => {
                    result?;
                    info!("Received shutdown signal, no longer accepting clients");
                    return Ok(());
                }
            };

            let agent = match self.new_session() {
                Ok(agent) => agent,
                Err(e) => {
                    error!("Could not create a session for {}: {}", peer, e);
                    continue;
                }
            };
            tokio::spawn(async move {
                let socket = match tokio_tungstenite::accept_async(stream).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("WebSocket handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                info!("Client {} connected", peer);
                let (source, sink) = websocket_transport(socket);
                let reason = agent.run(source, sink).await;
                info!("Client {} disconnected: {:?}", peer, reason);
            });
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(AgentError::Io)?;
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(AgentError::Io)?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(AgentError::Io)?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
