use std::{io, net::SocketAddr, sync::Arc};

use brpc_service::{
    endpoint::ServiceEndpoint,
    manager::{ClientConfig, InvocationManager},
    registry::ServiceRegistry,
    runtime::TokioRuntime,
};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{info, warn};

use crate::channel::{ChannelConfig, TcpChannel};

/// An accepted connection. The endpoint serves the registry to the peer and
/// can also call services the peer exports.
pub struct Accepted {
    pub channel: Arc<TcpChannel>,
    pub endpoint: Arc<ServiceEndpoint>,
}

/// Exports one registry to every connection it accepts.
pub struct TcpServer {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    config: ChannelConfig,
    client_config: ClientConfig,
}

impl TcpServer {
    pub async fn bind(addr: impl ToSocketAddrs, registry: Arc<ServiceRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, services = registry.len(), "listening");

        Ok(Self {
            listener,
            registry,
            config: ChannelConfig::default(),
            client_config: ClientConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for calls the server makes back to its peers.
    pub fn with_client_config(mut self, client_config: ClientConfig) -> Self {
        self.client_config = client_config;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;

        let endpoint = Arc::new(
            ServiceEndpoint::builder()
                .runtime(TokioRuntime::current())
                .manager(InvocationManager::new(self.client_config.clone()))
                .registry(self.registry.clone())
                .build(),
        );
        let channel = TcpChannel::spawn(stream, self.config, endpoint.clone())?;
        info!(%peer, "accepted connection");

        Ok(Accepted { channel, endpoint })
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self) -> io::Result<()> {
        loop {
            match self.accept().await {
                Ok(_) => {}
                // The peer went away between accept and setup.
                Err(error) if error.kind() == io::ErrorKind::NotConnected => {
                    warn!(%error, "dropping connection");
                }
                Err(error) => return Err(error),
            }
        }
    }
}
