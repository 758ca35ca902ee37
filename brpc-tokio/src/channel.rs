use std::{
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use brpc_proto::{connection_state::ConnectionConfig, message::ServiceMessage};
use brpc_service::{
    channel::{Channel, ChannelError},
    endpoint::ServiceEndpoint,
    error::RpcError,
    runtime::Runtime,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    sync::Notify,
};
use tracing::{debug, warn};

use crate::tcp::TokioConnection;

#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Messages waiting for the writer before the channel stops being writable.
    pub outgoing_queue: NonZeroUsize,
    pub connection: ConnectionConfig,
}

#[bon::bon]
impl ChannelConfig {
    #[builder]
    pub fn new(
        #[builder(default = NonZeroUsize::new(1024).unwrap())] outgoing_queue: NonZeroUsize,
        #[builder(default)] connection: ConnectionConfig,
    ) -> Self {
        Self {
            outgoing_queue,
            connection,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::builder().build()
    }
}

/// A TCP connection driven by a reader task and a writer task.
///
/// The channel does not reconnect: once the socket is gone it stays inactive
/// and every write fails.
pub struct TcpChannel {
    outgoing: flume::Sender<ServiceMessage>,
    active: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    peer: SocketAddr,
}

impl TcpChannel {
    pub async fn connect<RT: Runtime>(
        addr: impl ToSocketAddrs,
        config: ChannelConfig,
        endpoint: Arc<ServiceEndpoint<RT>>,
    ) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        Self::spawn(stream, config, endpoint)
    }

    /// Starts serving `stream` for `endpoint`. Incoming frames are routed
    /// through the endpoint until the peer closes the connection.
    pub fn spawn<RT: Runtime>(
        stream: TcpStream,
        config: ChannelConfig,
        endpoint: Arc<ServiceEndpoint<RT>>,
    ) -> io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (mut sink, frames) =
            TokioConnection::new(config.connection, reader, writer).split();
        let (outgoing, queue) = flume::bounded(config.outgoing_queue.get());

        let channel = Arc::new(TcpChannel {
            outgoing,
            active: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            peer,
        });

        let active = channel.active.clone();
        let shutdown = channel.shutdown.clone();
        let manager = endpoint.manager().clone();
        endpoint.runtime().spawn(async move {
            'write: loop {
                let message = tokio::select! {
                    _ = shutdown.notified() => break,
                    message = queue.recv_async() => match message {
                        Ok(message) => message,
                        Err(_) => break,
                    },
                };

                // Batch whatever else is already waiting into one flush.
                for message in std::iter::once(message).chain(queue.try_iter()) {
                    let request = match &message {
                        ServiceMessage::Request(request) => Some(request.transaction_id),
                        _ => None,
                    };
                    if let Err(error) = sink.feed(message).await {
                        warn!(%peer, %error, "write failed");
                        if let Some(transaction_id) = request {
                            manager.on_client_exception(
                                transaction_id,
                                RpcError::ConnectionLost(error.to_string()),
                            );
                        }
                        break 'write;
                    }
                }
                if let Err(error) = sink.flush().await {
                    warn!(%peer, %error, "flush failed");
                    break;
                }
            }

            active.store(false, Ordering::Release);
            _ = sink.close().await;
            debug!(%peer, "writer stopped");
        });

        let reader_channel: Arc<dyn Channel> = channel.clone();
        let active = channel.active.clone();
        let shutdown = channel.shutdown.clone();
        let runtime = endpoint.runtime().clone();
        runtime.spawn(async move {
            endpoint.run(reader_channel, frames).await;
            active.store(false, Ordering::Release);
            shutdown.notify_one();
            debug!(%peer, "reader stopped");
        });

        debug!(%peer, "connection established");
        Ok(channel)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Shuts down the write side. The peer sees the connection end, and this
    /// side's endpoint is told once the peer hangs up in turn.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_active() {
            return Ok(());
        }
        Err(ChannelError::Connect(format!(
            "connection to {} is closed",
            self.peer
        )))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.outgoing.is_disconnected()
    }

    fn is_writable(&self) -> bool {
        self.is_active() && !self.outgoing.is_full()
    }

    fn write_and_flush(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        self.outgoing.try_send(message).map_err(|error| match error {
            flume::TrySendError::Full(_) => ChannelError::NotWritable,
            flume::TrySendError::Disconnected(_) => ChannelError::Closed,
        })
    }

    async fn send(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        self.outgoing
            .send_async(message)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}
