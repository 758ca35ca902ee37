use std::{io, sync::Arc};

use brpc_proto::message::ServiceMessage;
use futures::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::{
    channel::Channel,
    invocation::ServiceInvocation,
    manager::InvocationManager,
    registry::ServiceRegistry,
    runtime::{Runtime, TokioRuntime},
    stream::ActiveStreams,
};

/// Both roles of one connection: the calls this side made and the services
/// it exports. Either peer of a connection may export services.
pub struct ServiceEndpoint<RT = TokioRuntime> {
    runtime: RT,
    manager: InvocationManager,
    registry: Option<Arc<ServiceRegistry>>,
    streams: Arc<ActiveStreams>,
}

#[bon::bon]
impl<RT: Runtime> ServiceEndpoint<RT> {
    #[builder]
    pub fn new(
        runtime: RT,
        #[builder(default)] manager: InvocationManager,
        registry: Option<Arc<ServiceRegistry>>,
    ) -> Self {
        Self {
            runtime,
            manager,
            registry,
            streams: Arc::default(),
        }
    }

    pub fn runtime(&self) -> &RT {
        &self.runtime
    }

    pub fn manager(&self) -> &InvocationManager {
        &self.manager
    }

    pub fn registry(&self) -> Option<&Arc<ServiceRegistry>> {
        self.registry.as_ref()
    }

    pub fn active_streams(&self) -> &ActiveStreams {
        &self.streams
    }

    /// Routes one decoded frame. Requests are handed to the runtime; the rest
    /// only touches in-memory state and returns immediately.
    pub fn on_message(&self, channel: &Arc<dyn Channel>, message: ServiceMessage) {
        match message {
            ServiceMessage::Request(request) => {
                trace!(
                    transaction_id = request.transaction_id,
                    service = %request.service_name,
                    method = %request.method_name,
                    call = ?request.call,
                    "request received"
                );
                let invocation = ServiceInvocation::new(
                    self.registry.clone(),
                    channel.clone(),
                    request,
                    self.streams.clone(),
                );
                self.runtime.spawn(invocation.run());
            }
            ServiceMessage::Response(response) => self.manager.on_response(response),
            ServiceMessage::StreamingData(data) => self.manager.on_stream_data(data),
            ServiceMessage::StreamingEnd(end) => self.manager.on_stream_end(end),
            ServiceMessage::StreamingCancel(cancel) => {
                if self.streams.cancel(cancel.transaction_id) {
                    debug!(transaction_id = cancel.transaction_id, "stream cancelled by peer");
                } else {
                    trace!(transaction_id = cancel.transaction_id, "cancel for a finished stream");
                }
            }
        }
    }

    /// Stops every stream this side produces and fails every call it waits on.
    pub fn on_disconnect(&self, reason: &str) {
        self.streams.cancel_all();
        self.manager.on_connection_lost(reason);
    }

    /// Drives `reader` until it ends or fails.
    ///
    /// `InvalidData` errors are single malformed frames that the reader already
    /// skipped; any other error ends the connection.
    pub async fn run<S>(&self, channel: Arc<dyn Channel>, reader: S)
    where
        S: Stream<Item = io::Result<ServiceMessage>>,
    {
        let mut reader = std::pin::pin!(reader);

        let reason = loop {
            match reader.next().await {
                Some(Ok(message)) => self.on_message(&channel, message),
                Some(Err(error)) if error.kind() == io::ErrorKind::InvalidData => {
                    warn!(%error, "skipping malformed frame");
                }
                Some(Err(error)) => break error.to_string(),
                None => break "connection closed".to_string(),
            }
        };

        debug!(%reason, "connection finished");
        self.on_disconnect(&reason);
    }
}
