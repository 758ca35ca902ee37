//! Client side of the call protocol.
//!
//! Every call that expects an answer gets an entry in the correlation table,
//! keyed by its transaction id, holding a one-shot slot for the response. The
//! read loop completes the slot; the caller waits on it with a timeout and
//! always removes its own entry afterwards, so late responses find nothing and
//! are dropped.

use std::{
    any::type_name,
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use brpc_proto::{
    args::Args,
    message::{
        CallKind, ResponseBody, ServiceMessage, ServiceRequest, ServiceResponse,
        ServiceStreamingData, ServiceStreamingEnd,
    },
    serializer::decode_returning,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::{
    channel::Channel,
    error::RpcError,
    interface::MethodDescriptor,
    stream::{StreamControl, StreamFrame, StreamHandle, StreamShared},
};

pub const DEFAULT_TRANSACTION_ID_SEED: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_timeout: Duration,
    /// Data frames queued per stream before the stream is failed.
    pub stream_buffer: NonZeroUsize,
    pub transaction_id_seed: u64,
    pub app_name: Option<String>,
}

#[bon::bon]
impl ClientConfig {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_secs(3))] default_timeout: Duration,
        #[builder(default = NonZeroUsize::new(1024).unwrap())] stream_buffer: NonZeroUsize,
        #[builder(default = DEFAULT_TRANSACTION_ID_SEED)] transaction_id_seed: u64,
        #[builder(into)] app_name: Option<String>,
    ) -> Self {
        Self {
            default_timeout,
            stream_buffer,
            transaction_id_seed,
            app_name,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::builder().build()
    }
}

struct InflightRequest {
    request_at: Instant,
    service: String,
    method: String,
    return_type: &'static str,
    slot: oneshot::Sender<Result<ServiceResponse, RpcError>>,
}

struct InflightStream {
    service: String,
    method: String,
    frames: flume::Sender<StreamFrame>,
    shared: Arc<StreamShared>,
}

enum Inflight {
    Call(InflightRequest),
    Stream(InflightStream),
}

struct ManagerInner {
    config: ClientConfig,
    next_transaction_id: AtomicU64,
    inflight: Mutex<HashMap<u64, Inflight>>,
}

/// Correlates requests with responses for one connection. Cheap to clone.
#[derive(Clone)]
pub struct InvocationManager {
    inner: Arc<ManagerInner>,
}

impl Default for InvocationManager {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl InvocationManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                next_transaction_id: AtomicU64::new(config.transaction_id_seed),
                config,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn next_transaction_id(&self) -> u64 {
        self.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    pub fn is_inflight(&self, transaction_id: u64) -> bool {
        self.inner.inflight.lock().contains_key(&transaction_id)
    }

    /// Sends one call and waits up to `timeout` for its response.
    ///
    /// Oneway methods return as soon as the request is queued; their return
    /// type must decode from "no value", i.e. `()` or an `Option`.
    pub async fn invoke<A, R>(
        &self,
        channel: &dyn Channel,
        timeout: Duration,
        method: &MethodDescriptor,
        args: A,
    ) -> Result<R, RpcError>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let encoded = args.encode(method.serializer)?;
        ensure_writable(channel).await?;

        let transaction_id = self.next_transaction_id();

        if method.oneway {
            let unit = decode_returning(None).map_err(|_| {
                RpcError::Client(format!(
                    "oneway method {}.{} cannot return {}",
                    method.service_name,
                    method.method_name,
                    type_name::<R>()
                ))
            })?;
            let request = self.request(transaction_id, method, encoded, CallKind::Oneway);
            channel.write_and_flush(ServiceMessage::Request(request))?;
            trace!(
                transaction_id,
                service = %method.service_name,
                method = %method.wire_name,
                "oneway request sent"
            );
            return Ok(unit);
        }

        let (slot, response) = oneshot::channel();
        self.inner.inflight.lock().insert(
            transaction_id,
            Inflight::Call(InflightRequest {
                request_at: Instant::now(),
                service: method.service_name.clone(),
                method: method.wire_name.clone(),
                return_type: type_name::<R>(),
                slot,
            }),
        );

        // Removes the entry on every exit, including the caller dropping this
        // future while it waits.
        let _inflight = InflightGuard {
            manager: self,
            transaction_id,
        };

        let request = self.request(transaction_id, method, encoded, CallKind::Unary);
        channel.write_and_flush(ServiceMessage::Request(request))?;

        let outcome = tokio::time::timeout(timeout, response).await;

        let response = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RpcError::ConnectionLost(
                    "call was dropped before it completed".to_string(),
                ));
            }
            Err(_) => {
                debug!(
                    transaction_id,
                    service = %method.service_name,
                    method = %method.wire_name,
                    ?timeout,
                    "call timed out"
                );
                return Err(RpcError::Timeout {
                    service: method.service_name.clone(),
                    method: method.method_name.clone(),
                    timeout,
                });
            }
        };

        match response.body {
            ResponseBody::Exception(exception) => Err(RpcError::Invocation(exception)),
            ResponseBody::Returning(payload) => Ok(payload.decode()?),
            ResponseBody::Void => Ok(decode_returning(None)?),
        }
    }

    /// Opens a server stream. The correlation entry lives until the end frame
    /// arrives, the connection drops or the handle is dropped.
    pub async fn invoke_streaming<A, T>(
        &self,
        channel: Arc<dyn Channel>,
        method: &MethodDescriptor,
        args: A,
    ) -> Result<StreamHandle<T>, RpcError>
    where
        A: Args,
        T: DeserializeOwned,
    {
        let encoded = args.encode(method.serializer)?;
        ensure_writable(channel.as_ref()).await?;

        let transaction_id = self.next_transaction_id();
        // One slot more than the data limit so the end frame always fits.
        let (frames, receiver) = flume::bounded(self.inner.config.stream_buffer.get() + 1);
        let shared = Arc::new(StreamShared::default());

        self.inner.inflight.lock().insert(
            transaction_id,
            Inflight::Stream(InflightStream {
                service: method.service_name.clone(),
                method: method.wire_name.clone(),
                frames,
                shared: shared.clone(),
            }),
        );

        let request = self.request(transaction_id, method, encoded, CallKind::Streaming);
        if let Err(error) = channel.write_and_flush(ServiceMessage::Request(request)) {
            self.release(transaction_id);
            return Err(error.into());
        }
        debug!(
            transaction_id,
            service = %method.service_name,
            method = %method.wire_name,
            "stream opened"
        );

        Ok(StreamHandle::new(
            StreamControl::new(transaction_id, channel, shared),
            receiver,
            self.clone(),
        ))
    }

    /// Completes the call waiting for this response. Responses nobody waits
    /// for any more are dropped.
    pub fn on_response(&self, response: ServiceResponse) {
        let transaction_id = response.transaction_id;
        match self.take(transaction_id) {
            None => trace!(transaction_id, "dropping response without a waiting call"),
            Some(Inflight::Call(call)) => {
                trace!(
                    transaction_id,
                    service = %call.service,
                    method = %call.method,
                    return_type = call.return_type,
                    elapsed = ?call.request_at.elapsed(),
                    "response received"
                );
                _ = call.slot.send(Ok(response));
            }
            Some(Inflight::Stream(stream)) => {
                // A stream request that was rejected before it started.
                let exception = match response.body {
                    ResponseBody::Exception(exception) => Some(exception),
                    _ => None,
                };
                _ = stream.frames.try_send(StreamFrame::End(exception));
            }
        }
    }

    pub fn on_stream_data(&self, data: ServiceStreamingData) {
        let transaction_id = data.transaction_id;
        let mut inflight = self.inner.inflight.lock();

        let Some(Inflight::Stream(stream)) = inflight.get(&transaction_id) else {
            trace!(transaction_id, "dropping data for an unknown stream");
            return;
        };

        if stream.frames.len() >= self.inner.config.stream_buffer.get() {
            if let Some(Inflight::Stream(stream)) = inflight.remove(&transaction_id) {
                warn!(
                    transaction_id,
                    service = %stream.service,
                    method = %stream.method,
                    "stream consumer fell behind, failing the stream"
                );
                stream.shared.fail(RpcError::Client(format!(
                    "stream buffer of {} frames overflowed",
                    self.inner.config.stream_buffer
                )));
            }
            return;
        }

        if stream.frames.try_send(StreamFrame::Data(data.payload)).is_err() {
            inflight.remove(&transaction_id);
        }
    }

    pub fn on_stream_end(&self, end: ServiceStreamingEnd) {
        let transaction_id = end.transaction_id;
        match self.take(transaction_id) {
            Some(Inflight::Stream(stream)) => {
                debug!(
                    transaction_id,
                    service = %stream.service,
                    method = %stream.method,
                    failed = end.exception.is_some(),
                    "stream ended"
                );
                _ = stream.frames.try_send(StreamFrame::End(end.exception));
            }
            Some(Inflight::Call(call)) => {
                _ = call.slot.send(Err(RpcError::Invocation(
                    end.exception
                        .unwrap_or_else(|| "unexpected end of stream".to_string()),
                )));
            }
            None => trace!(transaction_id, "dropping end for an unknown stream"),
        }
    }

    /// Fails one waiting call or stream because the transport broke before
    /// its answer arrived.
    pub fn on_client_exception(&self, transaction_id: u64, error: RpcError) {
        match self.take(transaction_id) {
            Some(Inflight::Call(call)) => _ = call.slot.send(Err(error)),
            Some(Inflight::Stream(stream)) => stream.shared.fail(error),
            None => trace!(transaction_id, %error, "no call to fail"),
        }
    }

    /// Fails everything still waiting on this connection.
    pub fn on_connection_lost(&self, reason: &str) {
        let drained: Vec<(u64, Inflight)> = self.inner.inflight.lock().drain().collect();
        if !drained.is_empty() {
            debug!(reason, pending = drained.len(), "failing pending calls");
        }

        for (_, entry) in drained {
            let error = RpcError::ConnectionLost(reason.to_string());
            match entry {
                Inflight::Call(call) => _ = call.slot.send(Err(error)),
                Inflight::Stream(stream) => stream.shared.fail(error),
            }
        }
    }

    /// Forgets a call or stream without completing it.
    pub(crate) fn release(&self, transaction_id: u64) {
        self.take(transaction_id);
    }

    fn take(&self, transaction_id: u64) -> Option<Inflight> {
        self.inner.inflight.lock().remove(&transaction_id)
    }

    fn request(
        &self,
        transaction_id: u64,
        method: &MethodDescriptor,
        args: Vec<bytes::Bytes>,
        call: CallKind,
    ) -> ServiceRequest {
        ServiceRequest {
            transaction_id,
            service_name: method.service_name.clone(),
            method_name: method.wire_name.clone(),
            app_name: self.inner.config.app_name.clone(),
            serializer: method.serializer,
            args,
            call,
        }
    }
}

struct InflightGuard<'a> {
    manager: &'a InvocationManager,
    transaction_id: u64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.transaction_id);
    }
}

async fn ensure_writable(channel: &dyn Channel) -> Result<(), RpcError> {
    if !channel.is_active() {
        channel.connect().await?;
    }
    if !channel.is_active() {
        return Err(RpcError::Client("channel is not active".to_string()));
    }
    if !channel.is_writable() {
        return Err(RpcError::Client("channel is not writable".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{interface::ServiceInterface, testing::RecordingChannel};

    use super::*;

    fn descriptor(method: &str) -> MethodDescriptor {
        ServiceInterface::builder()
            .name("Agent")
            .methods(vec![
                crate::interface::MethodConfig::builder()
                    .name("log")
                    .oneway(true)
                    .build(),
            ])
            .build()
            .resolve(method)
    }

    #[tokio::test]
    async fn abandoned_call_leaves_no_entry() {
        let manager = InvocationManager::default();
        let channel = RecordingChannel::default();

        let pid = descriptor("pid");
        let call = manager.invoke::<_, u32>(
            &channel,
            Duration::from_secs(30),
            &pid,
            (),
        );
        let outcome = tokio::time::timeout(Duration::from_millis(20), call).await;

        assert!(outcome.is_err());
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(manager.inflight_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_completes_a_waiting_call() {
        let manager = InvocationManager::default();
        let channel = Arc::new(RecordingChannel::default());

        let call = tokio::spawn({
            let manager = manager.clone();
            let channel = channel.clone();
            async move {
                manager
                    .invoke::<_, u32>(channel.as_ref(), Duration::from_secs(30), &descriptor("pid"), ())
                    .await
            }
        });

        let transaction_id = loop {
            if let Some(ServiceMessage::Request(request)) = channel.sent().first() {
                break request.transaction_id;
            }
            tokio::task::yield_now().await;
        };
        assert!(manager.is_inflight(transaction_id));

        manager.on_client_exception(
            transaction_id,
            RpcError::ConnectionLost("write failed".to_string()),
        );

        let error = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(error, RpcError::ConnectionLost(_)), "{error}");
        assert_eq!(manager.inflight_count(), 0);

        // Nobody waits for it any more.
        manager.on_client_exception(transaction_id, RpcError::Cancelled);
    }

    #[tokio::test]
    async fn full_channel_fails_fast() {
        let manager = InvocationManager::default();
        let channel = RecordingChannel::default();
        channel.set_full(true);

        let error = manager
            .invoke::<_, u32>(&channel, Duration::from_secs(30), &descriptor("pid"), ())
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "client error: channel is not writable");
        assert!(channel.sent().is_empty());
        assert_eq!(manager.inflight_count(), 0);

        channel.set_full(false);
        channel.close();
        let error = manager
            .invoke::<_, u32>(&channel, Duration::from_secs(30), &descriptor("pid"), ())
            .await
            .unwrap_err();
        assert!(matches!(error, RpcError::Client(_)), "{error}");
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn oneway_with_a_return_value_is_not_sent() {
        let manager = InvocationManager::default();
        let channel = RecordingChannel::default();

        let error = manager
            .invoke::<_, u32>(&channel, Duration::from_secs(1), &descriptor("log"), ("x".to_string(),))
            .await
            .unwrap_err();
        assert!(matches!(error, RpcError::Client(_)), "{error}");
        assert!(channel.sent().is_empty());

        manager
            .invoke::<_, ()>(&channel, Duration::from_secs(1), &descriptor("log"), ("x".to_string(),))
            .await
            .unwrap();
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(manager.inflight_count(), 0);
    }
}
