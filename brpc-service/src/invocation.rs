//! Runs one decoded request against the registry, off the read loop.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, atomic::AtomicBool},
    time::{SystemTime, UNIX_EPOCH},
};

use brpc_proto::{
    args::ArgsError,
    message::{ResponseBody, ServiceMessage, ServiceRequest, ServiceResponse, ServiceStreamingEnd},
};
use futures::FutureExt;
use tracing::{debug, trace, warn};

use crate::{
    channel::Channel,
    error::RpcError,
    registry::{MethodHandler, RegisteredMethod, ServiceRegistry},
    stream::{ActiveStreams, StreamTarget},
};

pub struct ServiceInvocation {
    registry: Option<Arc<ServiceRegistry>>,
    channel: Arc<dyn Channel>,
    request: ServiceRequest,
    streams: Arc<ActiveStreams>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl ServiceInvocation {
    /// Streaming requests are registered with `streams` right away, so a
    /// cancel that arrives before the invocation is scheduled still lands.
    pub fn new(
        registry: Option<Arc<ServiceRegistry>>,
        channel: Arc<dyn Channel>,
        request: ServiceRequest,
        streams: Arc<ActiveStreams>,
    ) -> Self {
        let cancelled = request
            .is_streaming()
            .then(|| streams.open(request.transaction_id));

        Self {
            registry,
            channel,
            request,
            streams,
            cancelled,
        }
    }

    pub fn request(&self) -> &ServiceRequest {
        &self.request
    }

    pub async fn run(self) {
        match self.resolve() {
            Ok(method) => self.dispatch(method).await,
            Err(error) => self.reject(error, false).await,
        }

        if self.cancelled.is_some() {
            self.streams.close(self.request.transaction_id);
        }
    }

    fn resolve(&self) -> Result<RegisteredMethod, RpcError> {
        let Some(registry) = &self.registry else {
            return Err(RpcError::BadRequest(
                "no services are exported on this connection".to_string(),
            ));
        };

        let request = &self.request;
        if request.service_name.is_empty() {
            return Err(RpcError::BadRequest("service name is missing".to_string()));
        }
        if request.method_name.is_empty() {
            return Err(RpcError::BadRequest("method name is missing".to_string()));
        }

        let method = registry
            .find_service_provider(&request.service_name, &request.method_name)
            .ok_or_else(|| {
                RpcError::BadRequest(format!(
                    "{}.{} not found",
                    request.service_name, request.method_name
                ))
            })?;

        if method.item().arity() != request.args.len() {
            return Err(ArgsError::CountMismatch {
                expected: method.item().arity(),
                actual: request.args.len(),
            }
            .into());
        }
        Ok(method.clone())
    }

    async fn dispatch(&self, method: RegisteredMethod) {
        let request = &self.request;
        let oneway = request.is_oneway() || method.item().oneway;

        match (&method.handler, &self.cancelled) {
            (MethodHandler::Unary(handler), None) => {
                let outcome = match started(|| handler(request.serializer, &request.args)) {
                    Ok(call) => guarded(call).await.and_then(|result| result),
                    Err(error) => Err(error),
                };

                if oneway {
                    if let Err(error) = outcome {
                        warn!(
                            transaction_id = request.transaction_id,
                            service = %request.service_name,
                            method = %request.method_name,
                            %error,
                            "oneway invocation failed"
                        );
                    }
                    return;
                }

                let body = match outcome {
                    Ok(Some(payload)) => ResponseBody::Returning(payload),
                    Ok(None) => ResponseBody::Void,
                    Err(error) => {
                        debug!(
                            transaction_id = request.transaction_id,
                            service = %request.service_name,
                            method = %request.method_name,
                            %error,
                            "invocation failed"
                        );
                        ResponseBody::Exception(error.to_remote())
                    }
                };
                self.respond(body).await;
            }
            (MethodHandler::Streaming(handler), Some(cancelled)) => {
                let target = StreamTarget {
                    transaction_id: request.transaction_id,
                    serializer: request.serializer,
                    channel: self.channel.clone(),
                    cancelled: cancelled.clone(),
                };
                let outcome = match started(|| handler(request.serializer, &request.args, target)) {
                    Ok(call) => guarded(call).await.and_then(|result| result),
                    Err(error) => Err(error),
                };

                let exception = match outcome {
                    Ok(()) | Err(RpcError::Cancelled) => None,
                    Err(error) => {
                        debug!(
                            transaction_id = request.transaction_id,
                            service = %request.service_name,
                            method = %request.method_name,
                            %error,
                            "stream failed"
                        );
                        Some(error.to_remote())
                    }
                };
                self.end_stream(exception).await;
            }
            (MethodHandler::Unary(_), Some(_)) => {
                let error = RpcError::BadRequest(format!(
                    "{}.{} is not a streaming method",
                    request.service_name, request.method_name
                ));
                self.reject(error, oneway).await;
            }
            (MethodHandler::Streaming(_), None) => {
                let error = RpcError::BadRequest(format!(
                    "{}.{} is a streaming method",
                    request.service_name, request.method_name
                ));
                self.reject(error, oneway).await;
            }
        }
    }

    /// Reports a request that never reached its handler.
    async fn reject(&self, error: RpcError, oneway: bool) {
        let request = &self.request;
        if self.cancelled.is_some() {
            self.end_stream(Some(error.to_remote())).await;
        } else if oneway || request.is_oneway() {
            warn!(
                transaction_id = request.transaction_id,
                service = %request.service_name,
                method = %request.method_name,
                %error,
                "dropping oneway request"
            );
        } else {
            debug!(
                transaction_id = request.transaction_id,
                service = %request.service_name,
                method = %request.method_name,
                %error,
                "rejecting request"
            );
            self.respond(ResponseBody::Exception(error.to_remote())).await;
        }
    }

    async fn respond(&self, body: ResponseBody) {
        let response = ServiceMessage::Response(ServiceResponse {
            transaction_id: self.request.transaction_id,
            server_response_at: now_millis(),
            body,
        });
        self.write(response).await;
    }

    async fn end_stream(&self, exception: Option<String>) {
        let end = ServiceMessage::StreamingEnd(ServiceStreamingEnd {
            transaction_id: self.request.transaction_id,
            exception,
        });
        self.write(end).await;
    }

    async fn write(&self, message: ServiceMessage) {
        let transaction_id = message.transaction_id();
        match self.channel.send(message).await {
            Ok(()) => trace!(transaction_id, "answer written"),
            Err(error) => debug!(transaction_id, %error, "could not write answer"),
        }
    }
}

/// Starts a handler call. The closure runs user code before the first
/// await, so a panic there is an invocation failure too.
fn started<T>(start: impl FnOnce() -> Result<T, RpcError>) -> Result<T, RpcError> {
    std::panic::catch_unwind(AssertUnwindSafe(start))
        .map_err(|panic| RpcError::invocation(panic_message(&*panic)))
        .and_then(|result| result)
}

/// Turns a panicking handler into an invocation failure.
async fn guarded<F: Future>(call: F) -> Result<F::Output, RpcError> {
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .map_err(|panic| RpcError::invocation(panic_message(&*panic)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use brpc_proto::{
        args::Args,
        message::{CallKind, Payload, ServiceStreamingData},
        serializer::SerializerId,
    };

    use super::*;
    use crate::{
        interface::{MethodConfig, ServiceInterface},
        registry::ServiceDefinition,
        stream::StreamSink,
        testing::RecordingChannel,
    };

    fn registry() -> Arc<ServiceRegistry> {
        let interface = ServiceInterface::builder()
            .name("Agent")
            .methods(vec![MethodConfig::builder().name("log").oneway(true).build()])
            .build();

        let definition = ServiceDefinition::new(interface)
            .unary("echo", |(message,): (String,)| async move { Ok(message) })
            .unary("fail", |(): ()| async {
                Err::<(), _>(RpcError::invocation("disk full"))
            })
            .unary("panic", |(code,): (u32,)| async move {
                if code > 0 {
                    panic!("handler blew up");
                }
                Ok(code)
            })
            .unary("eager", |(code,): (u32,)| {
                if code > 0 {
                    panic!("rejected before starting");
                }
                async move { Ok(code) }
            })
            .streaming("eager_stream", |(code,): (u32,), sink: StreamSink<u32>| {
                if code > 0 {
                    panic!("stream rejected before starting");
                }
                async move { sink.send(&code).await }
            })
            .unary("log", |(_line,): (String,)| async {
                Err::<(), _>(RpcError::invocation("ignored"))
            })
            .streaming("count", |(to,): (u32,), sink: StreamSink<u32>| async move {
                for item in 1..=to {
                    sink.send(&item).await?;
                }
                Ok(())
            })
            .streaming("broken", |(): (), sink: StreamSink<u32>| async move {
                sink.send(&1).await?;
                Err(RpcError::invocation("profiler crashed"))
            });

        let mut registry = ServiceRegistry::new();
        registry.add_definition(definition).unwrap();
        Arc::new(registry)
    }

    fn request<A: Args>(method: &str, call: CallKind, args: A) -> ServiceRequest {
        ServiceRequest {
            transaction_id: 7,
            service_name: "Agent".to_string(),
            method_name: method.to_string(),
            app_name: None,
            serializer: SerializerId::JSON,
            args: args.encode(SerializerId::JSON).unwrap(),
            call,
        }
    }

    async fn run(request: ServiceRequest) -> Vec<ServiceMessage> {
        let channel = Arc::new(RecordingChannel::default());
        let streams = Arc::new(ActiveStreams::default());
        ServiceInvocation::new(Some(registry()), channel.clone(), request, streams.clone())
            .run()
            .await;
        assert!(streams.is_empty());
        channel.sent()
    }

    fn exception(messages: &[ServiceMessage]) -> &str {
        match messages {
            [ServiceMessage::Response(response)] => response.exception().unwrap(),
            [ServiceMessage::StreamingEnd(end)] => end.exception.as_deref().unwrap(),
            other => panic!("expected one failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn returns_value_with_request_serializer() {
        let mut echo = request("echo", CallKind::Unary, ("hi".to_string(),));
        echo.serializer = SerializerId::BINCODE;
        echo.args = ("hi".to_string(),).encode(SerializerId::BINCODE).unwrap();

        let sent = run(echo).await;
        let [ServiceMessage::Response(response)] = sent.as_slice() else {
            panic!("expected one response, got {sent:?}");
        };
        assert_eq!(response.transaction_id, 7);
        let payload = response.returning().unwrap();
        assert_eq!(payload.serializer, SerializerId::BINCODE);
        assert_eq!(payload.decode::<String>().unwrap(), "hi");
    }

    #[tokio::test]
    async fn validation_failures_are_bad_requests() {
        let mut nameless = request("echo", CallKind::Unary, ("hi".to_string(),));
        nameless.service_name.clear();
        assert_eq!(exception(&run(nameless).await), "bad request: service name is missing");

        let mut no_method = request("echo", CallKind::Unary, ());
        no_method.method_name.clear();
        assert_eq!(exception(&run(no_method).await), "bad request: method name is missing");

        let unknown = request("reboot", CallKind::Unary, ());
        assert_eq!(exception(&run(unknown).await), "bad request: Agent.reboot not found");

        let arity = request("echo", CallKind::Unary, ());
        assert_eq!(
            exception(&run(arity).await),
            "bad request: expected 1 arguments, got 0"
        );

        let wrong_type = request("echo", CallKind::Unary, (12u32,));
        assert!(exception(&run(wrong_type).await).starts_with("bad request: argument 0"));
    }

    #[tokio::test]
    async fn handler_failures_carry_the_message() {
        assert_eq!(exception(&run(request("fail", CallKind::Unary, ())).await), "disk full");
        assert_eq!(
            exception(&run(request("panic", CallKind::Unary, (1u32,))).await),
            "handler blew up"
        );
    }

    #[tokio::test]
    async fn panic_before_the_future_is_answered() {
        assert_eq!(
            exception(&run(request("eager", CallKind::Unary, (1u32,))).await),
            "rejected before starting"
        );
        assert_eq!(
            exception(&run(request("eager_stream", CallKind::Streaming, (1u32,))).await),
            "stream rejected before starting"
        );

        let sent = run(request("eager", CallKind::Unary, (0u32,))).await;
        let [ServiceMessage::Response(response)] = sent.as_slice() else {
            panic!("expected one response, got {sent:?}");
        };
        assert_eq!(response.returning().unwrap().decode::<u32>().unwrap(), 0);
    }

    #[tokio::test]
    async fn void_result_has_no_payload() {
        let interface = ServiceInterface::builder().name("Agent").build();
        let definition = ServiceDefinition::new(interface).unary("ping", |(): ()| async { Ok(()) });
        let mut registry = ServiceRegistry::new();
        registry.add_definition(definition).unwrap();

        let channel = Arc::new(RecordingChannel::default());
        ServiceInvocation::new(
            Some(Arc::new(registry)),
            channel.clone(),
            request("ping", CallKind::Unary, ()),
            Arc::default(),
        )
        .run()
        .await;

        let sent = channel.sent();
        let [ServiceMessage::Response(response)] = sent.as_slice() else {
            panic!("expected one response, got {sent:?}");
        };
        assert_eq!(response.body, ResponseBody::Void);
    }

    #[tokio::test]
    async fn oneway_never_answers() {
        assert!(run(request("fail", CallKind::Oneway, ())).await.is_empty());
        assert!(run(request("reboot", CallKind::Oneway, ())).await.is_empty());
        // Oneway by registration, even though the caller waits.
        assert!(run(request("log", CallKind::Unary, ("x".to_string(),))).await.is_empty());
    }

    #[tokio::test]
    async fn stream_items_then_end() {
        let sent = run(request("count", CallKind::Streaming, (3u32,))).await;

        let items: Vec<u32> = sent
            .iter()
            .filter_map(|message| match message {
                ServiceMessage::StreamingData(data) => Some(data.payload.decode().unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(
            sent.last(),
            Some(&ServiceMessage::StreamingEnd(ServiceStreamingEnd {
                transaction_id: 7,
                exception: None,
            }))
        );
    }

    #[tokio::test]
    async fn failing_stream_ends_with_exception() {
        let sent = run(request("broken", CallKind::Streaming, ())).await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[0],
            ServiceMessage::StreamingData(ServiceStreamingData {
                payload: Payload { .. },
                ..
            })
        ));
        assert_eq!(exception(&sent[1..]), "profiler crashed");
    }

    #[tokio::test]
    async fn call_kind_must_match_method() {
        let sent = run(request("echo", CallKind::Streaming, ("hi".to_string(),))).await;
        assert_eq!(exception(&sent), "bad request: Agent.echo is not a streaming method");

        let sent = run(request("count", CallKind::Unary, (3u32,))).await;
        assert_eq!(exception(&sent), "bad request: Agent.count is a streaming method");
    }

    #[tokio::test]
    async fn cancelled_stream_ends_normally() {
        let channel = Arc::new(RecordingChannel::default());
        let streams = Arc::new(ActiveStreams::default());
        let invocation = ServiceInvocation::new(
            Some(registry()),
            channel.clone(),
            request("count", CallKind::Streaming, (1000u32,)),
            streams.clone(),
        );

        // The cancel lands before the handler runs.
        assert!(streams.cancel(7));
        invocation.run().await;

        assert!(!streams.cancel(7));
        assert_eq!(
            channel.sent(),
            vec![ServiceMessage::StreamingEnd(ServiceStreamingEnd {
                transaction_id: 7,
                exception: None,
            })]
        );
    }

    #[tokio::test]
    async fn no_registry_is_a_bad_request() {
        let channel = Arc::new(RecordingChannel::default());
        let streams = Arc::new(ActiveStreams::default());
        let cancelled = streams.clone();
        ServiceInvocation::new(None, channel.clone(), request("echo", CallKind::Unary, ()), streams)
            .run()
            .await;

        assert!(cancelled.is_empty());
        assert!(exception(&channel.sent()).contains("no services are exported"));
    }
}
