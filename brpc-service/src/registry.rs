//! Server-side dispatch table.
//!
//! A service is exported by building a [`ServiceDefinition`]: its interface
//! plus one typed closure per method. Registration turns each closure into a
//! handler that decodes the argument tuple and encodes the result, keyed by
//! `(service, wire method)`.

use std::{
    any::type_name,
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::Arc,
};

use brpc_proto::{
    args::Args,
    message::{MessageType, Payload},
    serializer::{SerializerId, encode_returning},
};
use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::{
    error::{RegistryError, RpcError},
    interface::ServiceInterface,
    stream::{StreamSink, StreamTarget},
};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Decodes the arguments and starts the call. Failing to decode is reported
/// before anything runs.
pub(crate) type UnaryHandler = Arc<
    dyn Fn(SerializerId, &[Bytes]) -> Result<BoxFuture<Result<Option<Payload>, RpcError>>, RpcError>
        + Send
        + Sync,
>;

pub(crate) type StreamingHandler = Arc<
    dyn Fn(SerializerId, &[Bytes], StreamTarget) -> Result<BoxFuture<Result<(), RpcError>>, RpcError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) enum MethodHandler {
    Unary(UnaryHandler),
    Streaming(StreamingHandler),
}

/// What the registry knows about one exported method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistryItem {
    pub service_name: String,
    /// Name the method is called by on the wire.
    pub method_name: String,
    pub oneway: bool,
    pub streaming: bool,
    pub serializer: SerializerId,
    pub parameter_types: Vec<&'static str>,
    pub return_type: &'static str,
    /// Item type of a streaming method.
    pub element_type: Option<&'static str>,
}

impl ServiceRegistryItem {
    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }

    /// Request type a client sends to call this method.
    pub fn message_type(&self) -> MessageType {
        if self.streaming {
            MessageType::ClientStreamingRequest
        } else if self.oneway {
            MessageType::ClientRequestOneway
        } else {
            MessageType::ClientRequestV2
        }
    }
}

#[derive(Clone)]
pub struct RegisteredMethod {
    item: ServiceRegistryItem,
    pub(crate) handler: MethodHandler,
}

impl RegisteredMethod {
    pub fn item(&self) -> &ServiceRegistryItem {
        &self.item
    }
}

/// Typed handlers for one service interface.
pub struct ServiceDefinition {
    interface: ServiceInterface,
    methods: Vec<RegisteredMethod>,
}

impl ServiceDefinition {
    pub fn new(interface: ServiceInterface) -> Self {
        Self {
            interface,
            methods: Vec::new(),
        }
    }

    pub fn interface(&self) -> &ServiceInterface {
        &self.interface
    }

    /// Exports a request/response method. Handlers returning `()` send an
    /// empty response.
    pub fn unary<A, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        A: Args,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let descriptor = self.interface.resolve(&method.into());

        let handler: UnaryHandler = Arc::new(
            move |serializer: SerializerId,
                  args: &[Bytes]|
                  -> Result<BoxFuture<Result<Option<Payload>, RpcError>>, RpcError> {
                let call = handler(A::decode(serializer, args)?);
                Ok(Box::pin(async move {
                    let value = call.await?;
                    Ok(encode_returning(serializer, &value)?)
                }))
            },
        );

        self.methods.push(RegisteredMethod {
            item: ServiceRegistryItem {
                service_name: descriptor.service_name,
                method_name: descriptor.wire_name,
                oneway: descriptor.oneway,
                streaming: false,
                serializer: descriptor.serializer,
                parameter_types: A::type_names(),
                return_type: type_name::<R>(),
                element_type: None,
            },
            handler: MethodHandler::Unary(handler),
        });
        self
    }

    /// Exports a method that answers with a stream of `T`. The handler owns
    /// the sink and the stream ends when its future completes.
    pub fn streaming<A, T, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        A: Args,
        T: Serialize + Send + 'static,
        F: Fn(A, StreamSink<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let descriptor = self.interface.resolve(&method.into());

        let handler: StreamingHandler = Arc::new(
            move |serializer: SerializerId,
                  args: &[Bytes],
                  target: StreamTarget|
                  -> Result<BoxFuture<Result<(), RpcError>>, RpcError> {
                let args = A::decode(serializer, args)?;
                Ok(Box::pin(handler(args, StreamSink::new(target))))
            },
        );

        self.methods.push(RegisteredMethod {
            item: ServiceRegistryItem {
                service_name: descriptor.service_name,
                method_name: descriptor.wire_name,
                oneway: false,
                streaming: true,
                serializer: descriptor.serializer,
                parameter_types: A::type_names(),
                return_type: type_name::<()>(),
                element_type: Some(type_name::<T>()),
            },
            handler: MethodHandler::Streaming(handler),
        });
        self
    }
}

/// Something that can be exported through a [`ServiceRegistry`].
pub trait ServiceProvider: Send + Sync + 'static {
    fn definition(self: Arc<Self>) -> ServiceDefinition;
}

/// Every exported method, by service and wire method name.
///
/// Built once before serving, then shared read-only.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, RegisteredMethod>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service<P: ServiceProvider>(&mut self, provider: Arc<P>) -> Result<(), RegistryError> {
        self.add_definition(provider.definition())
    }

    /// Registers every method of `definition`, or none of them.
    pub fn add_definition(&mut self, definition: ServiceDefinition) -> Result<(), RegistryError> {
        let service = definition.interface.name().to_string();
        if service.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }

        let existing = self.services.get(&service);
        let mut seen = HashSet::new();
        for method in &definition.methods {
            let name = &method.item.method_name;
            if name.is_empty() {
                return Err(RegistryError::EmptyMethodName(service));
            }
            let taken = existing.is_some_and(|methods| methods.contains_key(name));
            if taken || !seen.insert(name.as_str()) {
                return Err(RegistryError::Duplicate {
                    service,
                    method: name.clone(),
                });
            }
        }

        let methods = self.services.entry(service.clone()).or_default();
        for method in definition.methods {
            info!(
                service = %service,
                method = %method.item.method_name,
                streaming = method.item.streaming,
                oneway = method.item.oneway,
                "registered service method"
            );
            methods.insert(method.item.method_name.clone(), method);
        }
        Ok(())
    }

    pub fn find_service_provider(&self, service: &str, method: &str) -> Option<&RegisteredMethod> {
        self.services.get(service)?.get(method)
    }

    pub fn items(&self) -> impl Iterator<Item = &ServiceRegistryItem> {
        self.services
            .values()
            .flat_map(|methods| methods.values())
            .map(RegisteredMethod::item)
    }

    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::interface::MethodConfig;

    struct Counter {
        calls: AtomicUsize,
    }

    impl Counter {
        fn add(&self, amount: usize) -> usize {
            self.calls.fetch_add(amount, Ordering::SeqCst) + amount
        }
    }

    fn interface() -> ServiceInterface {
        ServiceInterface::builder()
            .name("Counter")
            .oneway(true)
            .methods(vec![
                MethodConfig::builder()
                    .name("add")
                    .wire_name("counter.add")
                    .oneway(false)
                    .build(),
            ])
            .build()
    }

    impl ServiceProvider for Counter {
        fn definition(self: Arc<Self>) -> ServiceDefinition {
            ServiceDefinition::new(interface())
                .unary("add", move |(amount,): (usize,)| {
                    let counter = self.clone();
                    async move { Ok(counter.add(amount)) }
                })
                .unary("reset", |(): ()| async { Ok(()) })
                .streaming("watch", |(_from,): (u64,), _sink: StreamSink<usize>| async {
                    Ok(())
                })
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry
            .add_service(Arc::new(Counter {
                calls: AtomicUsize::new(0),
            }))
            .unwrap();
        registry
    }

    #[test]
    fn items_describe_each_method() {
        let registry = registry();
        assert_eq!(registry.len(), 3);

        let add = registry.find_service_provider("Counter", "counter.add").unwrap();
        assert!(!add.item().oneway);
        assert!(!add.item().streaming);
        assert_eq!(add.item().arity(), 1);
        assert_eq!(add.item().message_type(), MessageType::ClientRequestV2);
        assert!(registry.find_service_provider("Counter", "add").is_none());

        let reset = registry.find_service_provider("Counter", "reset").unwrap();
        assert!(reset.item().oneway);
        assert_eq!(reset.item().arity(), 0);
        assert_eq!(reset.item().message_type(), MessageType::ClientRequestOneway);

        let watch = registry.find_service_provider("Counter", "watch").unwrap();
        assert!(watch.item().streaming);
        assert!(!watch.item().oneway, "streams always answer");
        assert_eq!(watch.item().element_type, Some(type_name::<usize>()));
        assert_eq!(watch.item().message_type(), MessageType::ClientStreamingRequest);
    }

    #[test]
    fn conflicting_definition_is_rejected_whole() {
        let mut registry = registry();

        let conflicting = ServiceDefinition::new(interface())
            .unary("other", |(): ()| async { Ok(1u8) })
            .unary("add", |(): ()| async { Ok(0usize) });

        assert_eq!(
            registry.add_definition(conflicting),
            Err(RegistryError::Duplicate {
                service: "Counter".to_string(),
                method: "counter.add".to_string(),
            })
        );
        assert!(registry.find_service_provider("Counter", "other").is_none());
        assert_eq!(
            registry
                .find_service_provider("Counter", "counter.add")
                .unwrap()
                .item()
                .arity(),
            1
        );
    }

    #[test]
    fn duplicates_within_one_definition_are_rejected() {
        let mut registry = ServiceRegistry::new();
        let definition = ServiceDefinition::new(interface())
            .unary("ping", |(): ()| async { Ok(()) })
            .unary("ping", |(): ()| async { Ok(()) });

        assert!(matches!(
            registry.add_definition(definition),
            Err(RegistryError::Duplicate { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_names_are_rejected() {
        let mut registry = ServiceRegistry::new();
        let nameless = ServiceInterface::builder().name("").build();
        assert_eq!(
            registry.add_definition(ServiceDefinition::new(nameless)),
            Err(RegistryError::EmptyServiceName)
        );

        let definition =
            ServiceDefinition::new(interface()).unary("", |(): ()| async { Ok(()) });
        assert_eq!(
            registry.add_definition(definition),
            Err(RegistryError::EmptyMethodName("Counter".to_string()))
        );
    }

    #[tokio::test]
    async fn unary_handler_decodes_and_encodes() {
        let registry = registry();
        let add = registry.find_service_provider("Counter", "counter.add").unwrap();
        let MethodHandler::Unary(handler) = &add.handler else {
            panic!("add is unary");
        };

        let args = (5usize,).encode(SerializerId::JSON).unwrap();
        let payload = handler(SerializerId::JSON, &args).unwrap().await.unwrap();
        assert_eq!(payload.unwrap().decode::<usize>().unwrap(), 5);

        let too_many = (1usize, 2usize).encode(SerializerId::JSON).unwrap();
        assert!(matches!(
            handler(SerializerId::JSON, &too_many),
            Err(RpcError::BadRequest(_))
        ));

        let reset = registry.find_service_provider("Counter", "reset").unwrap();
        let MethodHandler::Unary(handler) = &reset.handler else {
            panic!("reset is unary");
        };
        assert_eq!(handler(SerializerId::JSON, &[]).unwrap().await.unwrap(), None);
    }
}
