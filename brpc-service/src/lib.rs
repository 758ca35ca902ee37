pub mod channel;
pub mod endpoint;
pub mod error;
pub mod interface;
pub mod invocation;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod stream;
pub mod stub;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChannelError};
pub use endpoint::ServiceEndpoint;
pub use error::{RegistryError, RpcError};
pub use interface::{MethodConfig, MethodDescriptor, ServiceInterface};
pub use manager::{ClientConfig, InvocationManager};
pub use registry::{ServiceDefinition, ServiceProvider, ServiceRegistry, ServiceRegistryItem};
pub use runtime::{Runtime, TokioRuntime};
pub use stream::{ActiveStreams, StreamControl, StreamHandle, StreamObserver, StreamSink};
pub use stub::{ServiceStub, StubFactory};
