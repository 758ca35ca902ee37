pub use brpc_proto as proto;
pub use brpc_service::*;

pub use async_trait::async_trait;

#[cfg(feature = "tokio")]
pub use brpc_tokio as tokio;
