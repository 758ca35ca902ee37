use std::time::Duration;

use brpc_proto::{args::ArgsError, serializer::SerializeError};
use thiserror::Error;

use crate::channel::ChannelError;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The request could not be resolved or its arguments could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The target implementation failed, or the remote side reported a failure.
    #[error("service invocation failed: {0}")]
    Invocation(String),
    /// A local precondition failed before anything was sent.
    #[error("client error: {0}")]
    Client(String),
    #[error("{service}.{method} timed out after {timeout:?}")]
    Timeout {
        service: String,
        method: String,
        timeout: Duration,
    },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("stream cancelled")]
    Cancelled,
    #[error(transparent)]
    Serialize(#[from] SerializeError),
}

impl RpcError {
    pub fn invocation(message: impl std::fmt::Display) -> Self {
        RpcError::Invocation(message.to_string())
    }

    /// The string carried back to the caller in a response or end frame.
    pub fn to_remote(&self) -> String {
        match self {
            RpcError::Invocation(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<ArgsError> for RpcError {
    fn from(error: ArgsError) -> Self {
        RpcError::BadRequest(error.to_string())
    }
}

impl From<ChannelError> for RpcError {
    fn from(error: ChannelError) -> Self {
        RpcError::Client(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{service}.{method} is already registered")]
    Duplicate { service: String, method: String },
    #[error("service name must not be empty")]
    EmptyServiceName,
    #[error("service {0} declares a method with an empty name")]
    EmptyMethodName(String),
}
