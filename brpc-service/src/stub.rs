//! Client handles for a declared service.
//!
//! A [`ServiceStub`] turns `call("method", args)` into one invocation on its
//! channel, resolving the method's wire name, serializer, oneway flag and
//! timeout through the interface. Typed clients wrap a stub and forward each
//! method to [`ServiceStub::call`] or [`ServiceStub::stream`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use brpc_proto::args::Args;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::{
    channel::Channel,
    error::RpcError,
    interface::{MethodDescriptor, ServiceInterface},
    manager::InvocationManager,
    stream::StreamHandle,
};

#[derive(Clone)]
pub struct StubFactory {
    manager: InvocationManager,
    default_timeout: Duration,
}

impl StubFactory {
    pub fn new(manager: InvocationManager) -> Self {
        let default_timeout = manager.config().default_timeout;
        Self {
            manager,
            default_timeout,
        }
    }

    /// Timeout for stubs created from now on, unless a method or handle
    /// overrides it.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &InvocationManager {
        &self.manager
    }

    pub fn create(&self, interface: ServiceInterface, channel: Arc<dyn Channel>) -> ServiceStub {
        ServiceStub {
            interface: Arc::new(interface),
            channel,
            manager: self.manager.clone(),
            default_timeout: self.default_timeout,
            timeout: None,
            verbose: false,
        }
    }
}

/// Calls one service over one channel.
///
/// Clones share the channel but not their settings: `set_timeout` and
/// `set_verbose` only affect the handle they are called on.
#[derive(Clone)]
pub struct ServiceStub {
    interface: Arc<ServiceInterface>,
    channel: Arc<dyn Channel>,
    manager: InvocationManager,
    default_timeout: Duration,
    timeout: Option<Duration>,
    verbose: bool,
}

impl ServiceStub {
    pub fn interface(&self) -> &ServiceInterface {
        &self.interface
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Logs every call made through this handle at `info`.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Overrides the timeout of every method called through this handle.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn reset_timeout(&mut self) {
        self.timeout = None;
    }

    pub fn timeout_for(&self, method: &MethodDescriptor) -> Duration {
        self.timeout
            .or(method.timeout)
            .unwrap_or(self.default_timeout)
    }

    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R, RpcError>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let descriptor = self.interface.resolve(method);
        let timeout = self.timeout_for(&descriptor);

        if !self.verbose {
            return self
                .manager
                .invoke(self.channel.as_ref(), timeout, &descriptor, args)
                .await;
        }

        info!(
            service = %descriptor.service_name,
            method = %descriptor.wire_name,
            oneway = descriptor.oneway,
            ?timeout,
            "calling"
        );
        let started = Instant::now();
        let result = self
            .manager
            .invoke(self.channel.as_ref(), timeout, &descriptor, args)
            .await;
        match &result {
            Ok(_) => info!(
                service = %descriptor.service_name,
                method = %descriptor.wire_name,
                elapsed = ?started.elapsed(),
                "call returned"
            ),
            Err(error) => info!(
                service = %descriptor.service_name,
                method = %descriptor.wire_name,
                elapsed = ?started.elapsed(),
                %error,
                "call failed"
            ),
        }
        result
    }

    /// Opens a stream. Streams have no overall timeout; cancel or drop the
    /// handle to stop one.
    pub async fn stream<A, T>(&self, method: &str, args: A) -> Result<StreamHandle<T>, RpcError>
    where
        A: Args,
        T: DeserializeOwned,
    {
        let descriptor = self.interface.resolve(method);
        if self.verbose {
            info!(
                service = %descriptor.service_name,
                method = %descriptor.wire_name,
                "opening stream"
            );
        }
        self.manager
            .invoke_streaming(self.channel.clone(), &descriptor, args)
            .await
    }
}
