use std::future::Future;

use tokio::runtime::Handle;

/// Where invocations and stream consumers run, away from the read loop.
pub trait Runtime: Clone + Send + Sync + 'static {
    fn spawn<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static;
}

#[derive(Debug, Clone)]
pub struct TokioRuntime(Handle);

impl TokioRuntime {
    pub fn new(handle: Handle) -> Self {
        Self(handle)
    }

    /// The runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl Runtime for TokioRuntime {
    fn spawn<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        _ = self.0.spawn(future);
    }
}
