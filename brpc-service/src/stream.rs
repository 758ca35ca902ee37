//! Server-to-client streams.
//!
//! The client gets a [`StreamHandle`] at call time. The read loop only queues
//! raw frames on the handle's bounded queue; decoding and delivery happen on
//! whoever polls the handle, so a slow consumer never holds up other calls on
//! the same connection.
//!
//! The server hands a [`StreamSink`] to the streaming handler. Cancellation is
//! cooperative: the producer polls [`StreamSink::is_cancelled`] or notices that
//! [`StreamSink::send`] fails with [`RpcError::Cancelled`].

use std::{
    collections::HashMap,
    marker::PhantomData,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use brpc_proto::{
    message::{Payload, ServiceMessage, ServiceStreamingCancel, ServiceStreamingData},
    serializer::SerializerId,
};
use futures::{Stream, StreamExt, ready, stream::BoxStream};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace, warn};

use crate::{channel::Channel, error::RpcError, manager::InvocationManager, runtime::Runtime};

pub(crate) enum StreamFrame {
    Data(Payload),
    End(Option<String>),
}

#[derive(Default)]
pub(crate) struct StreamShared {
    cancelled: AtomicBool,
    /// Why the manager dropped the stream without an end frame.
    failure: Mutex<Option<RpcError>>,
}

impl StreamShared {
    pub(crate) fn fail(&self, error: RpcError) {
        self.failure.lock().get_or_insert(error);
    }
}

/// Cancellation side of a client stream. Cheap to clone.
#[derive(Clone)]
pub struct StreamControl {
    transaction_id: u64,
    channel: Arc<dyn Channel>,
    shared: Arc<StreamShared>,
}

impl StreamControl {
    pub(crate) fn new(
        transaction_id: u64,
        channel: Arc<dyn Channel>,
        shared: Arc<StreamShared>,
    ) -> Self {
        Self {
            transaction_id,
            channel,
            shared,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Asks the server to stop producing. Only the first call sends a cancel
    /// frame; a server that already finished simply ignores it.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancel = ServiceMessage::StreamingCancel(ServiceStreamingCancel {
            transaction_id: self.transaction_id,
        });
        match self.channel.write_and_flush(cancel) {
            Ok(()) => debug!(transaction_id = self.transaction_id, "stream cancelled"),
            Err(error) => debug!(
                transaction_id = self.transaction_id,
                %error,
                "could not send stream cancel"
            ),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

/// Items of one streaming call, in the order the server sent them.
///
/// Ends after the server's end frame. An end frame carrying an exception is
/// yielded once as an error. Data arriving after [`StreamControl::cancel`] is
/// discarded. Dropping an unfinished handle cancels the stream.
pub struct StreamHandle<T> {
    control: StreamControl,
    frames: BoxStream<'static, StreamFrame>,
    manager: InvocationManager,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StreamHandle<T> {
    pub(crate) fn new(
        control: StreamControl,
        frames: flume::Receiver<StreamFrame>,
        manager: InvocationManager,
    ) -> Self {
        Self {
            control,
            frames: frames.into_stream().boxed(),
            manager,
            finished: false,
            _marker: PhantomData,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.control.transaction_id
    }

    pub fn control(&self) -> StreamControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    fn finish(&mut self) {
        self.finished = true;
        self.manager.release(self.control.transaction_id);
    }
}

impl<T: DeserializeOwned> StreamHandle<T> {
    /// Delivers the stream to `observer` on `runtime`. Exactly one of
    /// `on_complete` and `on_exception` is called, after the last `on_next`.
    pub fn subscribe<RT, O>(self, runtime: &RT, mut observer: O) -> StreamControl
    where
        T: Send + 'static,
        RT: Runtime,
        O: StreamObserver<T>,
    {
        let control = self.control.clone();
        runtime.spawn(async move {
            let mut stream = self;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(item) => observer.on_next(item),
                    Err(error) => {
                        observer.on_exception(error);
                        return;
                    }
                }
            }
            observer.on_complete();
        });
        control
    }
}

impl<T: DeserializeOwned> Stream for StreamHandle<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match ready!(this.frames.poll_next_unpin(cx)) {
                Some(StreamFrame::Data(payload)) => {
                    if this.control.is_cancelled() {
                        trace!(
                            transaction_id = this.control.transaction_id,
                            "discarding data after cancel"
                        );
                        continue;
                    }
                    return match payload.decode::<T>() {
                        Ok(item) => Poll::Ready(Some(Ok(item))),
                        Err(error) => {
                            this.control.cancel();
                            this.finish();
                            Poll::Ready(Some(Err(error.into())))
                        }
                    };
                }
                Some(StreamFrame::End(exception)) => {
                    this.finish();
                    return match exception {
                        Some(exception) if !this.control.is_cancelled() => {
                            Poll::Ready(Some(Err(RpcError::Invocation(exception))))
                        }
                        _ => Poll::Ready(None),
                    };
                }
                None => {
                    let failure = this.control.shared.failure.lock().take();
                    this.control.cancel();
                    this.finish();
                    let error = failure.unwrap_or_else(|| {
                        RpcError::ConnectionLost("stream closed without an end frame".to_string())
                    });
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}

impl<T> Drop for StreamHandle<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.control.cancel();
            self.manager.release(self.control.transaction_id);
        }
    }
}

/// Callback-style consumer for [`StreamHandle::subscribe`].
pub trait StreamObserver<T>: Send + 'static {
    fn on_next(&mut self, item: T);

    fn on_complete(&mut self) {}

    fn on_exception(&mut self, error: RpcError) {
        warn!(%error, "stream failed");
    }
}

/// What a server-side stream writes to.
pub(crate) struct StreamTarget {
    pub(crate) transaction_id: u64,
    pub(crate) serializer: SerializerId,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) cancelled: Arc<AtomicBool>,
}

/// Producer side of a streaming method.
pub struct StreamSink<T> {
    target: StreamTarget,
    _marker: PhantomData<fn(T)>,
}

impl<T> StreamSink<T> {
    pub(crate) fn new(target: StreamTarget) -> Self {
        Self {
            target,
            _marker: PhantomData,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.target.transaction_id
    }

    /// True once the client cancelled or the connection went away.
    pub fn is_cancelled(&self) -> bool {
        self.target.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Serialize> StreamSink<T> {
    /// Sends one item, waiting for room on the connection.
    pub async fn send(&self, item: &T) -> Result<(), RpcError> {
        if self.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let data = ServiceMessage::StreamingData(ServiceStreamingData {
            transaction_id: self.target.transaction_id,
            payload: Payload::encode(self.target.serializer, item)?,
        });
        self.target
            .channel
            .send(data)
            .await
            .map_err(|error| RpcError::ConnectionLost(error.to_string()))
    }
}

/// Server streams currently producing on one connection.
#[derive(Default)]
pub struct ActiveStreams {
    streams: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl ActiveStreams {
    pub(crate) fn open(&self, transaction_id: u64) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.streams
            .lock()
            .insert(transaction_id, cancelled.clone());
        cancelled
    }

    pub(crate) fn close(&self, transaction_id: u64) {
        self.streams.lock().remove(&transaction_id);
    }

    /// Flags a stream as cancelled. Returns false when it already finished.
    pub fn cancel(&self, transaction_id: u64) -> bool {
        match self.streams.lock().get(&transaction_id) {
            Some(cancelled) => {
                cancelled.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for cancelled in self.streams.lock().values() {
            cancelled.store(true, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
