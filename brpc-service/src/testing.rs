use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use brpc_proto::message::ServiceMessage;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelError};

/// Keeps everything written to it.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    sent: Mutex<Vec<ServiceMessage>>,
    closed: AtomicBool,
    full: AtomicBool,
}

impl RecordingChannel {
    pub(crate) fn sent(&self) -> Vec<ServiceMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn take(&self) -> Vec<ServiceMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("closed for good".to_string()));
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.is_active() && !self.full.load(Ordering::SeqCst)
    }

    fn write_and_flush(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn send(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        self.write_and_flush(message)
    }
}
