//! Two endpoints joined in memory.
//!
//! Messages are encoded into length-prefixed frames on one side and decoded on
//! the other, so the pair behaves like a socket without one.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use brpc_proto::{
    codec::{DEFAULT_MAX_FRAME_LEN, DecodeError, decode_frame, encode_frame},
    message::ServiceMessage,
};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use tracing::debug;

use crate::{
    channel::{Channel, ChannelError},
    endpoint::ServiceEndpoint,
    runtime::Runtime,
};

enum Wire {
    Frame(Bytes),
    Close,
}

/// One side of a [`pair`].
pub struct MemoryChannel {
    outgoing: flume::Sender<Wire>,
    incoming: flume::Sender<Wire>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl MemoryChannel {
    /// Drops the link for both sides, as if the socket was reset.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        _ = self.outgoing.send(Wire::Close);
        _ = self.incoming.send(Wire::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames written but not yet read by the peer.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Connect("memory link is closed".to_string()));
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        !self.is_closed()
    }

    fn is_writable(&self) -> bool {
        self.is_active() && self.outgoing.len() < self.capacity
    }

    fn write_and_flush(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut frame = BytesMut::new();
        encode_frame(&message, &mut frame);
        self.outgoing
            .send(Wire::Frame(frame.freeze()))
            .map_err(|_| ChannelError::Closed)
    }

    async fn send(&self, message: ServiceMessage) -> Result<(), ChannelError> {
        self.write_and_flush(message)
    }
}

/// Connects `left` and `right`. Each endpoint reads on its own runtime until
/// either channel is closed.
///
/// `capacity` is how many unread frames a channel holds before it reports
/// itself not writable.
pub fn pair<RT: Runtime>(
    left: Arc<ServiceEndpoint<RT>>,
    right: Arc<ServiceEndpoint<RT>>,
    capacity: usize,
) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let (to_right, from_left) = flume::unbounded();
    let (to_left, from_right) = flume::unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    let left_channel = Arc::new(MemoryChannel {
        outgoing: to_right.clone(),
        incoming: to_left.clone(),
        closed: closed.clone(),
        capacity,
    });
    let right_channel = Arc::new(MemoryChannel {
        outgoing: to_left,
        incoming: to_right,
        closed,
        capacity,
    });

    let channel: Arc<dyn Channel> = left_channel.clone();
    let runtime = left.runtime().clone();
    runtime.spawn(async move { left.run(channel, frames(from_right)).await });

    let channel: Arc<dyn Channel> = right_channel.clone();
    let runtime = right.runtime().clone();
    runtime.spawn(async move { right.run(channel, frames(from_left)).await });

    (left_channel, right_channel)
}

fn frames(wire: flume::Receiver<Wire>) -> impl Stream<Item = io::Result<ServiceMessage>> + Send {
    futures::stream::unfold(
        (wire, BytesMut::new(), false),
        |(wire, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                match decode_frame(&mut buffer, DEFAULT_MAX_FRAME_LEN) {
                    Ok(Some(message)) => return Some((Ok(message), (wire, buffer, false))),
                    Ok(None) => {}
                    Err(error @ DecodeError::FrameTooLarge { .. }) => {
                        let error = io::Error::new(io::ErrorKind::InvalidInput, error);
                        return Some((Err(error), (wire, buffer, true)));
                    }
                    Err(error) => {
                        let error = io::Error::new(io::ErrorKind::InvalidData, error);
                        return Some((Err(error), (wire, buffer, false)));
                    }
                }

                match wire.recv_async().await {
                    Ok(Wire::Frame(frame)) => buffer.extend_from_slice(&frame),
                    Ok(Wire::Close) | Err(_) => {
                        debug!("memory link closed");
                        return None;
                    }
                }
            }
        },
    )
}
