use crate::{
    codec::{DEFAULT_MAX_FRAME_LEN, DecodeError, decode_frame, encode_frame},
    message::ServiceMessage,
};
use bytes::{Bytes, BytesMut};
use std::{collections::VecDeque, num::NonZeroUsize};

pub struct ConnectionState {
    read: ConnectionReadState,
    write: ConnectionWriteState,
}

impl ConnectionState {
    pub fn new(config: ConnectionConfig) -> Self {
        let (read, write) = config.split();

        Self {
            read: ConnectionReadState::new(read),
            write: ConnectionWriteState::new(write),
        }
    }

    pub fn into_split(self) -> (ConnectionWriteState, ConnectionReadState) {
        (self.write, self.read)
    }
}

pub struct ConnectionReadState {
    recv_queue: VecDeque<ServiceMessage>,
    recv_buffer: BytesMut,
    config: ReadConnectionConfig,
}

impl ConnectionReadState {
    pub fn new(config: ReadConnectionConfig) -> Self {
        Self {
            recv_queue: VecDeque::with_capacity(config.recv_queue_size.get()),
            recv_buffer: BytesMut::with_capacity(config.recv_buffer_size.get()),
            config,
        }
    }
}

pub struct ConnectionWriteState {
    send_queue: VecDeque<ServiceMessage>,
    send_buffer: BytesMut,
    config: WriteConnectionConfig,
}

impl ConnectionWriteState {
    pub fn new(config: WriteConnectionConfig) -> Self {
        Self {
            send_queue: VecDeque::with_capacity(config.send_queue_size.get()),
            send_buffer: BytesMut::with_capacity(config.send_buffer_size.get()),
            config,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub read_config: ReadConnectionConfig,
    pub write_config: WriteConnectionConfig,
}

#[bon::bon]
impl ConnectionConfig {
    #[builder]
    pub fn new(
        #[builder(default = NonZeroUsize::new(64).unwrap())] recv_queue_size: NonZeroUsize,
        #[builder(default = NonZeroUsize::new(64 * 1024).unwrap())]
        recv_buffer_size: NonZeroUsize,
        #[builder(default = NonZeroUsize::new(64).unwrap())] send_queue_size: NonZeroUsize,
        #[builder(default = NonZeroUsize::new(64 * 1024).unwrap())]
        send_buffer_size: NonZeroUsize,
        #[builder(default = DEFAULT_MAX_FRAME_LEN)] max_frame_len: usize,
    ) -> ConnectionConfig {
        ConnectionConfig {
            read_config: ReadConnectionConfig {
                recv_queue_size,
                recv_buffer_size,
                max_frame_len,
            },
            write_config: WriteConnectionConfig {
                send_queue_size,
                send_buffer_size,
            },
        }
    }

    pub fn split(self) -> (ReadConnectionConfig, WriteConnectionConfig) {
        let ConnectionConfig {
            read_config,
            write_config,
        } = self;
        (read_config, write_config)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::builder().build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadConnectionConfig {
    pub recv_queue_size: NonZeroUsize,
    pub recv_buffer_size: NonZeroUsize,
    pub max_frame_len: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteConnectionConfig {
    pub send_queue_size: NonZeroUsize,
    pub send_buffer_size: NonZeroUsize,
}

impl ConnectionState {
    /// Available sender space counted in items
    pub fn available_space(&self) -> usize {
        self.write.available_space()
    }

    /// Consume up to [`len`] bytes from the send buffer
    pub fn consume_bytes(&mut self, len: usize) -> Option<Bytes> {
        self.write.consume_bytes(len)
    }

    /// Consume all the bytes from the send buffer
    pub fn consume_all(&mut self) -> Option<Bytes> {
        self.write.consume_all()
    }

    pub fn write_queue_empty(&self) -> bool {
        self.write.write_queue_empty()
    }

    /// Called by the writer to send outgoing items
    pub fn feed_item(&mut self, item: ServiceMessage) -> Option<ServiceMessage> {
        self.write.feed_item(item)
    }

    pub fn process_write(&mut self) {
        self.write.process()
    }

    /// Pop one item from the recv queue
    pub fn consume_item(&mut self) -> Option<ServiceMessage> {
        self.read.consume_item()
    }

    /// Called by the reader to process incoming bytes
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> usize {
        self.read.feed_bytes(bytes)
    }

    /// Process function to advance the current state
    pub fn process_read(&mut self) -> Result<(), DecodeError> {
        self.read.process()
    }
}

impl ConnectionReadState {
    /// Pop one item from the recv queue
    pub fn consume_item(&mut self) -> Option<ServiceMessage> {
        self.recv_queue.pop_front()
    }

    /// Called by the reader to process incoming bytes.
    ///
    /// Returns how many bytes were accepted; nothing is accepted while the
    /// buffer is over its size hint and the queue is full.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> usize {
        if self.recv_buffer.len() >= self.config.recv_buffer_size.get()
            && self.recv_queue.len() >= self.config.recv_queue_size.get()
        {
            return 0;
        }
        self.recv_buffer.extend_from_slice(bytes);
        bytes.len()
    }

    /// Decodes buffered frames until the queue is full or a frame is incomplete.
    ///
    /// A malformed frame is dropped from the buffer before its error is
    /// returned, so the caller decides whether the connection survives it.
    pub fn process(&mut self) -> Result<(), DecodeError> {
        while self.recv_queue.len() < self.config.recv_queue_size.get() {
            match decode_frame(&mut self.recv_buffer, self.config.max_frame_len)? {
                Some(next_item) => self.recv_queue.push_back(next_item),
                None => break,
            }
        }
        Ok(())
    }
}

impl ConnectionWriteState {
    /// Available sender space counted in items
    pub fn available_space(&self) -> usize {
        self.config
            .send_queue_size
            .get()
            .saturating_sub(self.send_queue.len())
    }

    /// Consume up to [`len`] bytes from the send buffer
    pub fn consume_bytes(&mut self, len: usize) -> Option<Bytes> {
        if self.send_buffer.is_empty() {
            return None;
        }

        if self.send_buffer.len() < len {
            self.consume_all()
        } else {
            let to_send = self.send_buffer.split_to(len);
            Some(to_send.freeze())
        }
    }

    /// Consume all the bytes from the send buffer
    pub fn consume_all(&mut self) -> Option<Bytes> {
        if self.send_buffer.is_empty() {
            return None;
        }

        let to_send = std::mem::replace(
            &mut self.send_buffer,
            BytesMut::with_capacity(self.config.send_buffer_size.get()),
        );
        Some(to_send.freeze())
    }

    /// Called by the writer to send outgoing items; hands the item back when
    /// the queue is full.
    pub fn feed_item(&mut self, item: ServiceMessage) -> Option<ServiceMessage> {
        if self.send_queue.len() >= self.config.send_queue_size.get() {
            Some(item)
        } else {
            self.send_queue.push_back(item);
            None
        }
    }

    pub fn write_queue_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    /// Encodes every queued item into the send buffer
    pub fn process(&mut self) {
        while let Some(to_send) = self.send_queue.pop_front() {
            encode_frame(&to_send, &mut self.send_buffer);
        }
    }
}
