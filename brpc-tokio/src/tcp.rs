use std::io::ErrorKind;
use std::{io, pin::Pin, task::Poll};

use brpc_proto::codec::DecodeError;
use brpc_proto::connection_state::{ConnectionConfig, ConnectionState};
use brpc_proto::message::ServiceMessage;
use futures::ready;
use futures::{FutureExt, Sink, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames [`ServiceMessage`]s over a byte stream.
///
/// As a `Stream` it yields decoded messages. A frame that fails to decode is
/// skipped and reported as `InvalidData`; a frame over the size limit is
/// reported as `InvalidInput` and leaves the stream unusable.
pub struct TokioConnection<Reader, Writer> {
    state: ConnectionState,
    read_state: ReadState<Reader>,
    read_error: Option<io::Error>,
    write_state: WriteState<Writer>,
}

impl<Reader, Writer> TokioConnection<Reader, Writer> {
    pub fn new(config: ConnectionConfig, reader: Reader, writer: Writer) -> Self {
        Self {
            read_state: ReadState::Idle(Some((
                reader,
                vec![0; config.read_config.recv_buffer_size.get()],
                0,
            ))),

            state: ConnectionState::new(config),
            read_error: None,

            write_state: WriteState::Idle(Some(writer)),
        }
    }
}

type PinBox<T> = Pin<Box<dyn Future<Output = T> + Send + Sync + 'static>>;

type ReadInner<R> = (R, Vec<u8>, usize);

enum ReadState<R> {
    Idle(Option<ReadInner<R>>),
    Reading(PinBox<Result<ReadInner<R>, io::Error>>),
}

enum WriteState<W> {
    Idle(Option<W>),
    Writing(PinBox<Result<W, io::Error>>),
    Closing(PinBox<Result<W, io::Error>>),
}

impl<Writer> WriteState<Writer> {
    fn is_closed(&self) -> bool {
        matches!(self, Self::Closing(_))
    }
}

fn decode_error(error: DecodeError) -> io::Error {
    match error {
        DecodeError::FrameTooLarge { .. } => io::Error::new(ErrorKind::InvalidInput, error),
        other => io::Error::new(ErrorKind::InvalidData, other),
    }
}

fn lost(half: &str) -> io::Error {
    io::Error::other(format!("{half} half was lost by a failed operation"))
}

impl<Reader, Writer> Stream for TokioConnection<Reader, Writer>
where
    Self: Unpin,
    Reader: AsyncRead + Unpin + 'static + Send + Sync,
{
    type Item = Result<ServiceMessage, io::Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(item) = this.state.consume_item() {
                return Poll::Ready(Some(Ok(item)));
            }
            // Reported after the items decoded ahead of the bad frame.
            if let Some(error) = this.read_error.take() {
                return Poll::Ready(Some(Err(error)));
            }

            if let Err(error) = this.state.process_read() {
                this.read_error = Some(decode_error(error));
                continue;
            }
            if let Some(item) = this.state.consume_item() {
                return Poll::Ready(Some(Ok(item)));
            }

            match &mut this.read_state {
                ReadState::Idle(idle) => {
                    let Some((mut reader, mut buf, read)) = idle.take() else {
                        return Poll::Ready(Some(Err(lost("read"))));
                    };

                    if read != 0 {
                        // Whatever the state refuses waits until the queue drains.
                        let fed = this.state.feed_bytes(&buf[..read]);
                        buf.copy_within(fed..read, 0);
                        this.read_state = ReadState::Idle(Some((reader, buf, read - fed)));
                        continue;
                    }

                    let fut = Box::pin(async move {
                        let read = reader.read(&mut buf).await?;
                        Ok((reader, buf, read))
                    });
                    this.read_state = ReadState::Reading(fut)
                }

                ReadState::Reading(pin) => {
                    let (reader, buf, read) = futures::ready!(pin.poll_unpin(cx))?;
                    if read == 0 {
                        return Poll::Ready(None);
                    }
                    this.read_state = ReadState::Idle(Some((reader, buf, read)));
                }
            }
        }
    }
}

impl<Reader, Writer> Sink<ServiceMessage> for TokioConnection<Reader, Writer>
where
    Self: Unpin,
    Writer: AsyncWrite + 'static + Unpin + Send + Sync,
{
    type Error = io::Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        match &mut this.write_state {
            WriteState::Idle(_) => Poll::Ready(Ok(())),
            WriteState::Writing(pin) => {
                let result = ready!(pin.poll_unpin(cx))?;
                this.write_state = WriteState::Idle(Some(result));
                Poll::Ready(Ok(()))
            }
            _ => Poll::Pending,
        }
    }

    fn start_send(self: Pin<&mut Self>, item: ServiceMessage) -> Result<(), Self::Error> {
        if self.write_state.is_closed() {
            return Err(ErrorKind::ConnectionReset.into());
        }

        let this = self.get_mut();
        if this.state.feed_item(item).is_some() {
            return Err(io::Error::other("send queue is full"));
        }
        this.state.process_write();
        Ok(())
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Idle(idle) => {
                    let Some(mut writer) = idle.take() else {
                        return Poll::Ready(Err(lost("write")));
                    };
                    let Some(bytes) = this.state.consume_all() else {
                        this.write_state = WriteState::Idle(Some(writer));
                        return Poll::Ready(Ok(()));
                    };

                    let fut = Box::pin(async move {
                        writer.write_all(&bytes).await?;

                        Ok(writer)
                    });

                    this.write_state = WriteState::Writing(fut);
                }
                WriteState::Writing(pin) => {
                    let writer = ready!(pin.poll_unpin(cx))?;
                    this.write_state = WriteState::Idle(Some(writer));
                }

                _ => return Poll::Ready(Err(ErrorKind::ConnectionReset.into())),
            }
        }
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Idle(idle) => {
                    let Some(mut writer) = idle.take() else {
                        return Poll::Ready(Err(lost("write")));
                    };
                    let Some(bytes) = this.state.consume_all() else {
                        let fut = Box::pin(async move {
                            writer.flush().await?;
                            writer.shutdown().await?;
                            Ok(writer)
                        });
                        this.write_state = WriteState::Closing(fut);

                        continue;
                    };

                    let fut = Box::pin(async move {
                        writer.write_all(&bytes).await?;

                        Ok(writer)
                    });

                    this.write_state = WriteState::Writing(fut);
                }
                WriteState::Writing(pin) => {
                    let writer = ready!(pin.poll_unpin(cx))?;
                    this.write_state = WriteState::Idle(Some(writer));
                }

                WriteState::Closing(pin) => {
                    ready!(pin.poll_unpin(cx))?;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
