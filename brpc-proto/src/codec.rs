//! Binary layout of [`ServiceMessage`] frames.
//!
//! ```text
//! frame    := len:u32 body
//! body     := type:i32 transaction_id:i64 fields...
//! request  := service:str method:str [app:opt<str>] serializer:i32 args
//! response := response_at:i64 exception:opt<str> returning:opt<serializer:i32 bytes>
//! data     := serializer:i32 bytes
//! end      := exception:opt<str>
//! cancel   := (nothing)
//! str      := len:i32 utf8
//! bytes    := len:i32 raw
//! args     := count:i32 bytes*
//! opt<T>   := 0:u8 | 1:u8 T
//! ```
//!
//! All integers are big-endian. Lengths are `i32`, so a single string or
//! argument is limited to `i32::MAX` bytes; frames are far smaller in practice
//! because of `max_frame_len`. Oneway and streaming requests differ from unary
//! ones only in their message type. The legacy `CLIENT_REQUEST` layout has no app
//! name field and is only ever decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    message::{
        CallKind, MessageType, Payload, ResponseBody, ServiceMessage, ServiceRequest,
        ServiceResponse, ServiceStreamingCancel, ServiceStreamingData, ServiceStreamingEnd,
    },
    serializer::SerializerId,
};

pub const FRAME_HEADER_LEN: usize = 4;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame truncated: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("invalid presence byte {0}")]
    InvalidPresence(u8),
    #[error("response carries both an exception and a return value")]
    ConflictingResponse,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

impl ServiceMessage {
    /// Appends the message body (without the length prefix) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32(self.message_type().as_i32());
        dst.put_u64(self.transaction_id());

        match self {
            ServiceMessage::Request(request) => {
                put_str(dst, &request.service_name);
                put_str(dst, &request.method_name);
                put_opt(dst, request.app_name.as_deref(), |dst, app| put_str(dst, app));
                dst.put_i32(request.serializer.0);
                dst.put_i32(len_i32(request.args.len()));
                for arg in &request.args {
                    put_bytes(dst, arg);
                }
            }
            ServiceMessage::Response(response) => {
                dst.put_i64(response.server_response_at);
                put_opt(dst, response.exception(), |dst, exception| {
                    put_str(dst, exception)
                });
                put_opt(dst, response.returning(), put_payload);
            }
            ServiceMessage::StreamingData(data) => put_payload(dst, &data.payload),
            ServiceMessage::StreamingEnd(end) => {
                put_opt(dst, end.exception.as_deref(), |dst, exception| {
                    put_str(dst, exception)
                });
            }
            ServiceMessage::StreamingCancel(_) => {}
        }
    }

    /// Decodes one complete message body. The whole slice must be consumed.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader { buf: body };

        let raw_type = reader.i32()?;
        let message_type =
            MessageType::from_i32(raw_type).ok_or(DecodeError::UnknownMessageType(raw_type))?;
        let transaction_id = reader.u64()?;

        let message = match message_type {
            MessageType::ClientRequest
            | MessageType::ClientRequestOneway
            | MessageType::ClientRequestV2
            | MessageType::ClientStreamingRequest => {
                let service_name = reader.string()?;
                let method_name = reader.string()?;
                let app_name = match message_type {
                    MessageType::ClientRequest => None,
                    _ => reader.opt(WireReader::string)?,
                };
                let serializer = SerializerId(reader.i32()?);
                let count = reader.len()?;
                let mut args = Vec::with_capacity(count.min(reader.buf.len()));
                for _ in 0..count {
                    args.push(reader.bytes()?);
                }
                let call = match message_type {
                    MessageType::ClientRequestOneway => CallKind::Oneway,
                    MessageType::ClientStreamingRequest => CallKind::Streaming,
                    _ => CallKind::Unary,
                };
                ServiceMessage::Request(ServiceRequest {
                    transaction_id,
                    service_name,
                    method_name,
                    app_name,
                    serializer,
                    args,
                    call,
                })
            }
            MessageType::ServerResponse => {
                let server_response_at = reader.i64()?;
                let exception = reader.opt(WireReader::string)?;
                let returning = reader.opt(WireReader::payload)?;
                let body = match (exception, returning) {
                    (Some(_), Some(_)) => return Err(DecodeError::ConflictingResponse),
                    (Some(exception), None) => ResponseBody::Exception(exception),
                    (None, Some(payload)) => ResponseBody::Returning(payload),
                    (None, None) => ResponseBody::Void,
                };
                ServiceMessage::Response(ServiceResponse {
                    transaction_id,
                    server_response_at,
                    body,
                })
            }
            MessageType::ServerStreamingData => {
                ServiceMessage::StreamingData(ServiceStreamingData {
                    transaction_id,
                    payload: reader.payload()?,
                })
            }
            MessageType::ServerStreamingEnd => ServiceMessage::StreamingEnd(ServiceStreamingEnd {
                transaction_id,
                exception: reader.opt(WireReader::string)?,
            }),
            MessageType::ClientStreamingCancel => {
                ServiceMessage::StreamingCancel(ServiceStreamingCancel { transaction_id })
            }
        };

        if !reader.buf.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.buf.len()));
        }
        Ok(message)
    }
}

/// Appends a length-prefixed frame to `dst`.
pub fn encode_frame(message: &ServiceMessage, dst: &mut BytesMut) {
    let start = dst.len();
    dst.put_u32(0);
    message.encode(dst);
    let body_len = (dst.len() - start - FRAME_HEADER_LEN) as u32;
    dst[start..start + FRAME_HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
}

/// Takes the next frame off `src`.
///
/// Returns `Ok(None)` without consuming anything while the frame is
/// incomplete. A complete frame is always consumed, even when its body fails
/// to decode, so the next frame can still be read.
pub fn decode_frame(
    src: &mut BytesMut,
    max_frame_len: usize,
) -> Result<Option<ServiceMessage>, DecodeError> {
    if src.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
    let body_len = u32::from_be_bytes(header) as usize;

    if body_len > max_frame_len {
        return Err(DecodeError::FrameTooLarge {
            len: body_len,
            max: max_frame_len,
        });
    }

    if src.len() < FRAME_HEADER_LEN + body_len {
        src.reserve(FRAME_HEADER_LEN + body_len - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_LEN);
    let body = src.split_to(body_len).freeze();
    ServiceMessage::decode(&body).map(Some)
}

/// Lengths above `i32::MAX` cannot be framed. Callers stay under
/// `max_frame_len`, which the reading side enforces anyway.
fn len_i32(len: usize) -> i32 {
    debug_assert!(len <= i32::MAX as usize, "length {len} does not fit a frame field");
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_i32(len_i32(value.len()));
    dst.put_slice(value);
}

fn put_payload(dst: &mut BytesMut, payload: &Payload) {
    dst.put_i32(payload.serializer.0);
    put_bytes(dst, &payload.data);
}

fn put_opt<T: ?Sized>(dst: &mut BytesMut, value: Option<&T>, put: impl FnOnce(&mut BytesMut, &T)) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put(dst, value);
        }
        None => dst.put_u8(0),
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
}

impl WireReader<'_> {
    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        let len = self.i32()?;
        usize::try_from(len).map_err(|_| DecodeError::NegativeLength(len))
    }

    fn bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.len()?;
        self.need(len)?;
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(Bytes::copy_from_slice(value))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn payload(&mut self) -> Result<Payload, DecodeError> {
        let serializer = SerializerId(self.i32()?);
        Ok(Payload {
            serializer,
            data: self.bytes()?,
        })
    }

    fn opt<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Option<T>, DecodeError> {
        match self.u8()? {
            0 => Ok(None),
            1 => read(self).map(Some),
            other => Err(DecodeError::InvalidPresence(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(call: CallKind, app_name: Option<&str>) -> ServiceMessage {
        ServiceMessage::Request(ServiceRequest {
            transaction_id: 10_001,
            service_name: "AgentControl".to_string(),
            method_name: "dumpThreads".to_string(),
            app_name: app_name.map(str::to_string),
            serializer: SerializerId::BINCODE,
            args: vec![Bytes::from_static(b"\x01\x02"), Bytes::new()],
            call,
        })
    }

    fn round_trip(message: ServiceMessage) {
        let mut buf = BytesMut::new();
        encode_frame(&message, &mut buf);
        let decoded = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(decoded, Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(request(CallKind::Unary, Some("order-service")));
        round_trip(request(CallKind::Unary, None));
        round_trip(request(CallKind::Oneway, None));
        round_trip(request(CallKind::Streaming, Some("agent")));
        round_trip(ServiceMessage::Response(ServiceResponse {
            transaction_id: 7,
            server_response_at: 1_700_000_000_000,
            body: ResponseBody::Returning(Payload {
                serializer: SerializerId::JSON,
                data: Bytes::from_static(b"\"ok\""),
            }),
        }));
        round_trip(ServiceMessage::Response(ServiceResponse {
            transaction_id: 8,
            server_response_at: 0,
            body: ResponseBody::Exception("bad request: no such method".to_string()),
        }));
        round_trip(ServiceMessage::Response(ServiceResponse {
            transaction_id: 9,
            server_response_at: -1,
            body: ResponseBody::Void,
        }));
        round_trip(ServiceMessage::StreamingData(ServiceStreamingData {
            transaction_id: 11,
            payload: Payload {
                serializer: SerializerId(77),
                data: Bytes::from_static(b"sample"),
            },
        }));
        round_trip(ServiceMessage::StreamingEnd(ServiceStreamingEnd {
            transaction_id: 12,
            exception: None,
        }));
        round_trip(ServiceMessage::StreamingEnd(ServiceStreamingEnd {
            transaction_id: 12,
            exception: Some("profiler stopped".to_string()),
        }));
        round_trip(ServiceMessage::StreamingCancel(ServiceStreamingCancel {
            transaction_id: 13,
        }));
    }

    #[test]
    fn message_type_is_the_first_field() {
        let mut buf = BytesMut::new();
        request(CallKind::Streaming, None).encode(&mut buf);
        assert_eq!(
            &buf[..4],
            &MessageType::ClientStreamingRequest.as_i32().to_be_bytes()
        );
        assert_eq!(&buf[4..12], &10_001u64.to_be_bytes());
    }

    #[test]
    fn oneway_is_carried_by_the_message_type() {
        let mut unary = BytesMut::new();
        request(CallKind::Unary, None).encode(&mut unary);
        let mut oneway = BytesMut::new();
        request(CallKind::Oneway, None).encode(&mut oneway);

        assert_eq!(unary.len(), oneway.len());
        assert_ne!(&unary[..4], &oneway[..4]);
        assert_eq!(&unary[4..], &oneway[4..]);
        // The body ends with the last argument: an empty one.
        assert_eq!(&unary[unary.len() - 4..], &0i32.to_be_bytes());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "does not fit a frame field")]
    fn oversized_length_is_not_silently_truncated() {
        len_i32(i32::MAX as usize + 1);
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let mut full = BytesMut::new();
        encode_frame(&request(CallKind::Unary, None), &mut full);

        for cut in [0, 2, FRAME_HEADER_LEN, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(decode_frame(&mut partial, DEFAULT_MAX_FRAME_LEN), Ok(None));
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn malformed_frame_consumes_only_itself() {
        let mut buf = BytesMut::new();
        buf.put_u32(12);
        buf.put_i32(999);
        buf.put_u64(1);
        encode_frame(
            &ServiceMessage::StreamingCancel(ServiceStreamingCancel { transaction_id: 2 }),
            &mut buf,
        );

        assert_eq!(
            decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN),
            Err(DecodeError::UnknownMessageType(999))
        );
        let next = decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(next.map(|message| message.transaction_id()), Some(2));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut body = BytesMut::new();
        request(CallKind::Unary, None).encode(&mut body);
        let err = ServiceMessage::decode(&body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert_eq!(
            decode_frame(&mut buf, 512),
            Err(DecodeError::FrameTooLarge { len: 1024, max: 512 })
        );
    }

    #[test]
    fn response_with_exception_and_value_is_rejected() {
        let mut body = BytesMut::new();
        body.put_i32(MessageType::ServerResponse.as_i32());
        body.put_u64(3);
        body.put_i64(0);
        body.put_u8(1);
        put_str(&mut body, "boom");
        body.put_u8(1);
        put_payload(
            &mut body,
            &Payload {
                serializer: SerializerId::JSON,
                data: Bytes::from_static(b"1"),
            },
        );
        assert_eq!(
            ServiceMessage::decode(&body),
            Err(DecodeError::ConflictingResponse)
        );
    }

    #[test]
    fn legacy_request_has_no_app_name() {
        let mut body = BytesMut::new();
        body.put_i32(MessageType::ClientRequest.as_i32());
        body.put_u64(5);
        put_str(&mut body, "Config");
        put_str(&mut body, "fetch");
        body.put_i32(SerializerId::JSON.0);
        body.put_i32(0);

        let ServiceMessage::Request(request) = ServiceMessage::decode(&body).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.call, CallKind::Unary);
        assert_eq!(request.app_name, None);
        assert!(request.args.is_empty());
        // Re-encoded requests always use the v2 layout.
        assert_eq!(request.message_type(), MessageType::ClientRequestV2);
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut body = BytesMut::new();
        body.put_i32(MessageType::ServerStreamingEnd.as_i32());
        body.put_u64(5);
        body.put_u8(1);
        body.put_i32(-4);
        assert_eq!(
            ServiceMessage::decode(&body),
            Err(DecodeError::NegativeLength(-4))
        );
    }
}
