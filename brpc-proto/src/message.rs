use bytes::Bytes;

use crate::serializer::SerializerId;

/// Discriminator written as the first field of every frame.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Legacy unary request, laid out without the app name field.
    ClientRequest = 1,
    ClientRequestOneway = 2,
    ClientRequestV2 = 3,
    ClientStreamingRequest = 4,
    ClientStreamingCancel = 5,
    ServerResponse = 101,
    ServerStreamingData = 102,
    ServerStreamingEnd = 103,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => MessageType::ClientRequest,
            2 => MessageType::ClientRequestOneway,
            3 => MessageType::ClientRequestV2,
            4 => MessageType::ClientStreamingRequest,
            5 => MessageType::ClientStreamingCancel,
            101 => MessageType::ServerResponse,
            102 => MessageType::ServerStreamingData,
            103 => MessageType::ServerStreamingEnd,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::ClientRequest
                | MessageType::ClientRequestOneway
                | MessageType::ClientRequestV2
                | MessageType::ClientStreamingRequest
        )
    }
}

/// Every frame exchanged on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    Request(ServiceRequest),
    Response(ServiceResponse),
    StreamingData(ServiceStreamingData),
    StreamingEnd(ServiceStreamingEnd),
    StreamingCancel(ServiceStreamingCancel),
}

impl ServiceMessage {
    pub fn transaction_id(&self) -> u64 {
        match self {
            ServiceMessage::Request(request) => request.transaction_id,
            ServiceMessage::Response(response) => response.transaction_id,
            ServiceMessage::StreamingData(data) => data.transaction_id,
            ServiceMessage::StreamingEnd(end) => end.transaction_id,
            ServiceMessage::StreamingCancel(cancel) => cancel.transaction_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ServiceMessage::Request(request) => request.message_type(),
            ServiceMessage::Response(_) => MessageType::ServerResponse,
            ServiceMessage::StreamingData(_) => MessageType::ServerStreamingData,
            ServiceMessage::StreamingEnd(_) => MessageType::ServerStreamingEnd,
            ServiceMessage::StreamingCancel(_) => MessageType::ClientStreamingCancel,
        }
    }
}

/// How the caller expects the server to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallKind {
    #[default]
    Unary,
    /// Fire and forget: the server never writes a response.
    Oneway,
    /// The server answers with data frames terminated by an end frame.
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub transaction_id: u64,
    pub service_name: String,
    /// Wire name of the method, after any naming override.
    pub method_name: String,
    pub app_name: Option<String>,
    pub serializer: SerializerId,
    /// Arguments, each already encoded with `serializer`.
    pub args: Vec<Bytes>,
    pub call: CallKind,
}

impl ServiceRequest {
    pub fn is_oneway(&self) -> bool {
        self.call == CallKind::Oneway
    }

    pub fn is_streaming(&self) -> bool {
        self.call == CallKind::Streaming
    }

    pub fn message_type(&self) -> MessageType {
        match self.call {
            CallKind::Unary => MessageType::ClientRequestV2,
            CallKind::Oneway => MessageType::ClientRequestOneway,
            CallKind::Streaming => MessageType::ClientStreamingRequest,
        }
    }
}

/// A serializer-tagged encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub serializer: SerializerId,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Successful call without a return value.
    Void,
    Returning(Payload),
    Exception(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub transaction_id: u64,
    /// Server completion time, milliseconds since the unix epoch.
    pub server_response_at: i64,
    pub body: ResponseBody,
}

impl ServiceResponse {
    pub fn returning(&self) -> Option<&Payload> {
        match &self.body {
            ResponseBody::Returning(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStreamingData {
    pub transaction_id: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStreamingEnd {
    pub transaction_id: u64,
    pub exception: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStreamingCancel {
    pub transaction_id: u64,
}
