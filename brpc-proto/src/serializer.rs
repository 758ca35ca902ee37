use std::{any::TypeId, fmt};

use bytes::Bytes;
use serde::{
    Deserialize, Serialize,
    de::{DeserializeOwned, value::UnitDeserializer},
};
use thiserror::Error;

use crate::message::Payload;

#[cfg(feature = "bincode")]
use crate::bincode::{BincodeError, BincodeSerializer};
#[cfg(feature = "json")]
use crate::json::JsonSerializer;

/// Encodes values against a declared type.
pub trait Serializer {
    /// Identifier carried on the wire next to every payload.
    const ID: SerializerId;

    type Error: std::error::Error + Send + Sync + 'static;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, Self::Error>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// Wire identifier of a [`Serializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerializerId(pub i32);

impl SerializerId {
    pub const JSON: SerializerId = SerializerId(1);
    pub const BINCODE: SerializerId = SerializerId(2);

    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, SerializeError> {
        match self {
            #[cfg(feature = "json")]
            SerializerId::JSON => Ok(JsonSerializer.serialize(value)?),
            #[cfg(feature = "bincode")]
            SerializerId::BINCODE => Ok(BincodeSerializer.serialize(value)?),
            other => {
                let _ = value;
                Err(SerializeError::Unsupported(other))
            }
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, SerializeError> {
        match self {
            #[cfg(feature = "json")]
            SerializerId::JSON => Ok(JsonSerializer.deserialize(bytes)?),
            #[cfg(feature = "bincode")]
            SerializerId::BINCODE => Ok(BincodeSerializer.deserialize(bytes)?),
            other => {
                let _ = bytes;
                Err(SerializeError::Unsupported(other))
            }
        }
    }
}

impl Default for SerializerId {
    fn default() -> Self {
        SerializerId::JSON
    }
}

impl fmt::Display for SerializerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SerializerId::JSON => f.write_str("json"),
            SerializerId::BINCODE => f.write_str("bincode"),
            SerializerId(other) => write!(f, "serializer#{other}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("{0} is not available")]
    Unsupported(SerializerId),
    #[error("no value was returned: {0}")]
    MissingValue(serde::de::value::Error),
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "bincode")]
    #[error(transparent)]
    Bincode(#[from] BincodeError),
}

impl Payload {
    pub fn encode<T: Serialize + ?Sized>(
        serializer: SerializerId,
        value: &T,
    ) -> Result<Self, SerializeError> {
        Ok(Payload {
            serializer,
            data: serializer.serialize(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializeError> {
        self.serializer.deserialize(&self.data)
    }
}

/// Encodes a return value; `()` has no payload on the wire.
pub fn encode_returning<R: Serialize + 'static>(
    serializer: SerializerId,
    value: &R,
) -> Result<Option<Payload>, SerializeError> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        return Ok(None);
    }
    Payload::encode(serializer, value).map(Some)
}

/// Decodes a return value. An absent payload decodes as unit, which
/// satisfies `()` and `Option<_>`.
pub fn decode_returning<R: DeserializeOwned>(payload: Option<&Payload>) -> Result<R, SerializeError> {
    match payload {
        Some(payload) => payload.decode(),
        None => R::deserialize(UnitDeserializer::<serde::de::value::Error>::new())
            .map_err(SerializeError::MissingValue),
    }
}
