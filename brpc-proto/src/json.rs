use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::serializer::{Serializer, SerializerId};

#[derive(Debug, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    const ID: SerializerId = SerializerId::JSON;

    type Error = serde_json::Error;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, Self::Error> {
        Ok(serde_json::to_vec(value)?.into())
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}
