use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::serializer::{Serializer, SerializerId};

#[derive(Clone, Copy)]
pub struct BincodeSerializer;

#[derive(Debug, Error)]
pub enum BincodeError {
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
}

impl Serializer for BincodeSerializer {
    const ID: SerializerId = SerializerId::BINCODE;

    type Error = BincodeError;

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, Self::Error> {
        Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?.into())
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        Ok(bincode::serde::decode_from_slice(bytes, bincode::config::standard())?.0)
    }
}
