pub mod args;
pub mod codec;
pub mod connection_state;
pub mod message;
pub mod serializer;

#[cfg(feature = "bincode")]
pub mod bincode;
#[cfg(feature = "json")]
pub mod json;
