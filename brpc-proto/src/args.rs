//! Typed argument tuples.
//!
//! Every method takes its arguments as a tuple. The tuple is encoded element by
//! element with the request's serializer, so the receiver can check the count
//! before it decodes anything.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::serializer::{SerializeError, SerializerId};

pub trait Args: Sized + Send + 'static {
    const ARITY: usize;

    fn type_names() -> Vec<&'static str>;

    fn encode(&self, serializer: SerializerId) -> Result<Vec<Bytes>, SerializeError>;

    fn decode(serializer: SerializerId, args: &[Bytes]) -> Result<Self, ArgsError>;
}

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("expected {expected} arguments, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("argument {index} ({type_name}) could not be decoded: {source}")]
    Decode {
        index: usize,
        type_name: &'static str,
        #[source]
        source: SerializeError,
    },
}

macro_rules! impl_args {
    ($arity:expr; $($name:ident: $idx:tt),*) => {
        impl<$($name,)*> Args for ($($name,)*)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$name>(),)*]
            }

            fn encode(&self, serializer: SerializerId) -> Result<Vec<Bytes>, SerializeError> {
                let _ = serializer;
                Ok(vec![$(serializer.serialize(&self.$idx)?,)*])
            }

            fn decode(serializer: SerializerId, args: &[Bytes]) -> Result<Self, ArgsError> {
                if args.len() != Self::ARITY {
                    return Err(ArgsError::CountMismatch {
                        expected: Self::ARITY,
                        actual: args.len(),
                    });
                }
                let _ = serializer;
                Ok(($(
                    serializer
                        .deserialize::<$name>(&args[$idx])
                        .map_err(|source| ArgsError::Decode {
                            index: $idx,
                            type_name: std::any::type_name::<$name>(),
                            source,
                        })?,
                )*))
            }
        }
    };
}

impl_args!(0;);
impl_args!(1; A: 0);
impl_args!(2; A: 0, B: 1);
impl_args!(3; A: 0, B: 1, C: 2);
impl_args!(4; A: 0, B: 1, C: 2, D: 3);
impl_args!(5; A: 0, B: 1, C: 2, D: 3, E: 4);
impl_args!(6; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_args!(7; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_args!(8; A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
