//! Compact binary serializer (MessagePack).

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::errors::SerializationError;

/// MessagePack serializer; self-describing, so it handles the same tagged
/// payloads as JSON at a fraction of the size.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(value).map_err(|e| SerializationError::Encode {
            kind: std::any::type_name::<T>(),
            source: e.into(),
        })
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::Decode {
            kind: std::any::type_name::<T>(),
            source: e.into(),
        })
    }
}
