//! JSON serializer.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::errors::SerializationError;

/// Human-readable serializer; the default choice for relational adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            kind: std::any::type_name::<T>(),
            source: e.into(),
        })
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            kind: std::any::type_name::<T>(),
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_map() {
        let value = serde_json::json!({"a": 1, "b": [true, null]});
        let bytes = JsonSerializer.to_bytes(&value).unwrap();
        let back: serde_json::Value = JsonSerializer.from_bytes(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn corrupt_input_reports_a_decode_error() {
        let err = JsonSerializer
            .from_bytes::<serde_json::Value>(b"{not json")
            .unwrap_err();
        assert!(matches!(err, SerializationError::Decode { .. }));
    }
}
