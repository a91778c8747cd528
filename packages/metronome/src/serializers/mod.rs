//! Stable, backend-independent entity encodings.
//!
//! A [`Serializer`] turns any serde-modeled value into bytes and back.
//! Persisted payloads travel inside an [`Envelope`] carrying a type tag and a
//! schema version, so a newer consumer can keep reading payloads written by
//! an older producer (and reject the reverse explicitly instead of
//! misreading it).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SerializationError;
use crate::model::{Job, JobResult, Schedule, Task};
use crate::triggers::Trigger;

mod binary;
mod json;

pub use binary::BinarySerializer;
pub use json::JsonSerializer;

/// A reversible byte encoding for serde-modeled values.
///
/// Implementations must be order-stable (the same value always encodes to
/// the same bytes) and must round-trip exactly, including microsecond
/// timestamp precision.
pub trait Serializer: Send + Sync + 'static {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

/// Entities that may be persisted as tagged payloads.
pub trait Persistable {
    /// Stable type tag written into the envelope.
    const KIND: &'static str;
    /// Schema version of this build's encoding.
    const VERSION: u16;
}

impl Persistable for Trigger {
    const KIND: &'static str = "trigger";
    const VERSION: u16 = 1;
}

impl Persistable for Task {
    const KIND: &'static str = "task";
    const VERSION: u16 = 1;
}

impl Persistable for Schedule {
    const KIND: &'static str = "schedule";
    const VERSION: u16 = 1;
}

impl Persistable for Job {
    const KIND: &'static str = "job";
    const VERSION: u16 = 1;
}

impl Persistable for JobResult {
    const KIND: &'static str = "job_result";
    const VERSION: u16 = 1;
}

/// Tagged, versioned payload wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub version: u16,
    pub payload: Vec<u8>,
}

/// Encode a value into a tagged, versioned envelope.
pub fn pack<S, T>(serializer: &S, value: &T) -> Result<Vec<u8>, SerializationError>
where
    S: Serializer,
    T: Serialize + Persistable,
{
    let payload = serializer.to_bytes(value)?;
    serializer.to_bytes(&Envelope {
        kind: T::KIND.to_string(),
        version: T::VERSION,
        payload,
    })
}

/// Decode a value from a tagged envelope, checking the tag and version.
pub fn unpack<S, T>(serializer: &S, bytes: &[u8]) -> Result<T, SerializationError>
where
    S: Serializer,
    T: DeserializeOwned + Persistable,
{
    let envelope: Envelope = serializer.from_bytes(bytes)?;
    if envelope.kind != T::KIND {
        return Err(SerializationError::UnknownKind(envelope.kind));
    }
    if envelope.version > T::VERSION {
        return Err(SerializationError::UnsupportedVersion {
            kind: envelope.kind,
            version: envelope.version,
            supported: T::VERSION,
        });
    }
    serializer.from_bytes(&envelope.payload)
}
