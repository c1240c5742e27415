//! Message serialization.
//!
//! The log codec treats message encoding as a black box: whatever bytes the
//! serializer produces for a message must decode back to the same message.

use cohort_core::Message;

use crate::error::{Result, StoreError};

/// Encodes and decodes fully-typed messages.
///
/// Implementations are shared with worker tasks and must be thread-safe.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

/// CBOR encoding via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl MessageSerializer for CborSerializer {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(message, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
