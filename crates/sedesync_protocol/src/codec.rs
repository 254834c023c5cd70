//! CBOR encoding for protocol values.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serializable value to CBOR bytes.
pub fn encode_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// A message that travels as a CBOR body.
pub trait CborMessage: Serialize + DeserializeOwned {
    /// Encodes to CBOR bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}
