//! CBOR row codec.
//!
//! Rows are stored as opaque CBOR bytes; typed access goes through serde.

use crate::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| StorageError::codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn value_survives_encoding() {
        let value = Value::object([
            ("name", Value::from("inbox")),
            ("count", Value::Integer(-3)),
            ("tags", Value::Array(vec![Value::from("a"), Value::Null])),
        ]);
        let bytes = encode(&value).unwrap();
        let decoded: Value = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let result: StorageResult<Value> = decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(StorageError::Codec(_))));
    }
}
