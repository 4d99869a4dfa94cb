use crate::error::StoreError;
use crate::store::MetadataKey;
use containers::{BlockNumber, Hash256};
use serde::{de::DeserializeOwned, Serialize};

const HASH_LENGTH: usize = 32;

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(record)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Chain levels are keyed by big-endian block number.
pub fn number_key(number: BlockNumber) -> [u8; 8] {
    number.to_be_bytes()
}

pub fn decode_number(key: MetadataKey, bytes: &[u8]) -> Result<BlockNumber, StoreError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| StoreError::MalformedMetadata {
        key: key.name(),
        len: bytes.len(),
    })?;
    Ok(BlockNumber::from_be_bytes(array))
}

pub fn decode_hash(key: MetadataKey, bytes: &[u8]) -> Result<Hash256, StoreError> {
    if bytes.len() != HASH_LENGTH {
        return Err(StoreError::MalformedMetadata {
            key: key.name(),
            len: bytes.len(),
        });
    }
    Ok(Hash256::from_slice(bytes))
}
