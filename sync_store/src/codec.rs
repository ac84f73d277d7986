//! Versioned MessagePack encoding shared by every keyed store, so the
//! on-disk format can grow new fields without a migration tool: decoding
//! branches on the `Vn` variant wrapping each stored value.

use crate::error::StoreError;
use log::warn;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum Versioned<T> {
    V0(T),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec(&Versioned::V0(value)).map_err(StoreError::EncodeError)
}

/// Decodes a stored value. A corrupt entry is treated as absent rather than
/// a fatal error: a missed cache entry is cheap to recompute, a crashed
/// sync cycle is not.
pub fn decode_or_none<T: DeserializeOwned>(bytes: &sled::IVec) -> Option<T> {
    match rmp_serde::from_slice::<Versioned<T>>(bytes) {
        Ok(Versioned::V0(value)) => Some(value),
        Err(err) => {
            warn!("store entry could not be decoded, treating as absent: {err}");
            None
        }
    }
}
