//! Payload serialization for peering RPCs.
//!
//! flexbuffers is schema-less and works with any serde type, which keeps
//! the transport oblivious to openraft's message shapes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ReplicationError;

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, ReplicationError> {
    flexbuffers::to_vec(value).map_err(|e| ReplicationError::Serialization(e.to_string()))
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ReplicationError> {
    flexbuffers::from_slice(bytes).map_err(|e| ReplicationError::Serialization(e.to_string()))
}
