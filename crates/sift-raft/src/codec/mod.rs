//! Log payload codec.
//!
//! The single source of truth for the wire format of replicated writes:
//! whatever [`encode_request`] produces is what every node of the cluster,
//! at any point in the log's lifetime, must be able to decode.

mod request_codec;

pub use request_codec::{
    decode_request, encode_request, route_hash, ReplicatedRequest, StoredResponse,
    ROUTE_ALREADY_HANDLED,
};
