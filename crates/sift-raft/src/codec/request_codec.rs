use serde::{Deserialize, Serialize};

use sift_commons::constants::INIT_SNAPSHOT_SENTINEL;

use crate::error::ReplicationError;

const REQUEST_WIRE_VERSION: u16 = 1;
const KIND_WRITE_REQUEST: &str = "write_request";

/// Reserved route code: the response is already fully populated and the
/// dispatcher must not re-run any route, only dispose.
pub const ROUTE_ALREADY_HANDLED: u64 = u64::MAX;

/// An HTTP mutation captured as a log payload.
///
/// Carries every field the mutation handlers consult; transport-level
/// artifacts (peer address, streaming state) are deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedRequest {
    /// One of POST, PUT, PATCH, DELETE. Empty for sentinel entries.
    pub method: String,
    pub path: String,
    pub query: String,
    /// Ordered name/value pairs, routing- and auth-relevant only.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Stable hash of the matched route, or a reserved code.
    pub route_hash: u64,
    /// Opaque id correlating this entry with its originating submission.
    pub request_id: String,
}

impl ReplicatedRequest {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        route_hash: u64,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body,
            route_hash,
            request_id: request_id.into(),
        }
    }

    /// The distinguished entry that triggers a one-shot snapshot instead of
    /// a mutation. It never originates from an HTTP request, hence the empty
    /// method and path.
    pub fn init_snapshot() -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            query: String::new(),
            headers: Vec::new(),
            body: INIT_SNAPSHOT_SENTINEL.to_vec(),
            route_hash: 0,
            request_id: String::new(),
        }
    }

    pub fn is_init_snapshot(&self) -> bool {
        self.method.is_empty() && self.body == INIT_SNAPSHOT_SENTINEL
    }

    /// First header value with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn last_path_segment(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Response produced by a mutation handler, carried back to whichever side
/// owns delivery to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status_code,
            content_type: content_type.into(),
            body,
        }
    }

    /// A JSON response with the given status.
    pub fn json(status_code: u16, value: &serde_json::Value) -> Self {
        Self::new(
            status_code,
            "application/json",
            serde_json::to_vec(value).unwrap_or_default(),
        )
    }

    /// A `500` response with a JSON `message` body.
    pub fn server_error(message: &str) -> Self {
        Self::json(500, &serde_json::json!({ "message": message }))
    }

    pub fn not_found(message: &str) -> Self {
        Self::json(404, &serde_json::json!({ "message": message }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TypedEnvelope<T> {
    v: u16,
    kind: String,
    payload: T,
}

/// Serialize a request into the self-describing byte string carried in the
/// log.
pub fn encode_request(request: &ReplicatedRequest) -> Result<Vec<u8>, ReplicationError> {
    let envelope = TypedEnvelope {
        v: REQUEST_WIRE_VERSION,
        kind: KIND_WRITE_REQUEST.to_string(),
        payload: request,
    };
    flexbuffers::to_vec(&envelope).map_err(|e| ReplicationError::Serialization(e.to_string()))
}

/// Inverse of [`encode_request`]. Rejects payloads of a different wire
/// version or kind.
pub fn decode_request(bytes: &[u8]) -> Result<ReplicatedRequest, ReplicationError> {
    let envelope: TypedEnvelope<ReplicatedRequest> = flexbuffers::from_slice(bytes)
        .map_err(|e| ReplicationError::Serialization(e.to_string()))?;

    if envelope.v != REQUEST_WIRE_VERSION {
        return Err(ReplicationError::Serialization(format!(
            "Unsupported request codec version: {} (expected {})",
            envelope.v, REQUEST_WIRE_VERSION
        )));
    }

    if envelope.kind != KIND_WRITE_REQUEST {
        return Err(ReplicationError::Serialization(format!(
            "Unexpected payload kind: '{}' (expected '{}')",
            envelope.kind, KIND_WRITE_REQUEST
        )));
    }

    Ok(envelope.payload)
}

/// Stable hash of a route, computed once at registration time and embedded
/// in the log. 64-bit FNV-1a over `"METHOD pattern"`; must never change, or
/// old log entries stop dispatching.
pub fn route_hash(method: &str, pattern: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in method.bytes().chain([b' ']).chain(pattern.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ReplicatedRequest {
        ReplicatedRequest::new(
            "POST",
            "/collections/products/documents",
            "dirty_values=reject",
            vec![
                ("x-sift-api-key".to_string(), "abcd".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            br#"{"id":"1","title":"shoe"}"#.to_vec(),
            route_hash("POST", "/collections/{collection}/documents"),
            "req-42",
        )
    }

    #[test]
    fn roundtrip_preserves_all_fields() {
        let request = sample_request();
        let bytes = encode_request(&request).expect("encode");
        let decoded = decode_request(&bytes).expect("decode");
        assert_eq!(request, decoded);
    }

    #[test]
    fn roundtrip_preserves_binary_body() {
        let mut request = sample_request();
        request.body = vec![0x00, 0xFF, 0x7F, 0x80, 0x0A];
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded.body, request.body);
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let envelope = TypedEnvelope {
            v: REQUEST_WIRE_VERSION + 1,
            kind: KIND_WRITE_REQUEST.to_string(),
            payload: sample_request(),
        };
        let bytes = flexbuffers::to_vec(&envelope).unwrap();
        let err = decode_request(&bytes).expect_err("should reject version");
        assert!(err.to_string().contains("Unsupported request codec version"));
    }

    #[test]
    fn decode_rejects_wrong_kind() {
        let envelope = TypedEnvelope {
            v: REQUEST_WIRE_VERSION,
            kind: "something_else".to_string(),
            payload: sample_request(),
        };
        let bytes = flexbuffers::to_vec(&envelope).unwrap();
        let err = decode_request(&bytes).expect_err("should reject kind");
        assert!(err.to_string().contains("Unexpected payload kind"));
    }

    #[test]
    fn init_snapshot_sentinel_is_detected() {
        let sentinel = ReplicatedRequest::init_snapshot();
        assert!(sentinel.is_init_snapshot());

        let decoded = decode_request(&encode_request(&sentinel).unwrap()).unwrap();
        assert!(decoded.is_init_snapshot());

        // A genuine request whose body happens to be the sentinel text is
        // not a sentinel: it has a method.
        let mut request = sample_request();
        request.body = b"INIT_SNAPSHOT".to_vec();
        assert!(!request.is_init_snapshot());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = sample_request();
        assert_eq!(request.header("X-Sift-Api-Key"), Some("abcd"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn route_hash_is_stable_and_distinct() {
        let a = route_hash("POST", "/collections");
        let b = route_hash("POST", "/collections");
        let c = route_hash("DELETE", "/collections");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ROUTE_ALREADY_HANDLED);
        // Pinned: changing the hash function breaks old logs.
        assert_eq!(route_hash("POST", "/collections"), {
            // independently computed FNV-1a of "POST /collections"
            let mut h: u64 = 0xcbf29ce484222325;
            for b in "POST /collections".bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            h
        });
    }

    #[test]
    fn last_path_segment() {
        let mut request = sample_request();
        request.path = "/collections/products/documents/import".to_string();
        assert_eq!(request.last_path_segment(), "import");
    }
}
