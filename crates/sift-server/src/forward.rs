//! Leader forwarder.
//!
//! A follower that receives a mutation relays it to the current leader over
//! HTTP and hands the leader's response back to the original caller,
//! verbatim. Bulk imports are streamed in both directions; everything else
//! is a buffered relay. No retries happen at this layer; a transport
//! failure becomes the client's response.

use actix_web::http::{Method, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use futures::{SinkExt, StreamExt};

use crate::app::AppState;

const NO_LEADER_MESSAGE: &str = "Could not find a leader.";

/// Relay a buffered mutation to the leader.
pub async fn follower_relay(
    state: &web::Data<AppState>,
    req: &HttpRequest,
    body: Vec<u8>,
) -> HttpResponse {
    let leader_addr = match state.replication.leader_api_addr() {
        Some(addr) => addr,
        None => {
            log::error!("Rejecting write: could not find a leader.");
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "message": NO_LEADER_MESSAGE }));
        }
    };

    let url = leader_url(req, &leader_addr);
    log::info!("Redirecting write to leader at: {}", url);

    let outgoing = match *req.method() {
        Method::POST => state.http_client.post(&url),
        Method::PUT => state.http_client.put(&url),
        Method::DELETE => state.http_client.delete(&url),
        _ => {
            let err = format!(
                "Forwarding for http method not implemented: {}",
                req.method()
            );
            log::error!("{}", err);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "message": err }));
        }
    };

    let outgoing = copy_headers(req, outgoing).body(body);

    match outgoing.send().await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response_content_type(&response);
            let bytes = response.bytes().await.unwrap_or_default();
            HttpResponse::build(status).content_type(content_type).body(bytes)
        }
        Err(e) => {
            log::warn!("Failed to forward write to leader {}: {}", url, e);
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "message": e.to_string() }))
        }
    }
}

/// Relay a bulk import to the leader, streaming the request body up and the
/// leader's response back without buffering either.
///
/// The body stream and the response stream are each owned by exactly one
/// side: the pump task consumes the incoming payload, the response builder
/// consumes the leader's byte stream.
pub async fn relay_import_streaming(
    state: &web::Data<AppState>,
    req: &HttpRequest,
    mut payload: web::Payload,
) -> HttpResponse {
    let leader_addr = match state.replication.leader_api_addr() {
        Some(addr) => addr,
        None => {
            log::error!("Rejecting streamed write: could not find a leader.");
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "message": NO_LEADER_MESSAGE }));
        }
    };

    let url = leader_url(req, &leader_addr);
    log::info!("Streaming import to leader at: {}", url);

    // The actix payload is not Send, so it is pumped into a channel from
    // this task while reqwest drains the receiving end.
    let (mut chunks_tx, chunks_rx) =
        futures::channel::mpsc::channel::<Result<web::Bytes, std::io::Error>>(8);

    let outgoing = copy_headers(req, state.http_client.post(&url))
        .body(reqwest::Body::wrap_stream(chunks_rx));

    let pump = async move {
        while let Some(chunk) = payload.next().await {
            let item = chunk
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
            let failed = item.is_err();
            if chunks_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    };

    let (result, ()) = futures::join!(outgoing.send(), pump);

    match result {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response_content_type(&response);
            log::info!("Import call done.");

            HttpResponse::build(status)
                .content_type(content_type)
                .streaming(response.bytes_stream().map(|chunk| {
                    chunk.map_err(|e| {
                        actix_web::error::ErrorInternalServerError(e.to_string())
                    })
                }))
        }
        Err(e) => {
            log::warn!("Failed to stream import to leader {}: {}", url, e);
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "message": e.to_string() }))
        }
    }
}

/// `scheme://leader_host:leader_api_port/path?query`
fn leader_url(req: &HttpRequest, leader_addr: &str) -> String {
    let scheme = req.connection_info().scheme().to_string();
    let mut url = format!("{}://{}{}", scheme, leader_addr, req.path());
    if !req.query_string().is_empty() {
        url.push('?');
        url.push_str(req.query_string());
    }
    url
}

fn copy_headers(req: &HttpRequest, mut outgoing: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    for name in ["content-type", "authorization", "x-sift-api-key"] {
        if let Some(value) = req.headers().get(name).and_then(|v| v.to_str().ok()) {
            outgoing = outgoing.header(name, value);
        }
    }
    outgoing
}

fn response_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn leader_url_composition() {
        let req = TestRequest::with_uri("/collections/c/documents?dirty_values=reject")
            .to_http_request();
        let url = leader_url(&req, "10.0.0.2:8108");
        assert_eq!(
            url,
            "http://10.0.0.2:8108/collections/c/documents?dirty_values=reject"
        );
    }

    #[test]
    fn leader_url_without_query() {
        let req = TestRequest::with_uri("/collections").to_http_request();
        assert_eq!(leader_url(&req, "n1:8108"), "http://n1:8108/collections");
    }
}
