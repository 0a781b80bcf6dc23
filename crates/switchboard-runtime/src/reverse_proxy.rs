//! Framework-agnostic reverse-proxy forwarding.
//!
//! A `Process` exposes a reverse-proxy entry point; this module is that
//! entry point's actual I/O. `switchboard-proxy` only translates `axum`
//! request/response values to/from the small types defined here — the
//! header filtering, SSE buffering-disable and streaming-body logic live
//! here, built against the framework-agnostic `http` crate types so this
//! crate never depends on `axum`.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use switchboard_core::CoreError;

/// Headers that must not be forwarded verbatim in either direction
/// (hop-by-hop, plus `host`/`content-length`/`authorization` which the
/// upstream child should not see).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "authorization",
];

fn should_forward_header(name: &str) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

/// An inbound request, already stripped of anything framework-specific.
/// `switchboard-proxy` builds this from an `axum` request without
/// buffering the body beyond what its own JSON-extraction already read.
pub struct ProxyRequest {
    pub method: Method,
    /// Original path and query string, appended verbatim to the
    /// upstream base URL to form the forwarded request's target URL.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The body of a [`ProxyResponse`]: either fully buffered (used for
/// error bodies and anything the caller wants to inspect) or a live
/// byte stream (the common case — keeps the reverse proxy from
/// buffering the upstream's response).
pub enum ProxyBody {
    Buffered(Bytes),
    Streamed(Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>),
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

/// Forward `req` to `upstream_base + req.path_and_query` and return the
/// upstream's response as a stream. Content-type `text/event-stream` gets
/// the extra no-buffering response headers the teacher's
/// `forward_streaming_response` set for SSE.
pub async fn forward(
    client: &reqwest::Client,
    upstream_base: &str,
    req: ProxyRequest,
) -> Result<ProxyResponse, CoreError> {
    let url = format!("{}{}", upstream_base.trim_end_matches('/'), req.path_and_query);

    let reqwest_method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
        .map_err(|e| CoreError::UpstreamError(format!("invalid method: {e}")))?;

    let mut builder = client.request(reqwest_method, &url);
    for (name, value) in &req.headers {
        if should_forward_header(name.as_str())
            && let Ok(value_str) = value.to_str()
        {
            builder = builder.header(name.as_str(), value_str);
        }
    }
    builder = builder.body(req.body);

    let response = builder
        .send()
        .await
        .map_err(|e| CoreError::UpstreamError(e.to_string()))?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let is_sse = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    if is_sse {
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let byte_stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));

    Ok(ProxyResponse {
        status,
        headers,
        body: ProxyBody::Streamed(Box::pin(byte_stream)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(!should_forward_header("connection"));
        assert!(!should_forward_header("Host"));
        assert!(!should_forward_header("Authorization"));
        assert!(should_forward_header("content-type"));
        assert!(should_forward_header("x-request-id"));
    }
}
