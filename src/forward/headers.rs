//! Header manipulation for forwarded requests and relayed responses.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers, including those named by `Connection`
//! - Append the client address to X-Forwarded-For
//! - Add X-Forwarded-Proto / X-Forwarded-Host when absent
//!
//! # Design Decisions
//! - Existing X-Forwarded-For values are preserved, never overwritten
//! - Headers are rebuilt from the original request on every attempt, so the
//!   chain grows by exactly one entry however many attempts run

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use std::net::IpAddr;

use crate::pool::Destination;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers meaningful only for a single connection leg.
pub const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers and any extension headers listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append `client` to the forwarding chain, keeping every earlier hop.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let mut chain: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    chain.push(client.to_string());

    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Build the header set for one upstream attempt.
pub fn upstream_headers(
    original: &HeaderMap,
    destination: &Destination,
    client: Option<IpAddr>,
    request_id: Option<&str>,
) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(client) = client {
        append_forwarded_for(&mut headers, client);
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if !headers.contains_key(&X_FORWARDED_HOST) {
        if let Some(host) = original.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if !headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(&destination.host_header()) {
            headers.insert(HOST, host);
        }
    }

    if let Some(id) = request_id {
        if let Ok(value) = HeaderValue::from_str(id) {
            headers.insert("x-request-id", value);
        }
    }

    headers
}

/// Clean an upstream response header set before relaying it.
pub fn downstream_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}
