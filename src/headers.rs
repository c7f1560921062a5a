//! Header rewriting for the forwarding path.
//!
//! Covers the three header-level jobs the pipeline needs before a request
//! crosses to an upstream: dropping connection-scoped headers (RFC 7230
//! Section 6.1), stamping the `X-Forwarded-*` set while retargeting
//! `Host`, and resolving the real client IP for rate limiting.

use std::net::{IpAddr, SocketAddr};

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

/// The connection-scoped set of RFC 7230 Section 6.1. These describe one
/// hop, not the request, so the gateway must not relay them in either
/// direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Drops every hop-by-hop header from `headers`, including any extra
/// names the `Connection` header declares as connection-scoped.
///
/// Applied to requests before forwarding and to upstream responses before
/// they are returned or cached.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in declared {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Retargets an outgoing header map at the selected upstream: records the
/// client in the `X-Forwarded-*` set, then swaps `Host` for the upstream
/// authority.
///
/// The client's address is appended to any `X-Forwarded-For` chain an
/// earlier proxy started. `X-Forwarded-Proto` is always `http` because
/// the gateway terminates no TLS, so every inbound request arrived over
/// plain HTTP. Whatever `Host` the client addressed is preserved in
/// `X-Forwarded-Host` before being overwritten.
pub fn apply_forwarding(headers: &mut HeaderMap, client_addr: SocketAddr, upstream: &Authority) {
    let hop = client_addr.ip().to_string();
    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {hop}"),
        None => hop,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    if let Some(original_host) = headers.remove(header::HOST) {
        headers.insert("x-forwarded-host", original_host);
    }
    if let Ok(value) = HeaderValue::from_str(upstream.as_str()) {
        headers.insert(header::HOST, value);
    }
}

/// Resolves the real client IP for rate limiting and forwarding metadata.
///
/// Honors `X-Real-IP` first, then the first hop of `X-Forwarded-For`,
/// then falls back to the socket address.
pub fn client_ip(headers: &HeaderMap, client_addr: SocketAddr) -> IpAddr {
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }

    client_addr.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in entries {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    fn client() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    fn upstream() -> Authority {
        "backend.internal:3000".parse().unwrap()
    }

    #[test]
    fn connection_scoped_headers_do_not_cross_the_gateway() {
        let mut headers = map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("upgrade", "websocket"),
            ("content-type", "application/json"),
        ]);

        strip_hop_by_hop(&mut headers);

        for name in HOP_BY_HOP {
            assert!(!headers.contains_key(name), "{name} must be dropped");
        }
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn connection_header_names_extra_victims() {
        let mut headers = map(&[
            ("connection", "x-internal-token, x-trace-debug"),
            ("x-internal-token", "abc"),
            ("x-trace-debug", "on"),
            ("x-request-tag", "kept"),
        ]);

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("x-internal-token"));
        assert!(!headers.contains_key("x-trace-debug"));
        assert!(headers.contains_key("x-request-tag"));
    }

    #[test]
    fn forwarding_records_the_client_and_retargets_host() {
        let mut headers = map(&[("host", "gw.example.com")]);

        apply_forwarding(&mut headers, client(), &upstream());

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "192.168.1.10");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gw.example.com");
        assert_eq!(headers.get("host").unwrap(), "backend.internal:3000");
    }

    #[test]
    fn forwarding_appends_to_an_existing_chain() {
        let mut headers = map(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);

        apply_forwarding(&mut headers, client(), &upstream());

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.1, 10.0.0.2, 192.168.1.10"
        );
    }

    #[test]
    fn no_forwarded_host_without_an_original_host() {
        let mut headers = HeaderMap::new();

        apply_forwarding(&mut headers, client(), &upstream());

        assert!(!headers.contains_key("x-forwarded-host"));
        assert_eq!(
            headers.get("host").unwrap(),
            "backend.internal:3000",
            "host still points at the upstream"
        );
    }

    #[test]
    fn client_ip_prefers_x_real_ip() {
        let headers = map(&[("x-real-ip", "203.0.113.9"), ("x-forwarded-for", "10.0.0.1")]);

        assert_eq!(
            client_ip(&headers, client()),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_ip_uses_first_forwarded_hop() {
        let headers = map(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);

        assert_eq!(
            client_ip(&headers, client()),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn client_ip_falls_back_to_socket() {
        assert_eq!(
            client_ip(&HeaderMap::new(), client()),
            "192.168.1.10".parse::<IpAddr>().unwrap()
        );
    }
}
