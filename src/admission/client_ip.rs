//! Client IP resolution from proxy headers.

use std::collections::HashMap;

/// Headers consulted in order before falling back to the peer address.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "proxy-client-ip", "wl-proxy-client-ip"];

/// Returned when no source yields an address.
pub const UNKNOWN_IP: &str = "unknown";

/// Resolve the client IP for a request.
///
/// Header names are matched case-insensitively. A header value may be a
/// comma-separated proxy chain, in which case the first entry is the client.
/// Empty values and the literal `unknown` are skipped.
pub fn resolve_client_ip(headers: &HashMap<String, String>, remote_addr: Option<&str>) -> String {
    for name in CLIENT_IP_HEADERS {
        let value = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| first_hop(value));
        if let Some(ip) = value {
            return ip.to_string();
        }
    }

    remote_addr
        .and_then(first_hop)
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

fn first_hop(value: &str) -> Option<&str> {
    let first = value.split(',').next()?.trim();
    if first.is_empty() || first.eq_ignore_ascii_case(UNKNOWN_IP) {
        None
    } else {
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let h = headers(&[("X-Forwarded-For", "203.0.113.7, 10.0.0.2, 10.0.0.3")]);
        assert_eq!(resolve_client_ip(&h, Some("10.0.0.9")), "203.0.113.7");
    }

    #[test]
    fn test_header_precedence() {
        let h = headers(&[
            ("WL-Proxy-Client-IP", "192.0.2.3"),
            ("Proxy-Client-IP", "192.0.2.2"),
        ]);
        assert_eq!(resolve_client_ip(&h, None), "192.0.2.2");
    }

    #[test]
    fn test_unknown_and_empty_skipped() {
        let h = headers(&[
            ("x-forwarded-for", "unknown"),
            ("proxy-client-ip", ""),
            ("wl-proxy-client-ip", "192.0.2.3"),
        ]);
        assert_eq!(resolve_client_ip(&h, None), "192.0.2.3");
    }

    #[test]
    fn test_falls_back_to_remote_addr() {
        let h = headers(&[("x-forwarded-for", "UNKNOWN")]);
        assert_eq!(resolve_client_ip(&h, Some("10.0.0.9")), "10.0.0.9");
    }

    #[test]
    fn test_nothing_available() {
        assert_eq!(resolve_client_ip(&HashMap::new(), None), "unknown");
        assert_eq!(resolve_client_ip(&HashMap::new(), Some("")), "unknown");
    }
}
