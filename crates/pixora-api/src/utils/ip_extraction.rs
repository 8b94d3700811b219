//! Client IP extraction
//!
//! Secure extraction of the client address from proxy headers. The extracted
//! address is still raw at this point; identity resolution normalizes it into
//! the /24 grouping key before it touches the ledger.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Sentinel returned when no usable address can be extracted. Identity
/// resolution treats it as a placeholder and rejects the request as malformed.
pub const UNKNOWN_IP: &str = "unknown";

/// Extract and validate the client IP from request headers.
///
/// Behind a load balancer the `X-Forwarded-For` header carries a chain of
/// addresses `client, proxy1, proxy2, ...`; with `trusted_proxy_count`
/// trusted hops at the end of the chain, the client is the entry just before
/// them. Falls back to `X-Real-IP`, then to the socket address.
pub fn extract_client_ip(
    headers: &HeaderMap,
    socket_addr: Option<&std::net::SocketAddr>,
    trusted_proxy_count: usize,
) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(header_value) = forwarded_for.to_str() {
            let ip = extract_from_forwarded_for(header_value, trusted_proxy_count);
            if ip != UNKNOWN_IP {
                return ip;
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(header_value) = real_ip.to_str() {
            let trimmed = header_value.trim();
            if is_valid_ip(trimmed) {
                return trimmed.to_string();
            }
        }
    }

    if let Some(addr) = socket_addr {
        return addr.ip().to_string();
    }

    UNKNOWN_IP.to_string()
}

/// Pick the client entry out of an `X-Forwarded-For` chain.
///
/// With zero trusted proxies the header cannot be trusted at all; the last
/// entry (closest hop) is used after validation. Otherwise the entry before
/// the trusted suffix is the client.
fn extract_from_forwarded_for(header_value: &str, trusted_proxy_count: usize) -> String {
    let ips: Vec<&str> = header_value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    if ips.is_empty() {
        return UNKNOWN_IP.to_string();
    }

    let candidate = if trusted_proxy_count == 0 || ips.len() <= trusted_proxy_count {
        // Either nothing is trusted, or the chain is shorter than the trusted
        // suffix (misconfigured proxy); use the closest hop.
        ips.last().copied().unwrap_or("")
    } else {
        let client_pos = ips.len().saturating_sub(trusted_proxy_count + 1);
        ips.get(client_pos).copied().unwrap_or("")
    };

    if is_valid_ip(candidate) {
        candidate.to_string()
    } else {
        UNKNOWN_IP.to_string()
    }
}

fn is_valid_ip(ip_str: &str) -> bool {
    ip_str.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_xff(xff_value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(xff_value).unwrap());
        headers
    }

    #[test]
    fn test_single_ip() {
        assert_eq!(extract_from_forwarded_for("192.168.1.1", 0), "192.168.1.1");
        assert_eq!(extract_from_forwarded_for("192.168.1.1", 1), "192.168.1.1");
    }

    #[test]
    fn test_client_before_trusted_proxy() {
        assert_eq!(
            extract_from_forwarded_for("192.168.1.1, 10.0.0.1", 1),
            "192.168.1.1"
        );
        assert_eq!(
            extract_from_forwarded_for("192.168.1.1, 10.0.0.1, 10.0.0.2", 2),
            "192.168.1.1"
        );
    }

    #[test]
    fn test_untrusted_chain_uses_closest_hop() {
        assert_eq!(
            extract_from_forwarded_for("192.168.1.1, 10.0.0.1", 0),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_invalid_entries_yield_unknown() {
        assert_eq!(extract_from_forwarded_for("not.an.ip.address", 0), UNKNOWN_IP);
        assert_eq!(extract_from_forwarded_for("", 0), UNKNOWN_IP);
    }

    #[test]
    fn test_extract_from_headers_then_socket() {
        let headers = headers_with_xff("203.0.113.7");
        assert_eq!(extract_client_ip(&headers, None, 0), "203.0.113.7");

        let empty = HeaderMap::new();
        let socket = std::net::SocketAddr::from(([127, 0, 0, 1], 8080));
        assert_eq!(extract_client_ip(&empty, Some(&socket), 0), "127.0.0.1");

        assert_eq!(extract_client_ip(&empty, None, 0), UNKNOWN_IP);
    }

    #[test]
    fn test_spoofed_header_with_garbage_falls_through() {
        let headers = headers_with_xff("<script>alert(1)</script>");
        let socket = std::net::SocketAddr::from(([198, 51, 100, 4], 443));
        assert_eq!(extract_client_ip(&headers, Some(&socket), 1), "198.51.100.4");
    }
}
