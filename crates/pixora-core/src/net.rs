//! IP address normalization
//!
//! Anonymous visitors are tracked by IP, but consumer ISPs reassign addresses
//! inside a subnet frequently enough that raw IPs fragment one household into
//! many identities. Normalization rounds an IPv4 address down to its
//! containing /24 so a whole subnet shares one stable grouping key.

use std::net::{IpAddr, Ipv4Addr};

/// Stand-in subnet address for loopback traffic.
///
/// Local and test requests arrive as 127.0.0.1 (or ::1); mapping them to one
/// fixed address before normalization groups all local traffic into a single
/// bucket instead of polluting the ledger with loopback keys.
pub const LOCAL_PLACEHOLDER_IP: &str = "10.77.0.1";

/// Normalize a client IP into its stable grouping key.
///
/// - IPv4: the last octet is zeroed (rounded down to the containing /24).
/// - IPv6: returned unchanged; subnet grouping is not applied.
/// - Anything that fails address parsing is returned unchanged — the caller
///   gets a usable, if unnormalized, string rather than an error.
///
/// Loopback addresses are first mapped to [`LOCAL_PLACEHOLDER_IP`] so local
/// traffic lands in one bucket. The function is idempotent.
pub fn normalize_ip(ip: &str) -> String {
    let ip = map_loopback(ip);

    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            Ipv4Addr::new(a, b, c, 0).to_string()
        }
        Ok(IpAddr::V6(_)) => ip.to_string(),
        Err(_) => ip.to_string(),
    }
}

/// Normalize a list of IPs element-wise, preserving order and arity.
pub fn normalize_ips<S: AsRef<str>>(ips: &[S]) -> Vec<String> {
    ips.iter().map(|ip| normalize_ip(ip.as_ref())).collect()
}

/// Map loopback addresses to the fixed placeholder before normalization.
fn map_loopback(ip: &str) -> &str {
    match ip.parse::<IpAddr>() {
        Ok(addr) if addr.is_loopback() => LOCAL_PLACEHOLDER_IP,
        _ => ip,
    }
}
