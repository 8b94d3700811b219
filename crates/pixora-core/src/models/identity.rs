//! Request identity
//!
//! Credits and activity are tracked against either an authenticated user id
//! or the normalized IP of an anonymous visitor. The two keyspaces are
//! distinct: an IP-keyed balance is never merged into a user-keyed one.

use serde::{Deserialize, Serialize};

use crate::net::normalize_ip;

/// Placeholder user-id tokens that upstream layers emit for signed-out
/// sessions. Treated the same as an absent user id.
const PLACEHOLDER_USER_IDS: &[&str] = &["", "anonymous", "guest", "unknown"];

/// Placeholder IP tokens emitted when client address extraction fails.
const PLACEHOLDER_IPS: &[&str] = &["", "unknown", "0.0.0.0"];

/// The identity a request is metered against.
///
/// User id wins over IP whenever both are present; the IP is still carried so
/// activity records always capture the (normalized) client subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// Authenticated user, no usable client IP recorded.
    ByUser(String),
    /// Anonymous visitor keyed by normalized IP.
    ByIp(String),
    /// Authenticated user with a normalized client IP.
    Both {
        user_id: String,
        normalized_ip: String,
    },
}

impl Identity {
    /// Resolve raw request identity fields into the tagged union.
    ///
    /// The IP is normalized here so no raw address ever escapes into a ledger
    /// key. Returns `None` when neither field carries a genuine value.
    pub fn resolve(user_id: Option<&str>, raw_ip: Option<&str>) -> Option<Identity> {
        let user_id = user_id.map(str::trim).filter(|id| is_genuine_user_id(id));
        let ip = raw_ip
            .map(str::trim)
            .filter(|ip| is_usable_ip(ip))
            .map(normalize_ip);

        match (user_id, ip) {
            (Some(uid), Some(ip)) => Some(Identity::Both {
                user_id: uid.to_string(),
                normalized_ip: ip,
            }),
            (Some(uid), None) => Some(Identity::ByUser(uid.to_string())),
            (None, Some(ip)) => Some(Identity::ByIp(ip)),
            (None, None) => None,
        }
    }

    /// The key credits are tracked under. User id wins when present.
    pub fn ledger_key(&self) -> &str {
        match self {
            Identity::ByUser(uid) => uid,
            Identity::ByIp(ip) => ip,
            Identity::Both { user_id, .. } => user_id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::ByUser(uid) => Some(uid),
            Identity::ByIp(_) => None,
            Identity::Both { user_id, .. } => Some(user_id),
        }
    }

    pub fn normalized_ip(&self) -> Option<&str> {
        match self {
            Identity::ByUser(_) => None,
            Identity::ByIp(ip) => Some(ip),
            Identity::Both { normalized_ip, .. } => Some(normalized_ip),
        }
    }
}

/// Whether a user id is a genuine account id rather than a placeholder.
pub fn is_genuine_user_id(user_id: &str) -> bool {
    !PLACEHOLDER_USER_IDS
        .iter()
        .any(|p| user_id.eq_ignore_ascii_case(p))
}

/// Whether a client IP string is usable for identity purposes.
pub fn is_usable_ip(ip: &str) -> bool {
    !PLACEHOLDER_IPS.iter().any(|p| ip.eq_ignore_ascii_case(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_wins_over_ip() {
        let identity = Identity::resolve(Some("user-123"), Some("192.168.1.42")).unwrap();
        assert_eq!(identity.ledger_key(), "user-123");
        assert_eq!(
            identity,
            Identity::Both {
                user_id: "user-123".to_string(),
                normalized_ip: "192.168.1.0".to_string(),
            }
        );
    }

    #[test]
    fn test_ip_only_is_normalized() {
        let identity = Identity::resolve(None, Some("10.1.2.99")).unwrap();
        assert_eq!(identity, Identity::ByIp("10.1.2.0".to_string()));
        assert_eq!(identity.ledger_key(), "10.1.2.0");
    }

    #[test]
    fn test_placeholder_user_id_falls_back_to_ip() {
        let identity = Identity::resolve(Some("anonymous"), Some("10.1.2.99")).unwrap();
        assert_eq!(identity, Identity::ByIp("10.1.2.0".to_string()));

        let identity = Identity::resolve(Some(""), Some("10.1.2.99")).unwrap();
        assert_eq!(identity.ledger_key(), "10.1.2.0");
    }

    #[test]
    fn test_placeholder_ip_is_dropped() {
        let identity = Identity::resolve(Some("user-1"), Some("unknown")).unwrap();
        assert_eq!(identity, Identity::ByUser("user-1".to_string()));
    }

    #[test]
    fn test_nothing_genuine_resolves_to_none() {
        assert_eq!(Identity::resolve(None, None), None);
        assert_eq!(Identity::resolve(Some("guest"), Some("unknown")), None);
        assert_eq!(Identity::resolve(Some(""), Some("")), None);
    }

    #[test]
    fn test_accessors() {
        let both = Identity::resolve(Some("user-9"), Some("198.51.100.23")).unwrap();
        assert_eq!(both.user_id(), Some("user-9"));
        assert_eq!(both.normalized_ip(), Some("198.51.100.0"));

        let by_ip = Identity::ByIp("198.51.100.0".to_string());
        assert_eq!(by_ip.user_id(), None);
        assert_eq!(by_ip.normalized_ip(), Some("198.51.100.0"));
    }
}
