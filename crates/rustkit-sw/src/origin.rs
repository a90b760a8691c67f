//! Origins, storage keys and the URL checks applied to scripts and scopes.

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use url::{Host, Url};

// ==================== Origin ====================

/// A web origin.
///
/// Opaque origins carry a nonce, so two of them are never equal even when
/// derived from the same URL. A storage key built from one partitions only the
/// client that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    Opaque(u64),
}

impl Origin {
    pub fn new_opaque() -> Self {
        static NONCE: AtomicU64 = AtomicU64::new(1);
        Origin::Opaque(NONCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        match url.scheme() {
            "data" | "file" | "javascript" | "about" => Origin::new_opaque(),
            // blob: URLs take the origin of the URL they wrap.
            "blob" => match Url::parse(url.path()) {
                Ok(inner) => Origin::from_url(&inner),
                Err(_) => Origin::new_opaque(),
            },
            _ if url.cannot_be_a_base() => Origin::new_opaque(),
            _ => Origin::Tuple {
                scheme: url.scheme().to_string(),
                host: url.host_str().unwrap_or("").to_ascii_lowercase(),
                port: url.port_or_known_default(),
            },
        }
    }

    /// Check if two origins are the same. Opaque origins never match.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1.eq_ignore_ascii_case(h2) && p1 == p2,
            _ => false,
        }
    }

    /// Check if this is an opaque origin.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Origin::Opaque(_))
    }

    /// Serialize to string (for Origin header).
    pub fn serialize(&self) -> String {
        match self {
            Origin::Tuple { scheme, host, port } => {
                let default_port = match scheme.as_str() {
                    "http" | "ws" => Some(80),
                    "https" | "wss" => Some(443),
                    _ => None,
                };
                match port {
                    Some(p) if *port != default_port => format!("{}://{}:{}", scheme, host, p),
                    _ => format!("{}://{}", scheme, host),
                }
            }
            Origin::Opaque(_) => "null".to_string(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ==================== Storage Key ====================

/// Partitioning key isolating registrations between origins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StorageKey(Origin);

impl StorageKey {
    pub fn new(origin: Origin) -> Self {
        Self(origin)
    }

    /// Storage key for a client created at `url`.
    pub fn from_url(url: &Url) -> Self {
        Self(Origin::from_url(url))
    }

    pub fn origin(&self) -> &Origin {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ==================== URL checks ====================

/// Whether `url`'s origin is potentially trustworthy per the secure-contexts rules.
///
/// `trusted_schemes` lists embedder schemes that are always trusted.
pub fn is_potentially_trustworthy<S: AsRef<str>>(url: &Url, trusted_schemes: &[S]) -> bool {
    if url.scheme() == "file" {
        return true;
    }
    let origin = Origin::from_url(url);
    if origin.is_opaque() {
        return false;
    }
    if matches!(url.scheme(), "https" | "wss") {
        return true;
    }
    if is_localhost(url) {
        return true;
    }
    trusted_schemes
        .iter()
        .any(|scheme| scheme.as_ref().eq_ignore_ascii_case(url.scheme()))
}

fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        None => false,
    }
}

/// Whether the URL path contains an escaped `/` or `\`.
pub fn path_contains_escaped_slash(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.contains("%2f") || path.contains("%5c")
}

/// `url` with its fragment removed.
pub fn strip_fragment(url: &Url) -> Url {
    let mut stripped = url.clone();
    stripped.set_fragment(None);
    stripped
}

pub fn is_http_or_https(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    const TRUSTED: &[&str] = &["h5vcc-embedded"];

    #[test]
    fn test_origin_from_url() {
        let origin = Origin::from_url(&url("https://Example.com/sw.js"));
        assert_eq!(origin.serialize(), "https://example.com");
        assert!(Origin::from_url(&url("data:text/plain,hi")).is_opaque());
    }

    #[test]
    fn test_same_origin() {
        let a = Origin::from_url(&url("https://example.com/a"));
        let b = Origin::from_url(&url("https://example.com:443/b"));
        let c = Origin::from_url(&url("https://example.com:8443/b"));
        assert!(a.same_origin(&b));
        assert!(!a.same_origin(&c));
        let opaque = Origin::from_url(&url("data:,x"));
        assert!(!opaque.same_origin(&opaque));
    }

    #[test]
    fn test_potentially_trustworthy() {
        assert!(is_potentially_trustworthy(&url("https://example.com/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("http://localhost:8000/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("http://127.0.0.5/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("http://[::1]/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("http://app.localhost/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("file:///tmp/sw.js"), TRUSTED));
        assert!(is_potentially_trustworthy(&url("h5vcc-embedded://splash/sw.js"), TRUSTED));
        assert!(!is_potentially_trustworthy(&url("http://example.com/sw.js"), TRUSTED));
        assert!(!is_potentially_trustworthy(&url("data:text/javascript,1"), TRUSTED));
    }

    #[test]
    fn test_escaped_slash() {
        assert!(path_contains_escaped_slash(&url("https://example.com/a%2Fb/sw.js")));
        assert!(path_contains_escaped_slash(&url("https://example.com/a%5cb/sw.js")));
        assert!(!path_contains_escaped_slash(&url("https://example.com/a/b/sw.js")));
    }

    #[test]
    fn test_strip_fragment() {
        let stripped = strip_fragment(&url("https://example.com/sw.js#v2"));
        assert_eq!(stripped.as_str(), "https://example.com/sw.js");
    }

    #[test]
    fn test_storage_key_equality() {
        let a = StorageKey::from_url(&url("https://example.com/page"));
        let b = StorageKey::from_url(&url("https://example.com/other"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://example.com");
    }

    #[test]
    fn test_opaque_storage_keys_are_distinct() {
        let data = url("data:text/html,<p>hi</p>");
        let a = StorageKey::from_url(&data);
        let b = StorageKey::from_url(&data);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "null");

        let mut keys = hashbrown::HashSet::new();
        keys.insert(a);
        keys.insert(b);
        assert_eq!(keys.len(), 2);
    }
}
