//! URL forms used by the URL-list engine.
//!
//! Domain-scoped lists store sub-URLs (path plus query, starting with `/`);
//! cross-domain lists store absolute URLs without the protocol. Host
//! comparison ignores case and a leading `www.`.

use url::Url;

/// Strip a leading `www.` from a host.
pub fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Whether `host` belongs to `domain`, ignoring case and leading `www.`.
pub fn host_matches(host: &str, domain: &str) -> bool {
    normalize_host(host) == normalize_host(domain)
}

/// The storage form of a resolved URL for a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredUrl {
    /// Path plus query, for a domain-scoped list.
    Sub(String),
    /// `host/path?query` without protocol, for a cross-domain list.
    Absolute(String),
}

impl StoredUrl {
    pub fn into_string(self) -> String {
        match self {
            Self::Sub(s) | Self::Absolute(s) => s,
        }
    }
}

/// Path plus query of a parsed URL.
fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Resolve `candidate` against `base` and produce the storage form for a
/// list scoped to `domain` (`None` = cross-domain).
///
/// Returns `None` for unparseable candidates, non-HTTP schemes, and, for
/// domain-scoped lists, links pointing off-domain.
pub fn resolve_for_list(base: &Url, candidate: &str, domain: Option<&str>) -> Option<StoredUrl> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let resolved = base.join(trimmed).ok()?;
    match resolved.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    let host = resolved.host_str()?;

    match domain {
        Some(domain) if !domain.is_empty() => {
            if !host_matches(host, domain) {
                return None;
            }
            Some(StoredUrl::Sub(path_and_query(&resolved)))
        }
        _ => Some(StoredUrl::Absolute(format!(
            "{}{}",
            normalize_host(host),
            path_and_query(&resolved)
        ))),
    }
}

/// Rebuild a fetchable URL from its storage form.
pub fn to_fetch_url(stored: &str, domain: Option<&str>) -> Option<Url> {
    let full = match domain {
        Some(domain) if !domain.is_empty() => format!("https://{domain}{stored}"),
        _ => format!("https://{stored}"),
    };
    Url::parse(&full).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/a/index.html").unwrap()
    }

    #[test]
    fn test_host_matching_ignores_www_and_case() {
        assert!(host_matches("WWW.Example.COM", "example.com"));
        assert!(host_matches("example.com", "www.example.com"));
        assert!(!host_matches("other.test", "example.com"));
    }

    #[test]
    fn test_resolve_relative_on_domain_list() {
        let got = resolve_for_list(&base(), "b.html?x=1", Some("example.com")).unwrap();
        assert_eq!(got, StoredUrl::Sub("/a/b.html?x=1".to_string()));
    }

    #[test]
    fn test_resolve_absolute_same_domain() {
        let got = resolve_for_list(&base(), "https://www.example.com/b", Some("example.com"));
        assert_eq!(got, Some(StoredUrl::Sub("/b".to_string())));
    }

    #[test]
    fn test_resolve_drops_foreign_domain() {
        assert_eq!(
            resolve_for_list(&base(), "https://other.test/c", Some("example.com")),
            None
        );
    }

    #[test]
    fn test_resolve_cross_domain_keeps_host() {
        let got = resolve_for_list(&base(), "https://Other.Test/c?d=2", None).unwrap();
        assert_eq!(got, StoredUrl::Absolute("other.test/c?d=2".to_string()));
    }

    #[test]
    fn test_resolve_rejects_non_http() {
        assert_eq!(
            resolve_for_list(&base(), "mailto:user@example.com", None),
            None
        );
        assert_eq!(resolve_for_list(&base(), "javascript:void(0)", None), None);
    }

    #[test]
    fn test_to_fetch_url() {
        let url = to_fetch_url("/a/b", Some("example.com")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a/b");

        let url = to_fetch_url("other.test/c", None).unwrap();
        assert_eq!(url.host_str(), Some("other.test"));
    }
}
