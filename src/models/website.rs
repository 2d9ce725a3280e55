//! Website and URL-list models.
//!
//! A website is either domain-scoped (its lists hold sub-URLs starting with
//! `/`) or cross-domain (its lists hold absolute URLs without protocol).
//! The namespace is used verbatim as a fragment of dependent table names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Maximum accepted length of a URL string, in bytes.
pub const MAX_URL_BYTES: usize = 2000;

/// A registered website.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Website {
    /// Database row ID.
    pub id: i64,
    /// Domain the website is scoped to; `None` for cross-domain lists.
    pub domain: Option<String>,
    /// SQL-safe identifier, unique across websites.
    pub namespace: String,
    /// Display name.
    pub name: String,
    /// Optional directory for website-specific data files.
    pub data_dir: Option<PathBuf>,
}

impl Website {
    /// Whether URL lists of this website hold sub-URLs.
    pub fn is_domain_scoped(&self) -> bool {
        self.domain.as_deref().is_some_and(|d| !d.is_empty())
    }
}

/// Properties for creating or updating a website.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebsiteProps {
    #[serde(default)]
    pub domain: Option<String>,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// A URL list belonging to a website.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlList {
    pub id: i64,
    pub website: i64,
    /// Unique per website.
    pub namespace: String,
    pub name: String,
}

/// Properties for creating or updating a URL list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlListProps {
    pub namespace: String,
    pub name: String,
}

/// A single URL row inside a URL list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRow {
    pub id: i64,
    pub url: String,
    /// Inserted by the operator rather than discovered by a crawler.
    pub manual: bool,
}

/// Check a namespace against the accepted alphabet (`[A-Za-z0-9$_]+`).
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'$' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_alphabet() {
        assert!(is_valid_namespace("news_2024"));
        assert!(is_valid_namespace("A$b"));
        assert!(!is_valid_namespace(""));
        assert!(!is_valid_namespace("with space"));
        assert!(!is_valid_namespace("dash-ed"));
        assert!(!is_valid_namespace("umläut"));
    }

    #[test]
    fn test_domain_scoped() {
        let mut site = Website {
            id: 1,
            domain: Some("example.com".to_string()),
            namespace: "ex".to_string(),
            name: "Example".to_string(),
            data_dir: None,
        };
        assert!(site.is_domain_scoped());

        site.domain = Some(String::new());
        assert!(!site.is_domain_scoped());

        site.domain = None;
        assert!(!site.is_domain_scoped());
    }
}
