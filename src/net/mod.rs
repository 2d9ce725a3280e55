//! Network configuration for worker HTTP clients.
//!
//! The `network` section of a module configuration is mapped onto a
//! per-worker reqwest client. Options the client cannot express are logged
//! as unsupported instead of rejected, so configurations written for other
//! deployments still load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_redirect_max() -> u32 {
    10
}

fn default_timeout_connect() -> u64 {
    30
}

fn default_timeout_request() -> u64 {
    120
}

fn default_connections_max() -> usize {
    8
}

/// The `network.*` section shared by all modules that fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Per-host connection cap.
    #[serde(rename = "connections.max")]
    pub connections_max: usize,
    /// Enable the cookie store.
    pub cookies: bool,
    /// Extra cookies sent with every request ("name=value; ...").
    #[serde(rename = "cookies.set")]
    pub cookies_set: Option<String>,
    /// DNS-over-HTTPS resolver URL (accepted, not yet wired).
    #[serde(rename = "dns.doh.url")]
    pub dns_doh_url: Option<String>,
    /// Accept Brotli-compressed responses.
    #[serde(rename = "encoding.br")]
    pub encoding_br: bool,
    /// Accept gzip-compressed responses.
    #[serde(rename = "encoding.gzip")]
    pub encoding_gzip: bool,
    /// Additional request headers ("Name: value" lines).
    pub headers: Vec<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// HTTP/2 prior knowledge.
    #[serde(rename = "protocol.http2")]
    pub protocol_http2: bool,
    /// Proxy URL (http, https, or socks5).
    pub proxy: Option<String>,
    /// Proxy credentials as "user:password".
    #[serde(rename = "proxy.auth")]
    pub proxy_auth: Option<String>,
    /// Follow redirects automatically.
    #[serde(rename = "redirect.auto")]
    pub redirect_auto: bool,
    /// Maximum redirects to follow.
    #[serde(rename = "redirect.max")]
    pub redirect_max: u32,
    /// Referer header.
    pub referer: Option<String>,
    /// Connect timeout in seconds.
    #[serde(rename = "timeout.connect")]
    pub timeout_connect: u64,
    /// Whole-request timeout in seconds.
    #[serde(rename = "timeout.request")]
    pub timeout_request: u64,
    /// User-Agent header.
    pub useragent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connections_max: default_connections_max(),
            cookies: true,
            cookies_set: None,
            dns_doh_url: None,
            encoding_br: true,
            encoding_gzip: true,
            headers: Vec::new(),
            insecure: false,
            protocol_http2: false,
            proxy: None,
            proxy_auth: None,
            redirect_auto: default_true(),
            redirect_max: default_redirect_max(),
            referer: None,
            timeout_connect: default_timeout_connect(),
            timeout_request: default_timeout_request(),
            useragent: None,
        }
    }
}

const DEFAULT_USER_AGENT: &str = concat!("webharvest/", env!("CARGO_PKG_VERSION"));

impl NetworkConfig {
    /// Build the reqwest client for this configuration.
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.useragent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
            .pool_max_idle_per_host(self.connections_max)
            .connect_timeout(Duration::from_secs(self.timeout_connect))
            .timeout(Duration::from_secs(self.timeout_request))
            .cookie_store(self.cookies)
            .gzip(self.encoding_gzip)
            .brotli(self.encoding_br)
            .danger_accept_invalid_certs(self.insecure);

        builder = if self.redirect_auto {
            builder.redirect(reqwest::redirect::Policy::limited(self.redirect_max as usize))
        } else {
            builder.redirect(reqwest::redirect::Policy::none())
        };

        if let Some(proxy_url) = &self.proxy {
            let mut proxy = reqwest::Proxy::all(proxy_url)?;
            if let Some(auth) = &self.proxy_auth {
                if let Some((user, password)) = auth.split_once(':') {
                    proxy = proxy.basic_auth(user, password);
                }
            }
            builder = builder.proxy(proxy);
        }

        if self.protocol_http2 {
            builder = builder.http2_prior_knowledge();
        }

        if self.dns_doh_url.is_some() {
            tracing::warn!("network.dns.doh.url is not supported by this client; ignored");
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for line in &self.headers {
            let Some((name, value)) = line.split_once(':') else {
                tracing::warn!("ignoring malformed header line '{line}'");
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            match (
                reqwest::header::HeaderName::try_from(name),
                reqwest::header::HeaderValue::try_from(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!("ignoring invalid header '{line}'"),
            }
        }
        if let Some(referer) = &self.referer {
            if let Ok(value) = reqwest::header::HeaderValue::try_from(referer.as_str()) {
                headers.insert(reqwest::header::REFERER, value);
            }
        }
        if let Some(cookies) = &self.cookies_set {
            if let Ok(value) = reqwest::header::HeaderValue::try_from(cookies.as_str()) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }
        if !headers.is_empty() {
            builder = builder.default_headers(headers);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build() {
        let config = NetworkConfig::default();
        assert!(config.build_client().is_ok());
    }

    #[test]
    fn test_deserialization_with_dotted_keys() {
        let json = r#"{
            "connections.max": 2,
            "cookies": false,
            "encoding.br": false,
            "headers": ["X-Custom: yes"],
            "redirect.max": 3,
            "timeout.request": 15,
            "useragent": "test-agent"
        }"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.connections_max, 2);
        assert!(!config.cookies);
        assert!(!config.encoding_br);
        assert_eq!(config.redirect_max, 3);
        assert_eq!(config.timeout_request, 15);
        assert_eq!(config.useragent.as_deref(), Some("test-agent"));
        assert!(config.build_client().is_ok());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        // Keys from richer deployments load without error.
        let json = r#"{"tcp.nodelay": true, "ssl.version": "tls1.3"}"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert!(config.redirect_auto);
    }

    #[test]
    fn test_bad_proxy_rejected() {
        let config = NetworkConfig {
            proxy: Some("::not a url::".to_string()),
            ..Default::default()
        };
        assert!(config.build_client().is_err());
    }
}
