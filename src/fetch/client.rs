//! HTTP feed fetch client with security measures.
//!
//! This module performs the HTTP retrieval for a fetch request and turns
//! every result, successful or not, into a classified [`FetchOutcome`].
//! It applies SSRF protection, timeouts and a body size ceiling.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::types::{FetchOptions, FetchOutcome, FetchStatus};
use crate::config::FetchConfig;
use crate::{FeedmonError, Result};

/// HTTP client for feed fetching.
#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    max_body_bytes: u64,
    allow_private_addresses: bool,
}

impl FetchClient {
    /// Create a new client from configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FeedmonError::Fetch(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
            allow_private_addresses: config.allow_private_addresses,
        })
    }

    /// Fetch a URL and classify the outcome.
    ///
    /// Never fails: transport problems are outcomes, not errors.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> FetchOutcome {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let check = if self.allow_private_addresses {
            validate_scheme(url).map(|_| ())
        } else {
            validate_url(url)
        };
        if let Err(e) = check {
            return FetchOutcome::failure(FetchStatus::ConnectionError, elapsed(), e.to_string());
        }

        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => warn!(url = %url, header = %name, "Skipping invalid fetch header"),
            }
        }
        if let Some(secs) = options.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::failure(classify_error(&e), elapsed(), e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return FetchOutcome {
                status: FetchStatus::Ok,
                http_status: Some(status.as_u16()),
                content_hash: None,
                latency_ms: elapsed(),
                error_message: None,
            };
        }
        if !status.is_success() {
            return FetchOutcome {
                status: FetchStatus::HttpError,
                http_status: Some(status.as_u16()),
                content_hash: None,
                latency_ms: elapsed(),
                error_message: Some(format!("HTTP error: {}", status)),
            };
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(content_type) = content_type {
            if !is_feed_content_type(&content_type) {
                return FetchOutcome {
                    status: FetchStatus::UnsupportedContentType,
                    http_status: Some(status.as_u16()),
                    content_hash: None,
                    latency_ms: elapsed(),
                    error_message: Some(format!("unsupported content type: {}", content_type)),
                };
            }
        }

        let too_large = |size: u64, latency_ms: u64| FetchOutcome {
            status: FetchStatus::TooLarge,
            http_status: Some(status.as_u16()),
            content_hash: None,
            latency_ms,
            error_message: Some(format!(
                "feed too large: {} bytes (max {} bytes)",
                size, self.max_body_bytes
            )),
        };

        // Check content length if available
        if let Some(content_length) = response.content_length() {
            if content_length > self.max_body_bytes {
                return too_large(content_length, elapsed());
            }
        }

        // Stream the body so the ceiling holds without a Content-Length
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    received += chunk.len() as u64;
                    if received > self.max_body_bytes {
                        return too_large(received, elapsed());
                    }
                    hasher.update(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return FetchOutcome {
                        status: classify_error(&e),
                        http_status: Some(status.as_u16()),
                        content_hash: None,
                        latency_ms: elapsed(),
                        error_message: Some(format!("failed to read response: {}", e)),
                    };
                }
            }
        }

        debug!(url = %url, bytes = received, "Fetched feed body");

        FetchOutcome {
            status: FetchStatus::Ok,
            http_status: Some(status.as_u16()),
            content_hash: Some(format!("{:x}", hasher.finalize())),
            latency_ms: elapsed(),
            error_message: None,
        }
    }
}

/// Map a transport error to an outcome classification.
fn classify_error(e: &reqwest::Error) -> FetchStatus {
    if e.is_timeout() {
        FetchStatus::Timeout
    } else {
        FetchStatus::ConnectionError
    }
}

/// Whether a Content-Type header names something a feed can be served as.
///
/// Feeds show up as `application/rss+xml`, `application/atom+xml`,
/// `text/xml`, `application/xml`, JSON Feed and occasionally `text/plain`.
pub fn is_feed_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime.is_empty() || mime.starts_with("text/") {
        return true;
    }
    mime.ends_with("xml") || mime.ends_with("json") || mime.contains("rss") || mime.contains("atom")
}

/// Check only that the URL parses with an http(s) scheme.
fn validate_scheme(url: &str) -> Result<url::Url> {
    let parsed =
        url::Url::parse(url).map_err(|e| FeedmonError::Validation(format!("invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(FeedmonError::Validation(format!(
            "unsupported URL scheme: {}",
            scheme
        ))),
    }
}

/// Validate a URL for SSRF protection.
///
/// Rejects non-http(s) schemes, reserved hostnames and literal
/// loopback/private/link-local addresses.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = validate_scheme(url)?;

    let host = parsed
        .host()
        .ok_or_else(|| FeedmonError::Validation("URL has no host".to_string()))?;

    let ip = match host {
        url::Host::Domain(domain) => {
            if is_forbidden_hostname(domain) {
                return Err(FeedmonError::Validation(format!(
                    "forbidden host: {}",
                    domain
                )));
            }
            return Ok(());
        }
        url::Host::Ipv4(ipv4) => IpAddr::V4(ipv4),
        url::Host::Ipv6(ipv6) => IpAddr::V6(ipv6),
    };

    if is_private_ip(&ip) {
        return Err(FeedmonError::Validation(format!(
            "private IP address not allowed: {}",
            ip
        )));
    }
    Ok(())
}

/// Check if a hostname is forbidden.
fn is_forbidden_hostname(host: &str) -> bool {
    const FORBIDDEN_SUFFIXES: [&str; 5] = [".local", ".localhost", ".internal", ".lan", ".home"];

    let host = host.to_ascii_lowercase();
    host == "localhost" || FORBIDDEN_SUFFIXES.iter().any(|s| host.ends_with(s))
}

/// Check if an IP address is private/reserved.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let [a, b, ..] = ipv4.octets();
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // Carrier-grade NAT: 100.64.0.0/10
                || (a == 100 && (64..=127).contains(&b))
        }
        IpAddr::V6(ipv6) => {
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let first = ipv6.segments()[0];
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // Unique local: fc00::/7
                || (first & 0xfe00) == 0xfc00
                // Link-local: fe80::/10
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title></channel></rss>"#;

    fn local_client() -> FetchClient {
        FetchClient::new(&FetchConfig {
            allow_private_addresses: true,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_url_valid() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://example.com/rss").is_ok());
        assert!(validate_url("https://93.184.216.34/feed").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_scheme() {
        assert!(validate_url("ftp://example.com/feed.xml").is_err());
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_validate_url_rejects_private_targets() {
        assert!(validate_url("http://localhost/feed").is_err());
        assert!(validate_url("http://printer.local/feed").is_err());
        assert!(validate_url("http://127.0.0.1/feed").is_err());
        assert!(validate_url("http://10.1.2.3/feed").is_err());
        assert!(validate_url("http://172.20.0.1/feed").is_err());
        assert!(validate_url("http://192.168.1.1/feed").is_err());
        assert!(validate_url("http://169.254.169.254/latest").is_err());
        assert!(validate_url("http://100.64.0.1/feed").is_err());
        assert!(validate_url("http://[::1]/feed").is_err());
        assert!(validate_url("http://[fd00::1]/feed").is_err());
        assert!(validate_url("http://[::ffff:127.0.0.1]/feed").is_err());
    }

    #[test]
    fn test_feed_content_types() {
        assert!(is_feed_content_type("application/rss+xml"));
        assert!(is_feed_content_type("application/atom+xml; charset=utf-8"));
        assert!(is_feed_content_type("text/xml"));
        assert!(is_feed_content_type("text/html"));
        assert!(is_feed_content_type("application/feed+json"));
        assert!(is_feed_content_type("APPLICATION/XML"));
        assert!(!is_feed_content_type("image/png"));
        assert!(!is_feed_content_type("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_private_target_is_connection_error() {
        let client = FetchClient::new(&FetchConfig::default()).unwrap();
        let outcome = client
            .fetch("http://127.0.0.1:9/feed", &FetchOptions::default())
            .await;
        assert_eq!(outcome.status, FetchStatus::ConnectionError);
        assert!(outcome.error_message.unwrap().contains("private IP"));
        assert_eq!(outcome.http_status, None);
    }

    #[tokio::test]
    async fn test_private_mode_still_checks_scheme() {
        let outcome = local_client()
            .fetch("ftp://127.0.0.1/feed", &FetchOptions::default())
            .await;
        assert_eq!(outcome.status, FetchStatus::ConnectionError);
        assert!(outcome.error_message.unwrap().contains("unsupported URL scheme"));
    }

    #[tokio::test]
    async fn test_fetch_ok_hashes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/rss+xml")
                    .set_body_string(RSS),
            )
            .mount(&server)
            .await;

        let outcome = local_client()
            .fetch(&format!("{}/feed.xml", server.uri()), &FetchOptions::default())
            .await;

        assert_eq!(outcome.status, FetchStatus::Ok);
        assert_eq!(outcome.http_status, Some(200));
        let expected = format!("{:x}", Sha256::digest(RSS.as_bytes()));
        assert_eq!(outcome.content_hash.as_deref(), Some(expected.as_str()));
        assert!(outcome.error_message.is_none());
    }

    #[tokio::test]
    async fn test_fetch_forwards_headers_and_accepts_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let options = FetchOptions {
            headers: BTreeMap::from([("If-None-Match".to_string(), "\"v1\"".to_string())]),
            timeout_secs: None,
        };
        let outcome = local_client().fetch(&server.uri(), &options).await;

        assert_eq!(outcome.status, FetchStatus::Ok);
        assert_eq!(outcome.http_status, Some(304));
        assert!(outcome.content_hash.is_none());
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let outcome = local_client()
            .fetch(&server.uri(), &FetchOptions::default())
            .await;

        assert_eq!(outcome.status, FetchStatus::HttpError);
        assert_eq!(outcome.http_status, Some(503));
        assert!(outcome.error_message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_fetch_unsupported_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]),
            )
            .mount(&server)
            .await;

        let outcome = local_client()
            .fetch(&server.uri(), &FetchOptions::default())
            .await;

        assert_eq!(outcome.status, FetchStatus::UnsupportedContentType);
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/xml")
                    .set_body_string("x".repeat(2048)),
            )
            .mount(&server)
            .await;

        let client = FetchClient::new(&FetchConfig {
            allow_private_addresses: true,
            max_body_bytes: 1024,
            ..FetchConfig::default()
        })
        .unwrap();
        let outcome = client.fetch(&server.uri(), &FetchOptions::default()).await;

        assert_eq!(outcome.status, FetchStatus::TooLarge);
        assert!(outcome.content_hash.is_none());
    }

    #[tokio::test]
    async fn test_fetch_timeout_override() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let options = FetchOptions {
            headers: BTreeMap::new(),
            timeout_secs: Some(1),
        };
        let outcome = local_client().fetch(&server.uri(), &options).await;

        assert_eq!(outcome.status, FetchStatus::Timeout);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        // Bind then drop a listener to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let outcome = local_client()
            .fetch(&format!("http://127.0.0.1:{port}/feed"), &FetchOptions::default())
            .await;

        assert_eq!(outcome.status, FetchStatus::ConnectionError);
    }
}
