//! HTTP client executing queued requests against their targets.
//!
//! Handles request construction from stored rows, per-request deadlines,
//! response capture, and error categorization for retry and circuit
//! breaker decisions.

use std::{collections::HashMap, time::Duration};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use carrier_core::{HttpMethod, StoredRequest};

use crate::error::{QueueError, Result};

/// Configuration for the dispatch client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback deadline for requests that carry none.
    pub default_timeout: Duration,
    /// User agent string for outbound requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            user_agent: "Carrier-Dispatch/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Response from one execution of a queued request.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated for storage.
    pub body: String,
    /// Wall-clock duration from send to receive.
    pub duration: Duration,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

/// HTTP client optimized for queued dispatch.
///
/// Uses connection pooling across hosts; the deadline is applied per
/// request because every queued request carries its own timeout.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DispatchClient {
    /// Creates a new dispatch client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| QueueError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Executes one attempt of a queued request.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Timeout`] when the request's deadline elapses.
    /// - [`QueueError::Transport`] for connection-level failures.
    pub async fn execute(
        &self,
        request: &StoredRequest,
        attempt_number: u32,
    ) -> Result<DispatchResponse> {
        let timeout = if request.timeout_ms > 0 {
            Duration::from_millis(u64::try_from(request.timeout_ms).unwrap_or(30_000))
        } else {
            self.config.default_timeout
        };

        let span = info_span!(
            "dispatch",
            request_id = %request.id,
            url = %request.url,
            method = %request.method,
            attempt = attempt_number
        );

        async move {
            let start = std::time::Instant::now();

            let mut http_request = self
                .client
                .request(method_of(request.method), &request.url)
                .timeout(timeout);

            for (name, value) in request.headers() {
                if !is_managed_header(name) {
                    http_request = http_request.header(name, value);
                }
            }

            if let Some(body) = request.body_bytes() {
                http_request = http_request.body(body);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start.elapsed();
                    warn!(duration_ms = duration.as_millis(), "request failed: {e}");

                    if e.is_timeout() {
                        return Err(QueueError::timeout(timeout.as_millis() as u64));
                    }
                    if e.is_connect() {
                        return Err(QueueError::transport(format!("connection failed: {e}")));
                    }
                    return Err(QueueError::transport(e.to_string()));
                },
            };

            let duration = start.elapsed();
            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let headers = extract_headers(response.headers());
            let body = read_body(response).await;

            debug!(status = status_code, duration_ms = duration.as_millis(), "received response");

            Ok(DispatchResponse { status_code, headers, body, duration, is_success })
        }
        .instrument(span)
        .await
    }
}

fn method_of(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

async fn read_body(response: reqwest::Response) -> String {
    const MAX_BODY_SIZE: usize = 64 * 1024;
    const MAX_STORED: usize = 1024;

    match response.bytes().await {
        Ok(bytes) => {
            if bytes.len() > MAX_BODY_SIZE {
                let suffix = "... (truncated)";
                let kept = String::from_utf8_lossy(&bytes[..MAX_STORED - suffix.len()]);
                format!("{kept}{suffix}")
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        },
        Err(e) => {
            warn!("failed to read response body: {e}");
            format!("[failed to read response body: {e}]")
        },
    }
}

/// Extracts headers into a plain map, skipping non-UTF8 values.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (name, value) in header_map {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), value.to_string());
        }
    }

    headers
}

/// Hop-by-hop and connection-managed headers that must not be copied
/// from the stored request.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts a Retry-After delay from response headers.
///
/// Supports both the seconds format and the HTTP-date format. Falls
/// back to 60 s when the header exists but cannot be parsed.
pub fn extract_retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

    let value = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let now = chrono::Utc::now();
        let retry_time = date.with_timezone(&chrono::Utc);
        if retry_time > now {
            if let Ok(delay) = retry_time.signed_duration_since(now).to_std() {
                return Some(delay);
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use carrier_core::NewRequest;

    use super::*;

    fn stored_request(url: String, method: HttpMethod) -> StoredRequest {
        let input = NewRequest {
            method,
            headers: HashMap::from([("x-custom".to_string(), "value".to_string())]),
            body: Some(b"test payload".to_vec()),
            ..NewRequest::to_url(url)
        };
        StoredRequest::from_new(input, Utc::now())
    }

    #[tokio::test]
    async fn successful_post() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/items"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let client = DispatchClient::with_defaults().unwrap();
        let request = stored_request(format!("{}/items", server.uri()), HttpMethod::Post);

        let response = client.execute(&request, 1).await.unwrap();
        assert_eq!(response.status_code, 201);
        assert!(response.is_success);
        assert_eq!(response.body, "created");
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = DispatchClient::with_defaults().unwrap();
        let request = stored_request(format!("{}/x", server.uri()), HttpMethod::Get);

        let response = client.execute(&request, 1).await.unwrap();
        assert_eq!(response.status_code, 503);
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn custom_headers_forwarded() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("x-custom", "value"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = DispatchClient::with_defaults().unwrap();
        let request = stored_request(format!("{}/hook", server.uri()), HttpMethod::Post);

        assert!(client.execute(&request, 1).await.is_ok());
    }

    #[tokio::test]
    async fn deadline_produces_timeout_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = DispatchClient::with_defaults().unwrap();
        let mut request = stored_request(format!("{}/slow", server.uri()), HttpMethod::Get);
        request.timeout_ms = 50;

        match client.execute(&request, 1).await {
            Err(QueueError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let client = DispatchClient::with_defaults().unwrap();
        // Port 1 is essentially never listening.
        let request = stored_request("http://127.0.0.1:1/unreachable".to_string(), HttpMethod::Get);

        match client.execute(&request, 1).await {
            Err(QueueError::Transport { .. }) => {},
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = HashMap::new();

        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(extract_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.clear();
        assert_eq!(extract_retry_after(&headers), None);

        headers.insert("retry-after".to_string(), "not-a-number".to_string());
        assert_eq!(extract_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("host"));
        assert!(is_managed_header("TRANSFER-ENCODING"));

        assert!(!is_managed_header("x-custom"));
        assert!(!is_managed_header("authorization"));
        assert!(!is_managed_header("content-type"));
    }
}
