//! Resilient HTTP client shared by the language-model providers and the
//! tracker REST API.
//!
//! Every non-2xx response is classified into an [`ErrorClass`]. Rate-limited
//! and transient failures are retried through the [`BackoffPolicy`];
//! permanent failures and non-idempotent requests fail on the first error.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::backoff::{BackoffPolicy, Deadline};
use crate::error::{ErrorClass, ProviderError};

/// Longest upstream body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Description of one outbound request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Name of the upstream, used in logs and errors.
    pub service: String,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Only idempotent requests are retried.
    pub idempotent: bool,
}

impl RequestSpec {
    pub fn new(service: &str, method: Method, url: impl Into<String>) -> Self {
        let idempotent = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
        Self {
            service: service.to_string(),
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            idempotent,
        }
    }

    pub fn get(service: &str, url: impl Into<String>) -> Self {
        Self::new(service, Method::GET, url)
    }

    /// A POST. Not retried unless marked with [`RequestSpec::idempotent`].
    pub fn post(service: &str, url: impl Into<String>, body: Value) -> Self {
        let mut spec = Self::new(service, Method::POST, url);
        spec.body = Some(body);
        spec
    }

    pub fn delete(service: &str, url: impl Into<String>) -> Self {
        Self::new(service, Method::DELETE, url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    /// Mark a request as safe to repeat (read-only POSTs such as searches
    /// and completions).
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// A successful upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub status: u16,
    /// Parsed JSON body; `Value::Null` for empty bodies.
    pub body: Value,
}

/// HTTP client with classification and retry.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    policy: BackoffPolicy,
    timeout: Duration,
}

impl ResilientClient {
    /// Build a client whose attempts each time out after `timeout`.
    pub fn new(policy: BackoffPolicy, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("workq/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            policy,
            timeout,
        })
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Send `spec`, retrying up to `max_retries` times on rate-limited or
    /// transient failures within `deadline`.
    pub async fn call(
        &self,
        spec: &RequestSpec,
        max_retries: u32,
        deadline: &Deadline,
    ) -> Result<ProviderResponse, ProviderError> {
        let policy = self.policy.with_max_retries(max_retries);
        policy
            .run(&spec.service, spec.idempotent, deadline, |attempt| {
                self.send_once(spec, attempt, deadline)
            })
            .await
    }

    async fn send_once(
        &self,
        spec: &RequestSpec,
        attempt: u32,
        deadline: &Deadline,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut url = reqwest::Url::parse(&spec.url).map_err(|e| {
            ProviderError::Configuration(format!("invalid URL for {}: {e}", spec.service))
        })?;
        if !spec.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&spec.query);
        }

        let mut request = self
            .http
            .request(spec.method.clone(), url)
            .timeout(deadline.clamp(self.timeout));
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| transport_error(&spec.service, e))?;
        let status = response.status();
        debug!(service = %spec.service, status = status.as_u16(), attempt, "Upstream responded");

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                service: spec.service.clone(),
                status: status.as_u16(),
                class: ErrorClass::from_status(status.as_u16(), retry_after),
                message: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&spec.service, e))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                ProviderError::invalid_response(&spec.service, format!("body is not JSON: {e}"))
            })?
        };

        Ok(ProviderResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn transport_error(service: &str, err: reqwest::Error) -> ProviderError {
    if err.is_builder() {
        return ProviderError::Configuration(format!("invalid request to {service}: {err}"));
    }
    ProviderError::Transport {
        service: service.to_string(),
        message: err.to_string(),
    }
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client() -> ResilientClient {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        };
        ResilientClient::new(policy, Duration::from_secs(5)).unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn call_success_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 2})))
            .mount(&server)
            .await;

        let spec = RequestSpec::get("tracker", format!("{}/items", server.uri()));
        let response = test_client().call(&spec, 3, &deadline()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["count"], 2);
    }

    #[tokio::test]
    async fn call_retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let spec = RequestSpec::get("tracker", format!("{}/items", server.uri()));
        let response = test_client().call(&spec, 3, &deadline()).await.unwrap();
        assert_eq!(response.body["ok"], true);
    }

    #[tokio::test]
    async fn call_fails_fast_on_400() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .expect(1)
            .mount(&server)
            .await;

        let spec = RequestSpec::get("tracker", format!("{}/items", server.uri()));
        let err = test_client().call(&spec, 3, &deadline()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(err.to_string().contains("bad query"), "got: {err}");
    }

    #[tokio::test]
    async fn call_exhausts_retries_on_503() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let spec = RequestSpec::get("tracker", format!("{}/items", server.uri()));
        let err = test_client().call(&spec, 2, &deadline()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn delete_is_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/items/7"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let spec = RequestSpec::delete("tracker", format!("{}/items/7", server.uri()));
        assert!(test_client().call(&spec, 3, &deadline()).await.is_err());
    }

    #[tokio::test]
    async fn retry_after_past_deadline_surfaces_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "300"))
            .expect(1)
            .mount(&server)
            .await;

        let spec = RequestSpec::get("tracker", format!("{}/items", server.uri()));
        let err = test_client()
            .call(&spec, 3, &Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after_secs(), Some(300));
        assert!(err.user_message().contains("Try again in 5 minutes"));
    }

    #[tokio::test]
    async fn empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let spec = RequestSpec::post("tracker", format!("{}/ping", server.uri()), json!({}));
        let response = test_client().call(&spec, 0, &deadline()).await.unwrap();
        assert_eq!(response.body, Value::Null);
    }

    #[test]
    fn post_defaults_to_non_idempotent() {
        let spec = RequestSpec::post("llm", "http://localhost", json!({}));
        assert!(!spec.idempotent);
        assert!(spec.idempotent(true).idempotent);
        assert!(RequestSpec::get("t", "http://localhost").idempotent);
        assert!(!RequestSpec::delete("t", "http://localhost").idempotent);
    }
}
