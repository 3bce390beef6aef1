/// HTTP transport with bounded retry and backoff
use std::future::Future;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, Url};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result, TransportFailure};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Statuses that are worth another attempt
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

const PROJECT_HEADER: &str = "x-project-id";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Retry policy of the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    delay: Duration,
    backoff: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a validated retry policy
    pub fn new(max_attempts: u32, delay: Duration, backoff: f64) -> Result<Self> {
        if max_attempts < 1 {
            return Err(Error::InvalidConfig(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !backoff.is_finite() || backoff < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "retry backoff must be >= 1.0, got {}",
                backoff
            )));
        }
        Ok(Self {
            max_attempts,
            delay,
            backoff,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn backoff(&self) -> f64 {
        self.backoff
    }

    /// Sleep before retry `retry` (0 for the first retry): `delay * backoff^retry`
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        self.delay.mul_f64(self.backoff.powi(exponent))
    }

    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }
}

/// How the API token is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `X-Auth-Token: <token>`
    AuthToken,
}

/// Settings for building a [`Transport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoint: String,
    pub token: String,
    pub auth: AuthScheme,
    pub project_id: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// A request description, rebuilt on every attempt
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Add a query parameter only when a value is present
    pub fn query_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

/// Authenticated HTTP transport shared by the service implementations
#[derive(Clone)]
pub struct Transport {
    client: Client,
    endpoint: Url,
    retry: RetryConfig,
}

impl Transport {
    /// Create a new transport with fixed authentication headers
    pub fn new(config: TransportConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        match config.auth {
            AuthScheme::Bearer => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", config.token))
                    .map_err(|_| Error::InvalidConfig("invalid API token format".to_string()))?;
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
            AuthScheme::AuthToken => {
                let mut value = HeaderValue::from_str(&config.token)
                    .map_err(|_| Error::InvalidConfig("invalid API token format".to_string()))?;
                value.set_sensitive(true);
                headers.insert(HeaderName::from_static(AUTH_TOKEN_HEADER), value);
            }
        }
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(project_id) = config.project_id.as_deref().filter(|p| !p.is_empty()) {
            headers.insert(
                HeaderName::from_static(PROJECT_HEADER),
                HeaderValue::from_str(project_id).map_err(|_| {
                    Error::InvalidConfig(format!("invalid project id '{}'", project_id))
                })?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: parse_endpoint(&config.endpoint)?,
            retry: config.retry,
        })
    }

    /// Resolve a request path and query against the endpoint
    pub fn url_for(&self, request: &ApiRequest) -> Result<Url> {
        let mut url = self
            .endpoint
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidId(format!("bad request path '{}': {}", request.path, e)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    /// Send a request, retrying network failures and retryable statuses.
    ///
    /// Any non-retryable response is returned as is; status interpretation is
    /// left to the decoder.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ApiRequest,
    ) -> Result<Response> {
        let url = self.url_for(request)?;
        let url = &url;
        self.with_retries(cancel, &request.method, url, || {
            let mut builder = self.client.request(request.method.clone(), url.clone());
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            async move {
                match builder.send().await {
                    Ok(response)
                        if RetryConfig::is_retryable_status(response.status().as_u16()) =>
                    {
                        let status = response.status().as_u16();
                        warn!(status, url = %url, "Request returned retryable status");
                        Err(TransportFailure::Status(status))
                    }
                    Ok(response) => Ok(response),
                    Err(e) => {
                        warn!(error = %e, url = %url, "Request failed");
                        Err(TransportFailure::Network(e))
                    }
                }
            }
        })
        .await
    }

    /// Drive `send` until it succeeds or the attempts run out, sleeping
    /// `delay * backoff^k` before retry `k`
    async fn with_retries<R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        method: &Method,
        url: &Url,
        mut send: F,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<R, TransportFailure>>,
    {
        let max_attempts = self.retry.max_attempts;
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if attempt > 1 {
                let delay = self.retry.delay_before_retry(attempt - 2);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    url = %url,
                    "Retrying request"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            debug!(method = %method, url = %url, attempt, "Sending API request");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = send() => outcome,
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(failure) => last_failure = Some(failure),
            }
        }

        match last_failure {
            Some(last) => Err(Error::RetriesExhausted {
                method: method.to_string(),
                url: url.to_string(),
                attempts: max_attempts,
                last,
            }),
            None => Err(Error::InvalidConfig(
                "retry max_attempts must be at least 1".to_string(),
            )),
        }
    }
}

/// Parse an endpoint so that relative joins keep its path
fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let normalized = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{}/", endpoint)
    };
    let url = Url::parse(&normalized)
        .map_err(|e| Error::InvalidConfig(format!("invalid endpoint '{}': {}", endpoint, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidConfig(format!(
            "endpoint '{}' must use http or https",
            endpoint
        )));
    }
    Ok(url)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn test_config(endpoint: &str, auth: AuthScheme) -> TransportConfig {
        TransportConfig {
            endpoint: endpoint.to_string(),
            token: "test-token".to_string(),
            auth,
            project_id: Some("project-1".to_string()),
            user_agent: "baremetal-tests".to_string(),
            timeout: Duration::from_secs(5),
            retry: RetryConfig::new(3, Duration::from_millis(10), 2.0).unwrap(),
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let retry = RetryConfig::new(5, Duration::from_millis(100), 2.0).unwrap();
        let delays: Vec<Duration> = (0..4).map(|k| retry.delay_before_retry(k)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        let flat = RetryConfig::new(3, Duration::from_millis(250), 1.0).unwrap();
        assert_eq!(flat.delay_before_retry(2), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_follow_backoff() {
        let mut config = test_config("https://api.example.com/v2", AuthScheme::Bearer);
        config.retry = RetryConfig::new(4, Duration::from_millis(100), 2.0).unwrap();
        let transport = Transport::new(config).unwrap();
        let url = transport.url_for(&ApiRequest::get("servers")).unwrap();

        let mut sent = Vec::new();
        let err = transport
            .with_retries(&CancellationToken::new(), &Method::GET, &url, || {
                sent.push(tokio::time::Instant::now());
                std::future::ready(Err::<(), _>(TransportFailure::Status(503)))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(sent.len(), 4);
        let retry = &transport.retry;
        for (k, pair) in sent.windows(2).enumerate() {
            let expected = retry.delay_before_retry(k as u32);
            let gap = pair[1] - pair[0];
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(1),
                "retry {} slept {:?}, expected {:?}",
                k,
                gap,
                expected
            );
        }
        assert_eq!(retry.delay_before_retry(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_config_validation() {
        assert!(RetryConfig::new(0, Duration::from_secs(1), 2.0).is_err());
        assert!(RetryConfig::new(3, Duration::from_secs(1), 0.5).is_err());
        assert!(RetryConfig::new(1, Duration::ZERO, 1.0).is_ok());
        assert_eq!(RetryConfig::default().max_attempts(), 3);
    }

    #[test]
    fn test_url_building_keeps_endpoint_path() {
        let transport =
            Transport::new(test_config("https://api.example.com/dedicated/v2", AuthScheme::Bearer))
                .unwrap();
        let request = ApiRequest::get("/plan").query("service_uuid", "svc 1");
        let url = transport.url_for(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/dedicated/v2/plan?service_uuid=svc+1"
        );
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        assert!(Transport::new(test_config("ftp://example.com", AuthScheme::Bearer)).is_err());
        assert!(Transport::new(test_config("not a url", AuthScheme::Bearer)).is_err());
    }

    #[tokio::test]
    async fn test_sends_fixed_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("x-project-id", "project-1"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
        let response = transport
            .execute(&CancellationToken::new(), &ApiRequest::get("servers"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_legacy_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server/42"))
            .and(header("x-auth-token", "test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new(test_config(&server.uri(), AuthScheme::AuthToken)).unwrap();
        let response = transport
            .execute(&CancellationToken::new(), &ApiRequest::get("server/42"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_retries_unavailable_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/s-1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/servers/s-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
        let response = transport
            .execute(&CancellationToken::new(), &ApiRequest::get("servers/s-1"))
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retryable_statuses_exhaust_attempts() {
        for status in RETRYABLE_STATUSES {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
            let err = transport
                .execute(&CancellationToken::new(), &ApiRequest::get("location"))
                .await
                .unwrap_err();

            match err {
                Error::RetriesExhausted { attempts, last, .. } => {
                    assert_eq!(attempts, 3);
                    assert!(matches!(last, TransportFailure::Status(s) if s == status));
                }
                other => panic!("unexpected error for {}: {:?}", status, other),
            }
            assert_eq!(server.received_requests().await.unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        for status in [400u16, 401, 403, 404, 409, 422] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
            let response = transport
                .execute(&CancellationToken::new(), &ApiRequest::get("service"))
                .await
                .unwrap();

            assert_eq!(response.status().as_u16(), status);
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_network_failure_exhausts_attempts() {
        let mut config = test_config("http://127.0.0.1:1", AuthScheme::Bearer);
        config.retry = RetryConfig::new(2, Duration::from_millis(1), 1.0).unwrap();
        let transport = Transport::new(config).unwrap();

        let err = transport
            .execute(&CancellationToken::new(), &ApiRequest::get("servers"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RetriesExhausted {
                attempts: 2,
                last: TransportFailure::Network(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_send_issues_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .execute(&cancel, &ApiRequest::get("servers"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri(), AuthScheme::Bearer);
        config.retry = RetryConfig::new(5, Duration::from_secs(30), 2.0).unwrap();
        let transport = Transport::new(config).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = transport
            .execute(&cancel, &ApiRequest::get("servers").query("status", "active"))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(query_param("dry_run", "true"))
            .and(wiremock::matchers::body_json(serde_json::json!({"name": "db-1"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = Transport::new(test_config(&server.uri(), AuthScheme::Bearer)).unwrap();
        let request = ApiRequest::post("servers")
            .query("dry_run", "true")
            .json(&serde_json::json!({"name": "db-1"}))
            .unwrap();
        let response = transport
            .execute(&CancellationToken::new(), &request)
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
    }
}
