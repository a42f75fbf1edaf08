//! Rate-limited HTTP client with transparent retry on HTTP 429.
//!
//! Every outbound request first reserves a slot from the shared
//! [`RateLimiter`], then goes over a [`Transport`]. Throttled responses are
//! retried after the server's `Retry-After` or an exponential backoff; all
//! other statuses are handed back to the caller unchanged.
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};

/// Status code that triggers a retry.
pub const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("{url} still throttled after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A transport-agnostic outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub basic_auth: Option<(String, String)>,
}

impl HttpRequest {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            basic_auth: None,
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    #[must_use]
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        self.body = RequestBody::Form(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }
}

/// A fully buffered response. Header names are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// `Retry-After` in seconds, when present and numeric.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// # Errors
    ///
    /// Returns [`HttpError::Status`] for any non-2xx status.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HttpError::Status {
                url: self.url,
                status: self.status,
                body: self.body,
            })
        }
    }

    /// # Errors
    ///
    /// Returns [`HttpError::Decode`] when the body does not deserialize.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_str(&self.body).map_err(|source| HttpError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

/// The wire. Production uses [`ReqwestTransport`]; tests script responses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let network = |source: reqwest::Error| HttpError::Network {
            url: request.url.clone(),
            source,
        };
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(pairs) => builder.form(pairs),
        };

        let response = builder.send().await.map_err(network)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.text().await.map_err(network)?;
        Ok(HttpResponse {
            url: request.url.clone(),
            status,
            headers,
            body,
        })
    }
}

/// Spaces requests at least `1/rate` apart across every caller.
///
/// Callers reserve strictly increasing slots under the lock and sleep until
/// their slot outside it, so the lock is never held across a wait.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter allowing `per_second` requests per second; non-positive
    /// rates disable spacing.
    #[must_use]
    pub fn new(per_second: f64) -> Self {
        let interval = if per_second > 0.0 && per_second.is_finite() {
            Duration::try_from_secs_f64(1.0 / per_second).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        Self::with_interval(interval)
    }

    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next slot and wait for it. Returns the slot instant.
    pub async fn acquire(&self) -> Instant {
        let slot = {
            let mut next = self.next.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
        slot
    }
}

/// Retry ceiling and backoff curve for throttled requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the random extra delay added to computed backoffs.
    pub jitter: Duration,
    /// Longest single wait, whether hinted by the server or computed.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)` for a 1-based attempt number.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Wait before the next attempt: the server's hint when given, otherwise
    /// the backoff plus jitter. Never longer than `max_wait`.
    #[must_use]
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_wait);
        }
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
        };
        self.backoff(attempt).saturating_add(jitter).min(self.max_wait)
    }
}

/// Shared, cloneable client: one limiter and one policy for every clone.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl HttpClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
        }
    }

    /// A reqwest-backed client.
    #[must_use]
    pub fn with_rate(per_second: f64, policy: RetryPolicy) -> Self {
        Self::new(
            Arc::new(ReqwestTransport::default()),
            Arc::new(RateLimiter::new(per_second)),
            policy,
        )
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a request, retrying while the server answers 429.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::RetriesExhausted`] once `max_attempts` throttled
    /// responses were received, or the transport's error.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.limiter.acquire().await;
            let response = self.transport.send(&request).await?;
            if response.status != TOO_MANY_REQUESTS {
                return Ok(response);
            }
            if attempt == max_attempts {
                break;
            }
            let wait = self.policy.delay(attempt, response.retry_after());
            log::warn!(
                "[{}] 429 from {}; retrying in {:.2}s (attempt {attempt}/{max_attempts})",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                request.url,
                wait.as_secs_f64()
            );
            sleep(wait).await;
        }
        Err(HttpError::RetriesExhausted {
            url: request.url,
            attempts: max_attempts,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Lifetimes beyond this are treated as this long.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Process-scoped bearer token cache.
///
/// A token is reused until `margin` before its expiry; the refresh runs
/// under the lock so concurrent callers share one fetch.
#[derive(Debug)]
pub struct TokenCache {
    margin: Duration,
    slot: Mutex<Option<CachedToken>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl TokenCache {
    #[must_use]
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached token or fetch a new one. `fetch` yields the token
    /// and its lifetime.
    ///
    /// # Errors
    ///
    /// Propagates the error of `fetch`; nothing is cached in that case.
    pub async fn get_or_refresh<F, Fut, E>(&self, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref()
            && Instant::now()
                .checked_add(self.margin)
                .is_some_and(|deadline| deadline < token.expires_at)
        {
            return Ok(token.value.clone());
        }
        let (value, lifetime) = fetch().await?;
        log::debug!("refreshed access token (valid for {}s)", lifetime.as_secs());
        let now = Instant::now();
        let expires_at = now
            .checked_add(lifetime.min(MAX_TOKEN_LIFETIME))
            .unwrap_or(now);
        *slot = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays canned responses and records every request it sees.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        responses: StdMutex<VecDeque<HttpResponse>>,
        pub(crate) seen: StdMutex<Vec<(HttpRequest, Instant)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
                seen: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.clone(), Instant::now()));
            let mut reply = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| response(200, "{}"));
            reply.url = request.url.clone();
            Ok(reply)
        }
    }

    pub(crate) fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            url: String::new(),
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn throttled(retry_after: Option<&str>) -> HttpResponse {
        let mut r = response(429, "slow down");
        if let Some(v) = retry_after {
            r.headers.push(("retry-after".into(), v.into()));
        }
        r
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
            max_wait: Duration::from_secs(60),
        }
    }

    fn client(transport: Arc<ScriptedTransport>, policy: RetryPolicy) -> HttpClient {
        HttpClient::new(transport, Arc::new(RateLimiter::new(0.0)), policy)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter(5);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(
            policy.delay(3, Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(100),
            ..no_jitter(3)
        };
        for _ in 0..50 {
            let delay = policy.delay(2, None);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn honours_retry_after_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            throttled(Some("3")),
            response(200, r#"{"ok": true}"#),
        ]));
        let start = Instant::now();
        let resp = client(transport.clone(), no_jitter(5))
            .request(HttpRequest::get("https://example.test/a"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 2);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_exponential_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            throttled(None),
            throttled(None),
            response(200, "{}"),
        ]));
        let start = Instant::now();
        client(transport.clone(), no_jitter(5))
            .request(HttpRequest::get("https://example.test/b"))
            .await
            .unwrap();
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[1].1 - seen[0].1, Duration::from_secs(1));
        assert_eq!(seen[2].1 - seen[1].1, Duration::from_secs(2));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = Arc::new(ScriptedTransport::new(vec![throttled(None); 5]));
        let err = client(transport.clone(), no_jitter(3))
            .request(HttpRequest::get("https://example.test/c"))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn other_statuses_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![response(503, "down")]));
        let resp = client(transport.clone(), no_jitter(5))
            .request(HttpRequest::get("https://example.test/d"))
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
        assert_eq!(transport.calls(), 1);
        assert!(matches!(
            resp.error_for_status(),
            Err(HttpError::Status { status: 503, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(2.0));
        let start = Instant::now();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            tasks.spawn(async move { limiter.acquire().await });
        }
        let mut slots = Vec::new();
        while let Some(slot) = tasks.join_next().await {
            slots.push(slot.unwrap());
        }
        slots.sort();
        for pair in slots.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn token_cache_reuses_until_margin() {
        let cache = TokenCache::new(Duration::from_secs(10));
        let fetches = StdMutex::new(0);
        let counter = &fetches;
        let fetch = move || async move {
            *counter.lock().unwrap() += 1;
            Ok::<_, HttpError>(("tok".to_string(), Duration::from_secs(60)))
        };
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(*fetches.lock().unwrap(), 1);

        tokio::time::advance(Duration::from_secs(51)).await;
        cache.get_or_refresh(fetch).await.unwrap();
        assert_eq!(*fetches.lock().unwrap(), 2);

        cache.invalidate().await;
        cache.get_or_refresh(fetch).await.unwrap();
        assert_eq!(*fetches.lock().unwrap(), 3);
    }

    #[test]
    fn oversized_retry_after_is_ignored_or_capped() {
        let mut huge = response(429, "");
        huge.headers.push(("retry-after".into(), "1e30".into()));
        assert_eq!(huge.retry_after(), None);

        let mut negative = response(429, "");
        negative.headers.push(("retry-after".into(), "-4".into()));
        assert_eq!(negative.retry_after(), None);

        let policy = no_jitter(40);
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(60)
        );
        assert_eq!(policy.delay(35, None), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_retry_after_header_waits_at_most_max_wait() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            throttled(Some("1e30")),
            throttled(Some("86400")),
            response(200, "{}"),
        ]));
        let start = Instant::now();
        client(transport.clone(), no_jitter(5))
            .request(HttpRequest::get("https://example.test/e"))
            .await
            .unwrap();
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[1].1 - seen[0].1, Duration::from_secs(1));
        assert_eq!(seen[2].1 - seen[1].1, Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn token_cache_survives_enormous_lifetimes() {
        let fetches = StdMutex::new(0);
        let counter = &fetches;
        let fetch = move || async move {
            *counter.lock().unwrap() += 1;
            Ok::<_, HttpError>(("tok".to_string(), Duration::MAX))
        };
        let cache = TokenCache::new(Duration::from_secs(10));
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(*fetches.lock().unwrap(), 1);

        let paranoid = TokenCache::new(Duration::MAX);
        assert_eq!(paranoid.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(paranoid.get_or_refresh(fetch).await.unwrap(), "tok");
        assert_eq!(*fetches.lock().unwrap(), 3);
    }

    #[test]
    fn response_helpers() {
        let mut resp = response(200, r#"{"a": 1}"#);
        resp.headers.push(("retry-after".into(), "2.5".into()));
        assert_eq!(resp.header("Retry-After"), Some("2.5"));
        assert_eq!(resp.retry_after(), Some(Duration::from_millis(2500)));
        let value: Value = resp.json().unwrap();
        assert_eq!(value["a"], 1);
    }
}
