//! High level dispatch orchestration.
//!
//! Wires together the concurrency gate, rate budgets, proxy pool, identity
//! rotation, escalation, and retry policy to answer one question per call:
//! may this request go out now, through which network identity, and what
//! happens when the remote side pushes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use url::Url;

use crate::modules::escalation::{EscalationController, EscalationSignal};
use crate::modules::events::{
    AttemptEvent, DispatchEvent, ErrorEvent, EscalatedEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, OutcomeEvent, RetryScheduledEvent,
};
use crate::modules::gate::ConcurrencyGate;
use crate::modules::health::{DEFAULT_HEALTH_INTERVAL, HealthChecker, ProxyProbe, ReqwestProbe};
use crate::modules::identity::{Identity, IdentityError, IdentityProvider, IdentityRotation};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::proxy::{
    PoolConfig, ProxyOutcome, ProxyPool, ProxyPoolError, ProxySelection, ProxyView,
    RotationStrategy,
};
use crate::modules::rate_limiter::{BudgetConfig, RateLimitError, RateLimiter};
use crate::modules::retry::{CallOutcome, ErrorKind, RetryConfig, RetryPolicy};
use crate::modules::speed_modes::{SpeedMode, SpeedModeError};

/// Default transport timeout when the request descriptor carries none.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Result alias used across the orchestration layer.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// High-level error surfaced to callers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The call settled on a classified failure: a terminal kind, or a
    /// retryable one with no attempts left.
    #[error("request failed ({}) after {attempts} attempt(s): {message}", .kind.as_str())]
    Failed {
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
    #[error("rate budget denied: {0}")]
    RateBudget(#[from] RateLimitError),
    #[error("proxy configuration error: {0}")]
    Proxy(#[from] ProxyPoolError),
    #[error("speed mode error: {0}")]
    Mode(#[from] SpeedModeError),
    #[error("identity configuration error: {0}")]
    Identity(#[from] IdentityError),
    #[error("invalid session config: {0}")]
    Config(String),
}

impl DispatchError {
    /// Classified kind, when the call made it as far as classification.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DispatchError::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DispatchError::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// What the caller wants sent; the dispatcher decides when and how.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Transport-level failures, before any classification.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Io(String),
}

/// Raw response handed back by the transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// The external collaborator that actually talks to the network.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &RequestDescriptor,
        identity: &Identity,
        proxy: Option<&ProxySelection>,
    ) -> Result<TransportResponse, TransportError>;
}

/// Default transport: reqwest with one cached client per proxy endpoint.
pub struct ReqwestTransport {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(
        &self,
        proxy: Option<&ProxySelection>,
    ) -> Result<reqwest::Client, TransportError> {
        let key = proxy.map(|p| p.id.clone());
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(selection) = proxy {
            let proxied = reqwest::Proxy::all(selection.endpoint.as_str())
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            builder = builder.proxy(proxied);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::Io(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &RequestDescriptor,
        identity: &Identity,
        proxy: Option<&ProxySelection>,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client(proxy).await?;

        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(identity.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

/// Settled response returned by [`Session::dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    attempts: u32,
    latency: Duration,
}

impl DispatchResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Attempts it took to settle, including the successful one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Transport latency of the final attempt.
    pub fn latency(&self) -> Duration {
        self.latency
    }
}

/// Custom mode parameters for the configuration surface.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CustomModeConfig {
    pub max_concurrency: usize,
    pub delay_range: (f32, f32),
    pub rate_per_minute: u32,
    pub burst_size: u32,
    pub proxy_multiplier: f32,
    pub error_backoff: f32,
}

/// Recognized configuration options, loadable from JSON.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: String,
    pub custom_mode: Option<CustomModeConfig>,
    pub proxies: Vec<String>,
    pub rotation_strategy: RotationStrategy,
    pub health_check_interval_seconds: u64,
    pub max_failures: u32,
    pub min_score: f64,
    pub retry: RetryConfig,
    pub identity_rotation: IdentityRotation,
    pub categories: HashMap<String, BudgetConfig>,
    pub challenge_resolver: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            mode: "safe".to_string(),
            custom_mode: None,
            proxies: Vec::new(),
            rotation_strategy: RotationStrategy::Weighted,
            health_check_interval_seconds: DEFAULT_HEALTH_INTERVAL.as_secs(),
            max_failures: pool.max_failures,
            min_score: pool.min_score,
            retry: RetryConfig::default(),
            identity_rotation: IdentityRotation::RoundRobin,
            categories: HashMap::new(),
            challenge_resolver: false,
        }
    }
}

impl SessionConfig {
    pub fn from_json(raw: &str) -> DispatchResult<Self> {
        serde_json::from_str(raw).map_err(|err| DispatchError::Config(err.to_string()))
    }

    fn mode(&self) -> DispatchResult<SpeedMode> {
        if self.mode.eq_ignore_ascii_case("custom") {
            let custom = self
                .custom_mode
                .as_ref()
                .ok_or_else(|| DispatchError::Config("custom mode requires custom_mode".into()))?;
            Ok(SpeedMode::custom(
                custom.max_concurrency,
                custom.delay_range,
                custom.rate_per_minute,
                custom.burst_size,
                custom.proxy_multiplier,
                custom.error_backoff,
            )?)
        } else {
            Ok(SpeedMode::named(&self.mode)?)
        }
    }
}

/// Fluent builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn ProxyProbe>>,
    probe_target: Option<Url>,
    identity_catalog: Option<IdentityProvider>,
    enable_metrics: bool,
    extra_handlers: Vec<Arc<dyn EventHandler>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            transport: None,
            probe: None,
            probe_target: None,
            identity_catalog: None,
            enable_metrics: true,
            extra_handlers: Vec::new(),
        }
    }

    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            ..Self::new()
        }
    }

    pub fn mode(mut self, name: &str) -> Self {
        self.config.mode = name.to_string();
        self
    }

    pub fn custom_mode(mut self, custom: CustomModeConfig) -> Self {
        self.config.mode = "custom".to_string();
        self.config.custom_mode = Some(custom);
        self
    }

    pub fn proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn rotation_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation_strategy = strategy;
        self
    }

    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.config.max_failures = max_failures;
        self
    }

    pub fn min_score(mut self, min_score: f64) -> Self {
        self.config.min_score = min_score;
        self
    }

    pub fn identity_rotation(mut self, rotation: IdentityRotation) -> Self {
        self.config.identity_rotation = rotation;
        self
    }

    pub fn identity_provider(mut self, provider: IdentityProvider) -> Self {
        self.identity_catalog = Some(provider);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn category(mut self, name: impl Into<String>, budget: BudgetConfig) -> Self {
        self.config.categories.insert(name.into(), budget);
        self
    }

    pub fn challenge_resolver(mut self, available: bool) -> Self {
        self.config.challenge_resolver = available;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval_seconds = interval.as_secs();
        self
    }

    /// Enable background health checking with the default reqwest probe
    /// against `target`.
    pub fn health_probe_target(mut self, target: Url) -> Self {
        self.probe_target = Some(target);
        self
    }

    /// Enable background health checking with a custom probe.
    pub fn probe(mut self, probe: Arc<dyn ProxyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn build(self) -> DispatchResult<Session> {
        let mode = self.config.mode()?;

        let pool = ProxyPool::new(PoolConfig {
            strategy: self.config.rotation_strategy,
            max_failures: self.config.max_failures,
            min_score: self.config.min_score,
            ..Default::default()
        });
        pool.register_all(&self.config.proxies)?;

        let gate = ConcurrencyGate::new(mode.effective_concurrency(pool.active_count()));
        let limiter = RateLimiter::with_overrides(
            BudgetConfig::new(mode.rate_per_minute, mode.burst_size),
            self.config.categories.clone(),
        );

        let identities = self
            .identity_catalog
            .unwrap_or_else(|| IdentityProvider::new(self.config.identity_rotation));

        let retry = RetryPolicy::new(self.config.retry.clone())
            .with_challenge_resolver(self.config.challenge_resolver);

        let metrics = self.enable_metrics.then(MetricsCollector::new);
        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        if let Some(ref collector) = metrics {
            events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
        }
        for handler in self.extra_handlers {
            events.register_handler(handler);
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

        let probe: Option<Arc<dyn ProxyProbe>> = match (self.probe, self.probe_target) {
            (Some(probe), _) => Some(probe),
            (None, Some(target)) => Some(Arc::new(ReqwestProbe::new(target))),
            (None, None) => None,
        };
        let health = match probe {
            Some(probe) if !pool.is_empty() => Some(HealthChecker::spawn(
                pool.clone(),
                probe,
                Duration::from_secs(self.config.health_check_interval_seconds.max(1)),
            )),
            _ => None,
        };

        Ok(Session {
            mode,
            gate,
            limiter,
            pool,
            identities,
            escalation: EscalationController::default(),
            retry,
            transport,
            events: Arc::new(events),
            metrics,
            health: StdMutex::new(health),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session: owns every piece of adaptive state. Fresh instance,
/// fresh state; nothing is shared behind the caller's back.
pub struct Session {
    mode: SpeedMode,
    gate: ConcurrencyGate,
    limiter: RateLimiter,
    pool: ProxyPool,
    identities: IdentityProvider,
    escalation: EscalationController,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    events: Arc<EventDispatcher>,
    metrics: Option<MetricsCollector>,
    health: StdMutex<Option<HealthChecker>>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Dispatch one logical call under the session's policy. Suspends at the
    /// gate, the rate budget, and pacing delays; retries retryable outcomes
    /// with a fresh proxy/identity until attempts run out.
    pub async fn dispatch(
        &self,
        request: RequestDescriptor,
        category: &str,
    ) -> DispatchResult<DispatchResponse> {
        self.refresh_concurrency();
        // Held for the whole logical call; Drop returns the slot on every
        // exit path, including cancellation.
        let _permit = self.gate.acquire().await;

        let max_attempts = self.retry.max_retries().max(1);
        let mut attempt = 0u32;
        let mut previous_identity: Option<Identity> = None;
        let mut need_distinct_identity = false;

        loop {
            attempt += 1;
            self.limiter.acquire(category).await?;

            let pacing = self.escalation.scale(self.mode.sample_delay());
            if !pacing.is_zero() {
                sleep(pacing).await;
            }

            let proxy = self.pool.select();
            let identity = match (&previous_identity, need_distinct_identity) {
                (Some(previous), true) => self.identities.next_distinct(previous),
                _ => self.identities.next_identity(),
            };
            need_distinct_identity = false;

            self.events.dispatch(DispatchEvent::Attempt(AttemptEvent {
                url: request.url.clone(),
                method: request.method.clone(),
                category: category.to_string(),
                attempt,
                proxy: proxy.as_ref().map(|p| p.id.clone()),
                profile: identity.profile.name.clone(),
                timestamp: Utc::now(),
            }));

            let timeout = request.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
            let started = Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                self.transport.send(&request, &identity, proxy.as_ref()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let latency = started.elapsed();

            let (mut classification, status, message) = match result {
                Ok(response) => {
                    let body = response.body_text();
                    let classification = self.retry.classify(&CallOutcome::Response {
                        status: response.status,
                        body: &body,
                    });
                    if response.status < 400 && classification.kind == ErrorKind::Unclassified {
                        self.settle_success(&request, category, &response, proxy.as_ref(), latency);
                        return Ok(DispatchResponse {
                            status: response.status,
                            headers: response.headers,
                            body: response.body,
                            attempts: attempt,
                            latency,
                        });
                    }
                    let message = status_message(&response, &body);
                    (classification, Some(response.status), message)
                }
                Err(err) => {
                    let outcome = match err {
                        TransportError::Timeout => CallOutcome::TransportTimeout,
                        _ => CallOutcome::TransportError,
                    };
                    (self.retry.classify(&outcome), None, err.to_string())
                }
            };

            // A configured pool with nothing eligible, and direct egress
            // failing too: stop instead of spinning on retries.
            if proxy.is_none()
                && !self.pool.is_empty()
                && classification.kind == ErrorKind::NetworkError
            {
                classification.kind = ErrorKind::ProxyExhausted;
                classification.retryable = false;
            }

            self.settle_failure(
                &request,
                category,
                classification.kind,
                status,
                proxy.as_ref(),
                latency,
            );

            let can_retry = classification.retryable && attempt < max_attempts;
            if !can_retry {
                self.events.dispatch(DispatchEvent::Error(ErrorEvent {
                    url: request.url.clone(),
                    kind: classification.kind,
                    attempts: attempt,
                    message: message.clone(),
                    timestamp: Utc::now(),
                }));
                return Err(DispatchError::Failed {
                    kind: classification.kind,
                    attempts: attempt,
                    message,
                });
            }

            let backoff = self
                .retry
                .next_delay(
                    attempt - 1,
                    classification.kind,
                    self.escalation.delay_multiplier(),
                )
                .mul_f32(self.mode.error_backoff.max(1.0));
            self.events
                .dispatch(DispatchEvent::RetryScheduled(RetryScheduledEvent {
                    url: request.url.clone(),
                    attempt: attempt + 1,
                    kind: classification.kind,
                    after: backoff,
                    timestamp: Utc::now(),
                }));
            if !backoff.is_zero() {
                sleep(backoff).await;
            }

            // A challenge means the presented identity is burned; the next
            // attempt must not reuse the profile.
            need_distinct_identity = classification.kind == ErrorKind::ChallengeRequired;
            previous_identity = Some(identity);
        }
    }

    fn settle_success(
        &self,
        request: &RequestDescriptor,
        category: &str,
        response: &TransportResponse,
        proxy: Option<&ProxySelection>,
        latency: Duration,
    ) {
        if let Some(selection) = proxy {
            self.pool
                .report(&selection.id, ProxyOutcome::Success { latency });
        }
        self.escalation.transition(EscalationSignal::Success);
        self.events.dispatch(DispatchEvent::Outcome(OutcomeEvent {
            url: request.url.clone(),
            category: category.to_string(),
            status: Some(response.status),
            kind: None,
            latency,
            timestamp: Utc::now(),
        }));
    }

    fn settle_failure(
        &self,
        request: &RequestDescriptor,
        category: &str,
        kind: ErrorKind,
        status: Option<u16>,
        proxy: Option<&ProxySelection>,
        latency: Duration,
    ) {
        if let Some(selection) = proxy {
            match kind {
                // Blocked/banned class burns the exit IP.
                ErrorKind::RateLimited | ErrorKind::ChallengeRequired => {
                    self.pool.report(&selection.id, ProxyOutcome::HardFailure);
                }
                ErrorKind::NetworkError | ErrorKind::Unclassified => {
                    self.pool.report(&selection.id, ProxyOutcome::SoftFailure);
                }
                // The egress itself worked; the session is what died.
                ErrorKind::AuthRequired | ErrorKind::ProxyExhausted => {}
            }
        }

        let signal = match kind {
            ErrorKind::RateLimited => EscalationSignal::RateLimited,
            ErrorKind::ChallengeRequired => EscalationSignal::ChallengeRequired,
            _ => EscalationSignal::OtherError,
        };
        self.escalation.transition(signal);
        self.events.dispatch(DispatchEvent::Escalated(EscalatedEvent {
            level: self.escalation.level(),
            kind,
            timestamp: Utc::now(),
        }));

        self.events.dispatch(DispatchEvent::Outcome(OutcomeEvent {
            url: request.url.clone(),
            category: category.to_string(),
            status,
            kind: Some(kind),
            latency,
            timestamp: Utc::now(),
        }));
    }

    /// Re-derive the gate capacity from the current proxy count. Called on
    /// every dispatch entry so background evictions are picked up promptly.
    fn refresh_concurrency(&self) {
        self.gate
            .resize(self.mode.effective_concurrency(self.pool.active_count()));
    }

    pub fn add_proxy(&self, url: &str) -> DispatchResult<()> {
        self.pool.register(url)?;
        self.refresh_concurrency();
        Ok(())
    }

    pub fn remove_proxy(&self, id: &str) {
        self.pool.remove(id);
        self.refresh_concurrency();
    }

    /// Current in-flight cap after proxy scaling.
    pub fn effective_concurrency(&self) -> usize {
        self.mode.effective_concurrency(self.pool.active_count())
    }

    pub fn proxy_snapshot(&self) -> Vec<ProxyView> {
        self.pool.snapshot()
    }

    pub fn escalation_level(&self) -> u32 {
        self.escalation.level()
    }

    pub fn mode(&self) -> &SpeedMode {
        &self.mode
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(MetricsCollector::snapshot)
    }

    /// Stop the background health checker, joining its task. Idempotent.
    pub async fn shutdown(&self) {
        let checker = self.health.lock().expect("health lock poisoned").take();
        if let Some(checker) = checker {
            checker.shutdown().await;
        }
    }
}

fn status_message(response: &TransportResponse, body: &str) -> String {
    let snippet: String = body.chars().take(120).collect();
    if snippet.is_empty() {
        format!("status {}", response.status)
    } else {
        format!("status {}: {}", response.status, snippet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_surface_parses_from_json() {
        let config = SessionConfig::from_json(
            r#"{
                "mode": "turbo",
                "proxies": ["http://1.1.1.1:8080"],
                "rotation_strategy": "round_robin",
                "health_check_interval_seconds": 120,
                "max_failures": 5,
                "min_score": 0.2,
                "retry": {"max_retries": 4, "backoff_factor": 3.0, "backoff_max": 30.0, "jitter": false},
                "identity_rotation": "random",
                "categories": {"write": {"rate_per_minute": 10, "burst_size": 2}},
                "challenge_resolver": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.mode, "turbo");
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.rotation_strategy, RotationStrategy::RoundRobin);
        assert_eq!(config.retry.max_retries, 4);
        assert!(!config.retry.jitter);
        assert_eq!(
            config.categories.get("write"),
            Some(&BudgetConfig::new(10, 2))
        );
        assert!(config.challenge_resolver);
    }

    #[test]
    fn custom_mode_requires_parameters() {
        let config = SessionConfig {
            mode: "custom".into(),
            ..Default::default()
        };
        assert!(config.mode().is_err());

        let config = SessionConfig::from_json(
            r#"{
                "mode": "custom",
                "custom_mode": {
                    "max_concurrency": 8,
                    "delay_range": [0.1, 0.5],
                    "rate_per_minute": 90,
                    "burst_size": 10,
                    "proxy_multiplier": 2.0,
                    "error_backoff": 1.4
                }
            }"#,
        )
        .unwrap();
        let mode = config.mode().unwrap();
        assert_eq!(mode.max_concurrency, 8);
        assert_eq!(mode.effective_concurrency(10), 28);
    }

    #[tokio::test]
    async fn builder_derives_gate_capacity_from_mode_and_proxies() {
        let session = Session::builder()
            .mode("fast")
            .proxies(["http://1.1.1.1:8080", "http://2.2.2.2:8080"])
            .build()
            .unwrap();
        // fast: 15 base + 2 proxies * 5.0 multiplier.
        assert_eq!(session.effective_concurrency(), 25);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        assert!(Session::builder().mode("warp").build().is_err());
    }
}
