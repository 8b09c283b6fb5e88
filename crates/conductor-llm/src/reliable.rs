use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use conductor_core::completion::{Completion, CompletionGateway, CompletionRequest};
use conductor_core::errors::GatewayError;
use conductor_telemetry::MetricsRecorder;

/// Retry and circuit breaker settings for [`ReliableGateway`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a gateway with retry logic and a circuit breaker.
///
/// - Transient errors are retried with exponential backoff plus jitter
/// - `retry_after` hints from rate limit responses win over the computed delay
/// - N consecutive failures open the circuit; after the cooldown one request is let through
pub struct ReliableGateway<G: CompletionGateway> {
    inner: G,
    config: ReliableConfig,
    circuit_state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU32>,
    total_retries: Arc<AtomicU64>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl<G: CompletionGateway> ReliableGateway<G> {
    pub fn new(inner: G, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_retries: Arc::new(AtomicU64::new(0)),
            metrics: None,
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::ProviderOverloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.circuit_breaker_threshold {
            let mut state = self.circuit_state.write();
            if matches!(*state, CircuitState::Closed | CircuitState::HalfOpen) {
                warn!(
                    failures,
                    cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_ms = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_ms.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[async_trait]
impl<G: CompletionGateway> CompletionGateway for ReliableGateway<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(completion) => {
                    self.record_success();
                    return Ok(completion);
                }
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    if e.is_fatal() || attempt >= self.config.max_retries {
                        self.record_failure();
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.counter_inc("gateway.retries", &[("role", request.role.as_str())], 1);
                    }

                    warn!(
                        role = %request.role,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying completion after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.check_circuit()?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGateway, MockResponse};
    use conductor_core::completion::{AgentRole, ModelSelection, ProviderKind};
    use conductor_core::messages::ChatMessage;

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            AgentRole::Worker,
            ModelSelection::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            vec![ChatMessage::user("hello")],
        )
    }

    fn fast_config() -> ReliableConfig {
        ReliableConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let mock = MockGateway::new(vec![
            MockResponse::Error(GatewayError::ServerError {
                status: 500,
                body: "oops".into(),
            }),
            MockResponse::text("recovered"),
        ]);
        let metrics = Arc::new(MetricsRecorder::in_memory());
        let gateway = ReliableGateway::new(mock, fast_config()).with_metrics(Arc::clone(&metrics));

        let completion = gateway.complete(request()).await.unwrap();
        assert_eq!(completion.text_or_empty(), "recovered");
        assert_eq!(gateway.total_retries(), 1);
        assert_eq!(gateway.inner().call_count(), 2);
        assert_eq!(metrics.counter_get("gateway.retries", &[("role", "worker")]), 1);
        assert_eq!(gateway.circuit_state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let mock = MockGateway::new(vec![MockResponse::Error(GatewayError::AuthenticationFailed(
            "bad key".into(),
        ))]);
        let gateway = ReliableGateway::new(mock, fast_config());

        let err = gateway.complete(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
        assert_eq!(gateway.total_retries(), 0);
        assert_eq!(gateway.inner().call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let mock = MockGateway::new(vec![
            MockResponse::Error(GatewayError::ProviderOverloaded),
            MockResponse::Error(GatewayError::ProviderOverloaded),
            MockResponse::Error(GatewayError::ProviderOverloaded),
        ]);
        let gateway = ReliableGateway::new(mock, fast_config());

        let err = gateway.complete(request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(gateway.inner().call_count(), 3);
        assert_eq!(gateway.total_retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_consecutive_failures() {
        let mock = MockGateway::new(vec![
            MockResponse::Error(GatewayError::InvalidRequest("a".into())),
            MockResponse::Error(GatewayError::InvalidRequest("b".into())),
        ]);
        let gateway = ReliableGateway::new(mock, fast_config());

        let _ = gateway.complete(request()).await;
        let _ = gateway.complete(request()).await;
        assert_eq!(gateway.circuit_state_name(), "open");

        let err = gateway.complete(request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProviderOverloaded));
        assert_eq!(gateway.inner().call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_does_not_count_as_failure() {
        let mock = MockGateway::new(vec![
            MockResponse::Error(GatewayError::Cancelled),
            MockResponse::Error(GatewayError::Cancelled),
            MockResponse::Error(GatewayError::Cancelled),
        ]);
        let gateway = ReliableGateway::new(mock, fast_config());
        for _ in 0..3 {
            assert!(matches!(
                gateway.complete(request()).await,
                Err(GatewayError::Cancelled)
            ));
        }
        assert_eq!(gateway.circuit_state_name(), "closed");
    }

    #[test]
    fn rate_limit_hint_overrides_backoff() {
        let gateway = ReliableGateway::new(MockGateway::new(vec![]), fast_config());
        assert_eq!(
            gateway.retry_delay(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(gateway.retry_delay(0, None), Duration::from_millis(10));
        assert_eq!(gateway.retry_delay(1, None), Duration::from_millis(20));
        assert_eq!(gateway.retry_delay(5, None), Duration::from_millis(50));
    }
}
