//! Event hooks around the dispatch lifecycle.
//!
//! Provides structured notifications for logging, metrics, and custom
//! reactions without coupling the dispatcher to any particular sink.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use super::retry::ErrorKind;

/// Emitted just before an attempt hits the transport.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub url: Url,
    pub method: Method,
    pub category: String,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub profile: String,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once an attempt settles, success or not.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub url: Url,
    pub category: String,
    pub status: Option<u16>,
    pub kind: Option<ErrorKind>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryScheduledEvent {
    pub url: Url,
    pub attempt: u32,
    pub kind: ErrorKind,
    pub after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalatedEvent {
    pub level: u32,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: Url,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Attempt(AttemptEvent),
    Outcome(OutcomeEvent),
    RetryScheduled(RetryScheduledEvent),
    Escalated(EscalatedEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DispatchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: DispatchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Attempt(attempt) => {
                log::debug!(
                    "-> {} {} [{}] attempt={} proxy={} profile={}",
                    attempt.method,
                    attempt.url,
                    attempt.category,
                    attempt.attempt,
                    attempt.proxy.as_deref().unwrap_or("direct"),
                    attempt.profile,
                );
            }
            DispatchEvent::Outcome(outcome) => {
                log::debug!(
                    "<- {} [{}] status={:?} kind={:?} ({:.2}s)",
                    outcome.url,
                    outcome.category,
                    outcome.status,
                    outcome.kind.map(|kind| kind.as_str()),
                    outcome.latency.as_secs_f64(),
                );
            }
            DispatchEvent::RetryScheduled(retry) => {
                log::info!(
                    "retry {} attempt {} ({}) after {:.2}s",
                    retry.url,
                    retry.attempt,
                    retry.kind.as_str(),
                    retry.after.as_secs_f64(),
                );
            }
            DispatchEvent::Escalated(escalated) => {
                log::warn!(
                    "escalation level now {} ({})",
                    escalated.level,
                    escalated.kind.as_str(),
                );
            }
            DispatchEvent::Error(error) => {
                log::warn!(
                    "{} failed ({}) after {} attempt(s): {}",
                    error.url,
                    error.kind.as_str(),
                    error.attempts,
                    error.message,
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Outcome(outcome) => {
                self.metrics.record_outcome(
                    &outcome.category,
                    outcome.status,
                    outcome.kind,
                    outcome.latency,
                );
            }
            DispatchEvent::RetryScheduled(_) => {
                self.metrics.record_retry();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &DispatchEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(DispatchEvent::Escalated(EscalatedEvent {
            level: 2,
            kind: ErrorKind::RateLimited,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_retries() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&DispatchEvent::RetryScheduled(RetryScheduledEvent {
            url: Url::parse("https://example.com/a").unwrap(),
            attempt: 2,
            kind: ErrorKind::NetworkError,
            after: Duration::from_secs(1),
            timestamp: Utc::now(),
        }));
        assert_eq!(metrics.snapshot().global.retries, 1);
    }
}
