//! Outcome classification and retry/backoff policy.
//!
//! Maps raw transport outcomes onto a small error taxonomy and decides
//! whether, and after how long, a call should be re-attempted. Exponential
//! backoff with a ceiling and optional ±30% jitter.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::time::Duration;

/// Smallest delay ever returned; avoids hot-spinning on tiny backoffs.
const DELAY_FLOOR: Duration = Duration::from_millis(100);

/// Classified failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimited,
    ChallengeRequired,
    NetworkError,
    /// Session is dead; re-auth is an external concern, never retried here.
    AuthRequired,
    /// No eligible proxy left and direct egress failed too.
    ProxyExhausted,
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ChallengeRequired => "challenge_required",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::ProxyExhausted => "proxy_exhausted",
            ErrorKind::Unclassified => "unclassified",
        }
    }
}

/// Raw outcome of one transport attempt, as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    Response { status: u16, body: &'a str },
    TransportTimeout,
    TransportError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// Tunable retry knobs; defaults follow the classic 3 × factor-2 schedule.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: f32,
    pub backoff_factor: f32,
    pub backoff_max: f32,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: 1.0,
            backoff_factor: 2.0,
            backoff_max: 60.0,
            jitter: true,
        }
    }
}

/// Decides retryability and backoff per classified outcome.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    /// Whether a challenge-resolution collaborator is wired up. Without one,
    /// a challenge is terminal.
    challenge_resolver: bool,
    /// Statuses outside the built-in rules that still warrant a retry.
    extra_retry_statuses: HashSet<u16>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            challenge_resolver: false,
            extra_retry_statuses: HashSet::new(),
        }
    }

    pub fn with_challenge_resolver(mut self, available: bool) -> Self {
        self.challenge_resolver = available;
        self
    }

    pub fn with_extra_retry_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.extra_retry_statuses.extend(statuses);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn classify(&self, outcome: &CallOutcome<'_>) -> Classification {
        match *outcome {
            CallOutcome::TransportTimeout | CallOutcome::TransportError => Classification {
                kind: ErrorKind::NetworkError,
                retryable: true,
            },
            CallOutcome::Response { status, body } => self.classify_response(status, body),
        }
    }

    fn classify_response(&self, status: u16, body: &str) -> Classification {
        if status == 429 {
            return Classification {
                kind: ErrorKind::RateLimited,
                retryable: true,
            };
        }
        if status == 401 || SESSION_INVALID_RE.is_match(body) {
            return Classification {
                kind: ErrorKind::AuthRequired,
                retryable: false,
            };
        }
        if CHALLENGE_RE.is_match(body) {
            return Classification {
                kind: ErrorKind::ChallengeRequired,
                retryable: self.challenge_resolver,
            };
        }
        if status >= 500 {
            return Classification {
                kind: ErrorKind::NetworkError,
                retryable: true,
            };
        }
        Classification {
            kind: ErrorKind::Unclassified,
            retryable: self.extra_retry_statuses.contains(&status),
        }
    }

    /// Backoff before attempt `attempt` (0-indexed) is retried:
    /// `min(backoff_max, base * factor^attempt) * escalation`, jittered ±30%.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind, escalation_multiplier: f32) -> Duration {
        if matches!(kind, ErrorKind::AuthRequired | ErrorKind::ProxyExhausted) {
            return Duration::ZERO;
        }

        let raw = self.config.base_backoff * self.config.backoff_factor.powi(attempt as i32);
        let mut delay = raw.min(self.config.backoff_max) * escalation_multiplier.max(1.0);

        if self.config.jitter {
            let multiplier = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            delay *= multiplier;
        }

        Duration::from_secs_f32(delay.max(0.0)).max(DELAY_FLOOR)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

static CHALLENGE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"challenge_required|checkpoint_required|checkpoint_challenge")
        .case_insensitive(true)
        .build()
        .expect("invalid challenge regex")
});

static SESSION_INVALID_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"login_required|session_expired|invalid_session")
        .case_insensitive(true)
        .build()
        .expect("invalid session regex")
});
