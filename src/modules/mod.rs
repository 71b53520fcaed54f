//! Core subsystems module
//!
//! Hosts the policy pieces the dispatcher wires together: pacing modes, the
//! concurrency gate, rate budgets, the proxy pool and its health checker,
//! identity rotation, escalation, retry, plus events and metrics.

pub mod escalation;
pub mod events;
pub mod gate;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod proxy;
pub mod rate_limiter;
pub mod retry;
pub mod speed_modes;

// Re-export commonly used types
pub use escalation::{DEFAULT_LEVEL_CAP, EscalationController, EscalationSignal};
pub use events::{
    AttemptEvent, DispatchEvent, ErrorEvent, EscalatedEvent, EventDispatcher, EventHandler,
    LoggingHandler, MetricsHandler, OutcomeEvent, RetryScheduledEvent,
};
pub use gate::{ConcurrencyGate, GatePermit};
pub use health::{
    DEFAULT_HEALTH_INTERVAL, HealthChecker, ProbeResult, ProxyProbe, ReqwestProbe,
};
pub use identity::{
    DeviceSignature, FingerprintProfile, Identity, IdentityError, IdentityProvider,
    IdentityRotation,
};
pub use metrics::{CategoryStats, GlobalStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{
    PoolConfig, ProxyOutcome, ProxyPool, ProxyPoolError, ProxySelection, ProxyView,
    RotationStrategy,
};
pub use rate_limiter::{BudgetConfig, RateLimitError, RateLimiter};
pub use retry::{CallOutcome, Classification, ErrorKind, RetryConfig, RetryPolicy};
pub use speed_modes::{CONCURRENCY_HARD_CAP, ModeKind, SpeedMode, SpeedModeError};
