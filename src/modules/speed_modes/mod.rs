//! Speed mode presets and effective concurrency derivation.
//!
//! A speed mode bundles the concurrency, pacing, and rate parameters that the
//! dispatcher enforces. Presets trade throughput against detection risk.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// In-flight cap applied to every mode except `unlimited`, regardless of how
/// many proxies are registered.
pub const CONCURRENCY_HARD_CAP: usize = 200;

#[derive(Debug, Error)]
pub enum SpeedModeError {
    #[error("unknown speed mode '{0}'")]
    UnknownMode(String),
    #[error("max_concurrency must be greater than zero")]
    ZeroConcurrency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Safe,
    Fast,
    Turbo,
    Unlimited,
    Custom,
}

/// Immutable bundle of pacing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedMode {
    pub kind: ModeKind,
    pub max_concurrency: usize,
    pub delay_range: (f32, f32),
    pub rate_per_minute: u32,
    pub burst_size: u32,
    pub proxy_multiplier: f32,
    pub error_backoff: f32,
}

impl SpeedMode {
    pub fn safe() -> Self {
        Self {
            kind: ModeKind::Safe,
            max_concurrency: 5,
            delay_range: (0.8, 2.0),
            rate_per_minute: 30,
            burst_size: 3,
            proxy_multiplier: 3.0,
            error_backoff: 2.0,
        }
    }

    pub fn fast() -> Self {
        Self {
            kind: ModeKind::Fast,
            max_concurrency: 15,
            delay_range: (0.2, 0.8),
            rate_per_minute: 60,
            burst_size: 8,
            proxy_multiplier: 5.0,
            error_backoff: 1.5,
        }
    }

    pub fn turbo() -> Self {
        Self {
            kind: ModeKind::Turbo,
            max_concurrency: 50,
            delay_range: (0.05, 0.3),
            rate_per_minute: 120,
            burst_size: 20,
            proxy_multiplier: 10.0,
            error_backoff: 1.2,
        }
    }

    /// No pacing at all. Concurrency is still bounded by `max_concurrency`,
    /// which doubles as the hard cap for this mode.
    pub fn unlimited() -> Self {
        Self {
            kind: ModeKind::Unlimited,
            max_concurrency: 1000,
            delay_range: (0.0, 0.0),
            rate_per_minute: 999_999,
            burst_size: 1000,
            proxy_multiplier: 10.0,
            error_backoff: 1.0,
        }
    }

    /// Build a custom mode. The delay range is normalised so `min <= max`.
    pub fn custom(
        max_concurrency: usize,
        delay_range: (f32, f32),
        rate_per_minute: u32,
        burst_size: u32,
        proxy_multiplier: f32,
        error_backoff: f32,
    ) -> Result<Self, SpeedModeError> {
        if max_concurrency == 0 {
            return Err(SpeedModeError::ZeroConcurrency);
        }
        let (min, max) = (delay_range.0.max(0.0), delay_range.1.max(0.0));
        let delay_range = if max < min { (min, min) } else { (min, max) };
        Ok(Self {
            kind: ModeKind::Custom,
            max_concurrency,
            delay_range,
            rate_per_minute,
            burst_size,
            proxy_multiplier,
            error_backoff,
        })
    }

    pub fn named(name: &str) -> Result<Self, SpeedModeError> {
        match name.to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::safe()),
            "fast" => Ok(Self::fast()),
            "turbo" => Ok(Self::turbo()),
            "unlimited" => Ok(Self::unlimited()),
            other => Err(SpeedModeError::UnknownMode(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ModeKind::Safe => "safe",
            ModeKind::Fast => "fast",
            ModeKind::Turbo => "turbo",
            ModeKind::Unlimited => "unlimited",
            ModeKind::Custom => "custom",
        }
    }

    /// In-flight request cap once proxy scaling is applied.
    ///
    /// Every proxy buys `proxy_multiplier` extra slots, capped at
    /// [`CONCURRENCY_HARD_CAP`]. Unlimited mode ignores proxy scaling.
    pub fn effective_concurrency(&self, proxy_count: usize) -> usize {
        if self.kind == ModeKind::Unlimited {
            return self.max_concurrency;
        }
        let extra = (proxy_count as f32 * self.proxy_multiplier).floor() as usize;
        (self.max_concurrency + extra).min(CONCURRENCY_HARD_CAP)
    }

    /// Sample a base inter-request delay from the mode's range.
    ///
    /// Gaussian around the range midpoint, clamped to `[min, 1.5 * max]`,
    /// with a rare longer pause mixed in so traffic does not tick like a
    /// metronome.
    pub fn sample_delay(&self) -> Duration {
        let (min_d, max_d) = self.delay_range;
        if max_d <= 0.0 {
            return Duration::ZERO;
        }

        let mut rng = rand::thread_rng();
        let mean = (min_d + max_d) / 2.0;
        let std = (max_d - min_d) / 4.0;
        // Box-Muller; rand 0.8 has no gaussian distribution without rand_distr.
        let (u1, u2): (f32, f32) = (rng.r#gen::<f32>().max(f32::EPSILON), rng.r#gen());
        let gauss = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
        let mut delay = (mean + gauss * std).clamp(min_d, max_d * 1.5);

        if rng.r#gen::<f32>() < 0.01 {
            delay += rng.gen_range(1.0..3.0);
        }

        Duration::from_secs_f32(delay)
    }
}

impl Default for SpeedMode {
    fn default() -> Self {
        Self::safe()
    }
}
