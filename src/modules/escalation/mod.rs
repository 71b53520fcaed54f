//! Hostility escalation state machine.
//!
//! Tracks an integer level per session that scales inter-request delays.
//! Hostile outcomes push the level up; a sustained run of successes walks it
//! back down one step at a time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long successes must keep coming before the level drops one step.
const DECAY_STREAK: Duration = Duration::from_secs(30);
/// Delay grows by this fraction per level.
const DELAY_STEP: f32 = 0.3;

pub const DEFAULT_LEVEL_CAP: u32 = 5;

/// Outcome classes the controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationSignal {
    Success,
    RateLimited,
    ChallengeRequired,
    OtherError,
}

#[derive(Debug)]
struct EscalationState {
    level: u32,
    /// Start of the current uninterrupted success streak.
    streak_started: Option<Instant>,
    last_transition: Instant,
}

/// Single-writer controller; clones share state for multi-reader access.
#[derive(Debug, Clone)]
pub struct EscalationController {
    state: Arc<Mutex<EscalationState>>,
    cap: u32,
}

impl EscalationController {
    pub fn new(cap: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(EscalationState {
                level: 0,
                streak_started: None,
                last_transition: Instant::now(),
            })),
            cap,
        }
    }

    /// Feed one observed outcome through the state machine.
    pub fn transition(&self, signal: EscalationSignal) {
        let mut state = self.state.lock().expect("escalation lock poisoned");
        let now = Instant::now();
        match signal {
            EscalationSignal::Success => {
                let streak_started = *state.streak_started.get_or_insert(now);
                if now.duration_since(streak_started) >= DECAY_STREAK && state.level > 0 {
                    state.level -= 1;
                    state.last_transition = now;
                    // Each step down requires a full fresh streak.
                    state.streak_started = Some(now);
                }
            }
            EscalationSignal::RateLimited => self.bump(&mut state, 2, now),
            EscalationSignal::ChallengeRequired => self.bump(&mut state, 3, now),
            EscalationSignal::OtherError => self.bump(&mut state, 1, now),
        }
    }

    fn bump(&self, state: &mut EscalationState, steps: u32, now: Instant) {
        state.level = (state.level + steps).min(self.cap);
        state.streak_started = None;
        state.last_transition = now;
    }

    pub fn level(&self) -> u32 {
        self.state.lock().expect("escalation lock poisoned").level
    }

    /// `1 + 0.3 * level` — the only feedback path from outcomes to pacing.
    pub fn delay_multiplier(&self) -> f32 {
        1.0 + DELAY_STEP * self.level() as f32
    }

    pub fn scale(&self, base: Duration) -> Duration {
        base.mul_f32(self.delay_multiplier())
    }
}

impl Default for EscalationController {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL_CAP)
    }
}
