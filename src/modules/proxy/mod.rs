//! Proxy pool with health scoring and rotation.
//!
//! Tracks a mutable health score per egress proxy, selects the next candidate
//! under the configured rotation strategy, and evicts endpoints that keep
//! failing. State is locked per entry so a slow health probe updating one
//! proxy never stalls selection or reports on the others.

use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

const SCORE_ON_SUCCESS: f64 = 0.05;
const SCORE_ON_SOFT_FAILURE: f64 = 0.10;
const SCORE_ON_HARD_FAILURE: f64 = 0.30;
const LATENCY_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Error)]
pub enum ProxyPoolError {
    #[error("invalid proxy url '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Strategy used by [`ProxyPool::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    #[default]
    Weighted,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub strategy: RotationStrategy,
    /// Evict once `consecutive_failures` exceeds this.
    pub max_failures: u32,
    /// Entries at or below this score are not selectable.
    pub min_score: f64,
    /// How long a sub-threshold score is tolerated before eviction.
    pub low_score_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::Weighted,
            max_failures: 3,
            min_score: 0.3,
            low_score_grace: Duration::from_secs(60),
        }
    }
}

/// Outcome of one request or probe through a proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyOutcome {
    Success { latency: Duration },
    /// Timeout or connect error; the proxy may just be slow.
    SoftFailure,
    /// Blocked/banned signal from the target; the exit IP is burned.
    HardFailure,
}

#[derive(Debug)]
struct EntryState {
    score: f64,
    consecutive_failures: u32,
    last_used_at: Option<Instant>,
    last_checked_at: Option<Instant>,
    mean_latency_ms: Option<f64>,
    /// Set when the score first drops below `min_score`; cleared on recovery.
    low_since: Option<Instant>,
    /// Round-robin skips this entry while `cooldown_cycle > current cycle`.
    cooldown_cycle: u64,
}

#[derive(Debug)]
struct ProxySlot {
    id: String,
    endpoint: Url,
    state: Mutex<EntryState>,
}

/// Read-only view of one pool entry.
#[derive(Debug, Clone)]
pub struct ProxyView {
    pub id: String,
    pub endpoint: Url,
    pub score: f64,
    pub consecutive_failures: u32,
    pub mean_latency_ms: Option<f64>,
    pub idle_for: Option<Duration>,
    pub checked_ago: Option<Duration>,
}

/// Selected proxy handed to the transport. `id` keys the outcome report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySelection {
    pub id: String,
    pub endpoint: Url,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    registry: RwLock<Vec<Arc<ProxySlot>>>,
    cursor: Mutex<usize>,
    cycle: AtomicU64,
}

/// Shared, cloneable pool handle.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    inner: Arc<PoolInner>,
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry: RwLock::new(Vec::new()),
                cursor: Mutex::new(0),
                cycle: AtomicU64::new(0),
            }),
        }
    }

    /// Register a proxy endpoint. The normalized URL is the stable identity;
    /// duplicates are ignored.
    pub fn register(&self, url: &str) -> Result<(), ProxyPoolError> {
        let endpoint = Url::parse(url.trim()).map_err(|source| ProxyPoolError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let id = normalize_id(&endpoint);

        let mut registry = self.inner.registry.write().expect("pool lock poisoned");
        if registry.iter().any(|slot| slot.id == id) {
            return Ok(());
        }
        registry.push(Arc::new(ProxySlot {
            id,
            endpoint,
            state: Mutex::new(EntryState {
                score: 1.0,
                consecutive_failures: 0,
                last_used_at: None,
                last_checked_at: None,
                mean_latency_ms: None,
                low_since: None,
                cooldown_cycle: 0,
            }),
        }));
        Ok(())
    }

    pub fn register_all<I, S>(&self, urls: I) -> Result<(), ProxyPoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            self.register(url.as_ref())?;
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) {
        let mut registry = self.inner.registry.write().expect("pool lock poisoned");
        registry.retain(|slot| slot.id != id);
    }

    /// Number of registered entries, healthy or not.
    pub fn len(&self) -> usize {
        self.inner.registry.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries currently above the score threshold; drives proxy-scaled
    /// concurrency.
    pub fn active_count(&self) -> usize {
        let registry = self.inner.registry.read().expect("pool lock poisoned");
        registry
            .iter()
            .filter(|slot| self.entry_score(slot) > self.inner.config.min_score)
            .count()
    }

    fn entry_score(&self, slot: &ProxySlot) -> f64 {
        slot.state.lock().expect("entry lock poisoned").score
    }

    /// Pick the next proxy, or `None` for direct egress (empty pool or no
    /// eligible entry). Selection stamps `last_used_at`.
    pub fn select(&self) -> Option<ProxySelection> {
        let eligible: Vec<Arc<ProxySlot>> = {
            let registry = self.inner.registry.read().expect("pool lock poisoned");
            registry
                .iter()
                .filter(|slot| self.entry_score(slot) > self.inner.config.min_score)
                .cloned()
                .collect()
        };
        if eligible.is_empty() {
            return None;
        }

        let slot = match self.inner.config.strategy {
            RotationStrategy::RoundRobin => self.pick_round_robin(&eligible),
            RotationStrategy::Random => {
                let mut rng = rand::thread_rng();
                eligible.choose(&mut rng).cloned()?
            }
            RotationStrategy::Weighted => self.pick_weighted(&eligible),
        };

        {
            let mut state = slot.state.lock().expect("entry lock poisoned");
            state.last_used_at = Some(Instant::now());
        }
        Some(ProxySelection {
            id: slot.id.clone(),
            endpoint: slot.endpoint.clone(),
        })
    }

    /// Cyclic order, skipping entries that failed during the previous cycle
    /// until a full cycle has passed. Falls back to plain cyclic order when
    /// every candidate is cooling down.
    fn pick_round_robin(&self, eligible: &[Arc<ProxySlot>]) -> Arc<ProxySlot> {
        let mut cursor = self.inner.cursor.lock().expect("cursor lock poisoned");
        let cycle = self.inner.cycle.load(Ordering::Relaxed);

        let mut fallback: Option<Arc<ProxySlot>> = None;
        for _ in 0..eligible.len() {
            let idx = *cursor % eligible.len();
            *cursor = cursor.wrapping_add(1);
            if *cursor % eligible.len() == 0 {
                self.inner.cycle.fetch_add(1, Ordering::Relaxed);
            }

            let slot = &eligible[idx];
            if fallback.is_none() {
                fallback = Some(slot.clone());
            }
            let cooling = {
                let state = slot.state.lock().expect("entry lock poisoned");
                state.cooldown_cycle > cycle
            };
            if !cooling {
                return slot.clone();
            }
        }
        fallback.unwrap_or_else(|| eligible[0].clone())
    }

    /// Probability proportional to score; among equal scores the entry with
    /// the fewest consecutive failures wins.
    fn pick_weighted(&self, eligible: &[Arc<ProxySlot>]) -> Arc<ProxySlot> {
        let mut rng = rand::thread_rng();
        let snapshots: Vec<(f64, u32)> = eligible
            .iter()
            .map(|slot| {
                let state = slot.state.lock().expect("entry lock poisoned");
                (state.score.max(0.01), state.consecutive_failures)
            })
            .collect();

        let total: f64 = snapshots.iter().map(|(score, _)| score).sum();
        let mut target = rng.gen_range(0.0..total);
        let mut picked = eligible.len() - 1;
        for (idx, (weight, _)) in snapshots.iter().enumerate() {
            if target <= *weight {
                picked = idx;
                break;
            }
            target -= weight;
        }

        // Tie break: among entries sharing the picked score, prefer the
        // fewest consecutive failures. If the picked entry already ties the
        // minimum, the random choice stands.
        let picked_score = snapshots[picked].0;
        let min_failures = snapshots
            .iter()
            .filter(|(score, _)| (*score - picked_score).abs() < f64::EPSILON)
            .map(|(_, failures)| *failures)
            .min()
            .unwrap_or(0);
        if snapshots[picked].1 > min_failures {
            if let Some((idx, _)) = snapshots.iter().enumerate().find(|(_, (score, failures))| {
                (*score - picked_score).abs() < f64::EPSILON && *failures == min_failures
            }) {
                picked = idx;
            }
        }
        eligible[picked].clone()
    }

    /// Absorb a request or probe outcome for one entry.
    pub fn report(&self, id: &str, outcome: ProxyOutcome) {
        let slot = {
            let registry = self.inner.registry.read().expect("pool lock poisoned");
            registry.iter().find(|slot| slot.id == id).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        let evict = {
            let mut state = slot.state.lock().expect("entry lock poisoned");
            match outcome {
                ProxyOutcome::Success { latency } => {
                    state.score = (state.score + SCORE_ON_SUCCESS).min(1.0);
                    state.consecutive_failures = 0;
                    let sample = latency.as_secs_f64() * 1000.0;
                    state.mean_latency_ms = Some(match state.mean_latency_ms {
                        None => sample,
                        Some(mean) => (1.0 - LATENCY_EMA_ALPHA) * mean + LATENCY_EMA_ALPHA * sample,
                    });
                }
                ProxyOutcome::SoftFailure => {
                    state.score = (state.score - SCORE_ON_SOFT_FAILURE).max(0.0);
                    state.consecutive_failures += 1;
                    self.start_cooldown(&mut state);
                }
                ProxyOutcome::HardFailure => {
                    state.score = (state.score - SCORE_ON_HARD_FAILURE).max(0.0);
                    state.consecutive_failures += 1;
                    self.start_cooldown(&mut state);
                }
            }
            self.eviction_due(&mut state)
        };

        if evict {
            log::warn!("evicting proxy {id} (unhealthy)");
            self.remove(id);
        }
    }

    fn start_cooldown(&self, state: &mut EntryState) {
        state.cooldown_cycle = self.inner.cycle.load(Ordering::Relaxed) + 1;
    }

    /// Failure-count eviction is immediate; low-score eviction waits out the
    /// grace window so one bad blip does not drop an otherwise good proxy.
    fn eviction_due(&self, state: &mut EntryState) -> bool {
        let config = &self.inner.config;
        if state.consecutive_failures > config.max_failures {
            return true;
        }
        if state.score < config.min_score {
            match state.low_since {
                None => {
                    state.low_since = Some(Instant::now());
                    false
                }
                Some(since) => since.elapsed() > config.low_score_grace,
            }
        } else {
            state.low_since = None;
            false
        }
    }

    /// Stamp a health-check pass without changing the score.
    pub fn mark_checked(&self, id: &str) {
        let registry = self.inner.registry.read().expect("pool lock poisoned");
        if let Some(slot) = registry.iter().find(|slot| slot.id == id) {
            let mut state = slot.state.lock().expect("entry lock poisoned");
            state.last_checked_at = Some(Instant::now());
        }
    }

    pub fn snapshot(&self) -> Vec<ProxyView> {
        let registry = self.inner.registry.read().expect("pool lock poisoned");
        registry
            .iter()
            .map(|slot| {
                let state = slot.state.lock().expect("entry lock poisoned");
                ProxyView {
                    id: slot.id.clone(),
                    endpoint: slot.endpoint.clone(),
                    score: state.score,
                    consecutive_failures: state.consecutive_failures,
                    mean_latency_ms: state.mean_latency_ms,
                    idle_for: state.last_used_at.map(|at| at.elapsed()),
                    checked_ago: state.last_checked_at.map(|at| at.elapsed()),
                }
            })
            .collect()
    }

    /// Endpoints for the health checker to probe.
    pub fn endpoints(&self) -> Vec<(String, Url)> {
        let registry = self.inner.registry.read().expect("pool lock poisoned");
        registry
            .iter()
            .map(|slot| (slot.id.clone(), slot.endpoint.clone()))
            .collect()
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

fn normalize_id(endpoint: &Url) -> String {
    endpoint.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(strategy: RotationStrategy, urls: &[&str]) -> ProxyPool {
        let pool = ProxyPool::new(PoolConfig {
            strategy,
            ..Default::default()
        });
        pool.register_all(urls).unwrap();
        pool
    }

    #[test]
    fn registration_dedupes_by_normalized_url() {
        let pool = ProxyPool::default();
        pool.register("http://1.1.1.1:8080").unwrap();
        pool.register("http://1.1.1.1:8080/").unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn empty_pool_selects_direct_egress() {
        let pool = ProxyPool::default();
        assert_eq!(pool.select(), None);
    }

    #[test]
    fn success_reports_are_monotone_and_capped() {
        let pool = pool_with(RotationStrategy::Weighted, &["http://1.1.1.1:8080"]);
        let id = pool.snapshot()[0].id.clone();

        let mut last = 0.0;
        for _ in 0..40 {
            pool.report(
                &id,
                ProxyOutcome::Success {
                    latency: Duration::from_millis(120),
                },
            );
            let score = pool.snapshot()[0].score;
            assert!(score >= last);
            assert!(score <= 1.0);
            last = score;
        }
        assert_eq!(pool.snapshot()[0].consecutive_failures, 0);
        assert!(pool.snapshot()[0].mean_latency_ms.is_some());
    }

    #[test]
    fn hard_failures_evict_past_max_failures() {
        let pool = pool_with(RotationStrategy::Weighted, &["http://1.1.1.1:8080"]);
        let id = pool.snapshot()[0].id.clone();

        for _ in 0..4 {
            pool.report(&id, ProxyOutcome::HardFailure);
        }
        // 4 consecutive hard failures > max_failures (3): gone from select().
        assert_eq!(pool.select(), None);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn low_score_waits_for_grace_window() {
        let pool = ProxyPool::new(PoolConfig {
            max_failures: 100,
            low_score_grace: Duration::from_secs(60),
            ..Default::default()
        });
        pool.register("http://1.1.1.1:8080").unwrap();
        let id = pool.snapshot()[0].id.clone();

        // Drive score below min_score with soft failures.
        for _ in 0..9 {
            pool.report(&id, ProxyOutcome::SoftFailure);
        }
        // Below threshold but still registered during the grace window.
        assert_eq!(pool.len(), 1);
        assert!(pool.snapshot()[0].score < 0.3);
        // Not selectable while under the threshold.
        assert_eq!(pool.select(), None);
    }

    #[test]
    fn low_score_eviction_after_grace_expiry() {
        let pool = ProxyPool::new(PoolConfig {
            max_failures: 100,
            low_score_grace: Duration::ZERO,
            ..Default::default()
        });
        pool.register("http://1.1.1.1:8080").unwrap();
        let id = pool.snapshot()[0].id.clone();

        for _ in 0..9 {
            pool.report(&id, ProxyOutcome::SoftFailure);
        }
        std::thread::sleep(Duration::from_millis(5));
        pool.report(&id, ProxyOutcome::SoftFailure);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn recovery_clears_low_score_tracking() {
        let pool = ProxyPool::new(PoolConfig {
            max_failures: 100,
            low_score_grace: Duration::from_secs(600),
            ..Default::default()
        });
        pool.register("http://1.1.1.1:8080").unwrap();
        let id = pool.snapshot()[0].id.clone();

        for _ in 0..8 {
            pool.report(&id, ProxyOutcome::SoftFailure);
        }
        for _ in 0..6 {
            pool.report(
                &id,
                ProxyOutcome::Success {
                    latency: Duration::from_millis(80),
                },
            );
        }
        assert!(pool.snapshot()[0].score > 0.3);
        assert!(pool.select().is_some());
    }

    #[test]
    fn round_robin_cycles_through_entries() {
        let pool = pool_with(
            RotationStrategy::RoundRobin,
            &[
                "http://1.1.1.1:8080",
                "http://2.2.2.2:8080",
                "http://3.3.3.3:8080",
            ],
        );
        let first = pool.select().unwrap();
        let second = pool.select().unwrap();
        let third = pool.select().unwrap();
        let fourth = pool.select().unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(second.id, third.id);
        assert_eq!(first.id, fourth.id);
    }

    #[test]
    fn round_robin_skips_recently_failed_for_one_cycle() {
        let pool = pool_with(
            RotationStrategy::RoundRobin,
            &["http://1.1.1.1:8080", "http://2.2.2.2:8080"],
        );
        let first = pool.select().unwrap();
        pool.report(&first.id, ProxyOutcome::SoftFailure);

        // The failed entry sits out until the cycle it was failed in ends.
        let next = pool.select().unwrap();
        assert_ne!(next.id, first.id);
    }

    #[test]
    fn weighted_prefers_higher_scores() {
        let pool = pool_with(
            RotationStrategy::Weighted,
            &["http://good.example:8080", "http://bad.example:8080"],
        );
        let bad_id = pool
            .snapshot()
            .iter()
            .find(|view| view.id.contains("bad"))
            .unwrap()
            .id
            .clone();
        // Depress the bad proxy to just above the eligibility floor.
        for _ in 0..6 {
            pool.report(&bad_id, ProxyOutcome::SoftFailure);
        }
        pool.report(
            &bad_id,
            ProxyOutcome::Success {
                latency: Duration::from_millis(50),
            },
        );

        let mut good_picks = 0;
        for _ in 0..200 {
            if !pool.select().unwrap().id.contains("bad") {
                good_picks += 1;
            }
        }
        assert!(good_picks > 110, "good proxy picked only {good_picks}/200");
    }

    #[test]
    fn active_count_tracks_health() {
        let pool = pool_with(
            RotationStrategy::Weighted,
            &["http://1.1.1.1:8080", "http://2.2.2.2:8080"],
        );
        assert_eq!(pool.active_count(), 2);
        let id = pool.snapshot()[0].id.clone();
        for _ in 0..8 {
            pool.report(&id, ProxyOutcome::SoftFailure);
        }
        assert_eq!(pool.active_count(), 1);
    }
}
