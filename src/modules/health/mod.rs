//! Background proxy health checking.
//!
//! A periodic tokio task probes every registered proxy against a lightweight
//! target and feeds the results back into the pool as ordinary outcome
//! reports. The task has an owner: shutdown is explicit and joins it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use url::Url;

use super::proxy::{ProxyOutcome, ProxyPool};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of probing a single proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency: Option<Duration>,
}

/// Issues a lightweight request through one proxy endpoint.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, endpoint: &Url) -> ProbeResult;
}

/// Probe implementation backed by reqwest, one cached client per proxy.
pub struct ReqwestProbe {
    target: Url,
    timeout: Duration,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl ReqwestProbe {
    pub fn new(target: Url) -> Self {
        Self {
            target,
            timeout: DEFAULT_PROBE_TIMEOUT,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn client(&self, endpoint: &Url) -> Result<reqwest::Client, reqwest::Error> {
        let key = endpoint.as_str().to_string();
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(endpoint.as_str())?)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ProxyProbe for ReqwestProbe {
    async fn probe(&self, endpoint: &Url) -> ProbeResult {
        let client = match self.client(endpoint).await {
            Ok(client) => client,
            Err(_) => {
                return ProbeResult {
                    ok: false,
                    latency: None,
                };
            }
        };

        let started = Instant::now();
        match client.get(self.target.clone()).send().await {
            // Anything below 500 means the proxy carried the request.
            Ok(response) => ProbeResult {
                ok: response.status().as_u16() < 500,
                latency: Some(started.elapsed()),
            },
            Err(_) => ProbeResult {
                ok: false,
                latency: None,
            },
        }
    }
}

/// Owns the periodic probe task.
pub struct HealthChecker {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthChecker {
    /// Spawn the background loop. The first sweep runs after one full
    /// interval, not immediately.
    pub fn spawn(pool: ProxyPool, probe: Arc<dyn ProxyProbe>, interval: Duration) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweep(&pool, probe.as_ref()).await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the loop and join the task.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        // Best effort if the owner never awaited shutdown().
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Probe every registered proxy and report per entry. Probes run outside any
/// pool lock; only the per-entry update touches shared state.
async fn run_sweep(pool: &ProxyPool, probe: &dyn ProxyProbe) {
    let endpoints = pool.endpoints();
    let total = endpoints.len();
    let mut alive = 0usize;

    for (id, endpoint) in endpoints {
        let result = probe.probe(&endpoint).await;
        pool.mark_checked(&id);
        if result.ok {
            alive += 1;
            pool.report(
                &id,
                ProxyOutcome::Success {
                    latency: result.latency.unwrap_or_default(),
                },
            );
        } else {
            pool.report(&id, ProxyOutcome::SoftFailure);
        }
    }

    if total > 0 {
        log::debug!("health sweep: {alive}/{total} proxies alive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::PoolConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        ok: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyProbe for ScriptedProbe {
        async fn probe(&self, _endpoint: &Url) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeResult {
                ok: self.ok,
                latency: self.ok.then(|| Duration::from_millis(42)),
            }
        }
    }

    #[tokio::test]
    async fn sweep_reports_success_for_alive_proxies() {
        let pool = ProxyPool::default();
        pool.register("http://1.1.1.1:8080").unwrap();
        let probe = ScriptedProbe {
            ok: true,
            calls: AtomicUsize::new(0),
        };

        run_sweep(&pool, &probe).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        let view = &pool.snapshot()[0];
        assert!(view.checked_ago.is_some());
        assert!(view.mean_latency_ms.is_some());
    }

    #[tokio::test]
    async fn sweep_degrades_dead_proxies() {
        let pool = ProxyPool::new(PoolConfig {
            low_score_grace: Duration::from_secs(600),
            ..Default::default()
        });
        pool.register("http://1.1.1.1:8080").unwrap();
        let probe = ScriptedProbe {
            ok: false,
            calls: AtomicUsize::new(0),
        };

        run_sweep(&pool, &probe).await;
        let view = &pool.snapshot()[0];
        assert!(view.score < 1.0);
        assert_eq!(view.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn checker_runs_on_interval_and_joins() {
        let pool = ProxyPool::default();
        pool.register("http://1.1.1.1:8080").unwrap();
        let probe = Arc::new(ScriptedProbe {
            ok: true,
            calls: AtomicUsize::new(0),
        });

        let checker = HealthChecker::spawn(pool, probe.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(90)).await;
        checker.shutdown().await;

        let calls = probe.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "expected repeated sweeps, got {calls}");
    }

    #[tokio::test]
    async fn shutdown_stops_future_sweeps() {
        let pool = ProxyPool::default();
        pool.register("http://1.1.1.1:8080").unwrap();
        let probe = Arc::new(ScriptedProbe {
            ok: true,
            calls: AtomicUsize::new(0),
        });

        let checker = HealthChecker::spawn(pool, probe.clone(), Duration::from_millis(20));
        checker.shutdown().await;
        let after_shutdown = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), after_shutdown);
    }
}
