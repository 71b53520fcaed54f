//! Concurrency gate bounding in-flight requests.
//!
//! A resizable semaphore: capacity follows the effective concurrency derived
//! from the active speed mode and proxy count. Shrinking never invalidates
//! permits already handed out; it only throttles future acquisitions.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug)]
struct GateState {
    capacity: usize,
    in_flight: usize,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
    notify: Notify,
}

/// Bounds the number of concurrently dispatched requests.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState {
                    capacity: capacity.max(1),
                    in_flight: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Wait until a slot is free. Waiters are woken in arrival order.
    ///
    /// Cancellation-safe: dropping the future while parked hands any pending
    /// wakeup to the next waiter and leaks no slot.
    pub async fn acquire(&self) -> GatePermit {
        loop {
            // Register interest before checking so a release between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        let mut state = self.inner.state.lock().expect("gate lock poisoned");
        if state.in_flight < state.capacity {
            state.in_flight += 1;
            Some(GatePermit {
                inner: self.inner.clone(),
            })
        } else {
            None
        }
    }

    /// Change capacity. Growing wakes parked waiters; shrinking below the
    /// current in-flight count lets existing permits drain naturally.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let grew = {
            let mut state = self.inner.state.lock().expect("gate lock poisoned");
            let grew = capacity > state.capacity;
            state.capacity = capacity;
            grew
        };
        if grew {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().expect("gate lock poisoned").capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().expect("gate lock poisoned").in_flight
    }

    pub fn available(&self) -> usize {
        let state = self.inner.state.lock().expect("gate lock poisoned");
        state.capacity.saturating_sub(state.in_flight)
    }
}

/// RAII slot handle; releasing happens on drop, on every exit path.
#[derive(Debug)]
pub struct GatePermit {
    inner: Arc<GateInner>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("gate lock poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        let has_room = state.in_flight < state.capacity;
        drop(state);
        if has_room {
            self.inner.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn caps_in_flight_permits() {
        let gate = ConcurrencyGate::new(2);
        let _a = gate.acquire().await;
        let _b = gate.acquire().await;
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);
    }

    #[tokio::test]
    async fn drop_releases_slot() {
        let gate = ConcurrencyGate::new(1);
        let permit = gate.acquire().await;
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _p = gate.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn shrink_keeps_issued_permits_valid() {
        let gate = ConcurrencyGate::new(3);
        let a = gate.acquire().await;
        let _b = gate.acquire().await;
        let _c = gate.acquire().await;

        gate.resize(1);
        assert_eq!(gate.in_flight(), 3);
        assert!(gate.try_acquire().is_none());

        // Draining two still leaves us at the new cap.
        drop(a);
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn grow_wakes_parked_waiter() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _p = gate.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.resize(2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after grow")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_waiter_leaks_nothing() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _p = gate.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.in_flight(), 1);
    }
}
