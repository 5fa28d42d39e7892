//! Idle lifecycle watchdog
//!
//! The broker runs as a sidecar: it should leave when nobody needs it and
//! must never leave mid-request. A busy counter plus a last-activity stamp
//! decide, checked by a poll loop every few seconds. Clients can retime
//! the idle window or order an immediate shutdown through keep-alive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shared activity bookkeeping the watchdog polls.
pub struct ActivityMonitor {
    state: Mutex<ActivityState>,
    shutdown_tx: watch::Sender<bool>,
}

struct ActivityState {
    last_activity: Instant,
    busy: usize,
    idle_timeout: Duration,
}

impl ActivityMonitor {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(ActivityState {
                last_activity: Instant::now(),
                busy: 0,
                idle_timeout,
            }),
            shutdown_tx,
        })
    }

    /// Mark a request in flight. Shutdown never fires while any guard is
    /// alive; dropping the guard counts as activity too, so the full idle
    /// window starts after the request finishes.
    pub fn begin_request(&self) -> BusyGuard<'_> {
        let mut state = self.state.lock();
        state.busy += 1;
        state.last_activity = Instant::now();
        BusyGuard { monitor: self }
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy > 0
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.state.lock().idle_timeout
    }

    /// Keep-alive signal. `stay == true` refreshes activity and, for a
    /// non-zero `timeout_seconds`, replaces the idle timeout. `stay ==
    /// false` orders shutdown right away.
    pub fn keep_alive(&self, stay: bool, timeout_seconds: u64) {
        if !stay {
            info!("client requested shutdown");
            self.request_shutdown();
            return;
        }
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        if timeout_seconds > 0 {
            state.idle_timeout = Duration::from_secs(timeout_seconds);
            debug!(timeout_seconds, "idle timeout retimed by keep-alive");
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Receiver that resolves to `true` once shutdown has been ordered.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// RAII marker for an in-flight request.
pub struct BusyGuard<'a> {
    monitor: &'a ActivityMonitor,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.monitor.state.lock();
        state.busy = state.busy.saturating_sub(1);
        state.last_activity = Instant::now();
    }
}

/// Poll loop. Returns once shutdown has been ordered, whether by idleness
/// here or externally (keep-alive with `stay == false`).
pub async fn run_watchdog(monitor: Arc<ActivityMonitor>, poll_interval: Duration) {
    let mut shutdown = monitor.shutdown_signal();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if monitor.is_busy() {
                    continue;
                }
                let idle = monitor.idle_for();
                if idle > monitor.idle_timeout() {
                    info!(idle_secs = idle.as_secs(), "idle timeout reached, shutting down");
                    monitor.request_shutdown();
                    return;
                }
            }
            _ = shutdown.wait_for(|fired| *fired) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_counter_tracks_nested_guards() {
        let monitor = ActivityMonitor::new(Duration::from_secs(30));
        assert!(!monitor.is_busy());
        let outer = monitor.begin_request();
        let inner = monitor.begin_request();
        assert!(monitor.is_busy());
        drop(inner);
        assert!(monitor.is_busy());
        drop(outer);
        assert!(!monitor.is_busy());
    }

    #[test]
    fn keep_alive_false_orders_immediate_shutdown() {
        let monitor = ActivityMonitor::new(Duration::from_secs(300));
        assert!(!*monitor.shutdown_signal().borrow());
        monitor.keep_alive(false, 0);
        assert!(*monitor.shutdown_signal().borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_within_one_poll_of_the_timeout() {
        let monitor = ActivityMonitor::new(Duration::from_secs(30));
        tokio::spawn(run_watchdog(Arc::clone(&monitor), Duration::from_secs(5)));

        let started = Instant::now();
        let mut shutdown = monitor.shutdown_signal();
        shutdown.wait_for(|fired| *fired).await.unwrap();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_secs(30), "fired early: {waited:?}");
        assert!(waited <= Duration::from_secs(36), "fired late: {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn never_fires_while_a_request_is_in_flight() {
        let monitor = ActivityMonitor::new(Duration::from_secs(10));
        tokio::spawn(run_watchdog(Arc::clone(&monitor), Duration::from_secs(5)));

        let guard = monitor.begin_request();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!*monitor.shutdown_signal().borrow());

        // The idle window starts over once the request finishes.
        drop(guard);
        let started = Instant::now();
        let mut shutdown = monitor.shutdown_signal();
        shutdown.wait_for(|fired| *fired).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10), "fired early: {waited:?}");
        assert!(waited <= Duration::from_secs(16), "fired late: {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_retimes_the_idle_window() {
        let monitor = ActivityMonitor::new(Duration::from_secs(600));
        tokio::spawn(run_watchdog(Arc::clone(&monitor), Duration::from_secs(5)));

        monitor.keep_alive(true, 5);
        let started = Instant::now();
        let mut shutdown = monitor.shutdown_signal();
        shutdown.wait_for(|fired| *fired).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5), "fired early: {waited:?}");
        assert!(waited <= Duration::from_secs(11), "fired late: {waited:?}");
    }
}
