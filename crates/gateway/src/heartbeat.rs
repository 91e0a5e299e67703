//! Heartbeat bookkeeping for one socket.
//!
//! The server drives the cadence: every interval it sends a heartbeat with a
//! fresh id and arms a disarm timer at twice the interval. The peer's echo
//! cancels the timer; expiry means the connection is dead.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio_util::sync::CancellationToken;

/// Map of in-flight heartbeat ids to their disarm timers.
#[derive(Default)]
pub struct HeartbeatRegistry {
    timers: Mutex<HashMap<String, CancellationToken>>,
}

impl HeartbeatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a disarm timer for `id`. `on_expire` runs iff no matching beat
    /// arrives within `timeout`.
    pub fn arm<F>(&self, id: &str, timeout: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_owned(), token.clone());
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {},
                () = tokio::time::sleep(timeout) => on_expire(),
            }
        });
    }

    /// Record the peer's echo. True when the id had a live timer.
    pub fn beat(&self, id: &str) -> bool {
        let token = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match token {
            Some(token) => {
                token.cancel();
                true
            },
            None => false,
        }
    }

    /// Cancel every pending timer (teardown).
    pub fn clear(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, token) in timers.drain() {
            token.cancel();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn test_beat_disarms_timer() {
        let registry = HeartbeatRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        registry.arm("hb-1", Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.beat("hb-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expiry_fires_once() {
        let registry = HeartbeatRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        registry.arm("hb-1", Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The expired id no longer counts as a live beat.
        assert!(!registry.beat("hb-1"));
    }

    #[tokio::test]
    async fn test_unknown_beat_ignored() {
        let registry = HeartbeatRegistry::new();
        assert!(!registry.beat("never-armed"));
    }

    #[tokio::test]
    async fn test_clear_cancels_all() {
        let registry = HeartbeatRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let f = Arc::clone(&fired);
            registry.arm(&format!("hb-{i}"), Duration::from_millis(20), move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        registry.clear();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
