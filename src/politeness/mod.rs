//! Per-host politeness gate
//!
//! Every fetch waits for its host's slot. The next slot is reserved while the
//! lock is held and the caller sleeps afterwards, so concurrent requests to
//! the same host are spaced by at least `delay` while different hosts never
//! wait on each other.
//!
//! A host whose last slot is more than `delay` in the past no longer
//! constrains anything, so once the table grows past a threshold such hosts
//! are dropped on the next request.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracked hosts above which expired entries are dropped
pub const DEFAULT_PRUNE_THRESHOLD: usize = 1024;

/// Minimum-interval throttle keyed by host
pub struct PolitenessGate {
    delay: Duration,
    prune_threshold: usize,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl PolitenessGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired hosts once more than `hosts` are tracked
    pub fn with_prune_threshold(mut self, hosts: usize) -> Self {
        self.prune_threshold = hosts;
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Host key for a URL; unparseable URLs are throttled as their own key
    pub fn host_key(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_else(|| url.to_string())
    }

    /// Wait until a request to `url`'s host is allowed. Returns the time waited.
    pub async fn wait_for_host(&self, url: &str) -> Duration {
        let host = Self::host_key(url);

        let wait = {
            let mut last_request = self.last_request.lock().await;
            let now = Instant::now();
            let slot = match last_request.get(&host) {
                Some(&last) if now < last + self.delay => last + self.delay,
                _ => now,
            };
            last_request.insert(host.clone(), slot);
            if last_request.len() > self.prune_threshold {
                let dropped = prune_expired(&mut last_request, now, self.delay);
                tracing::debug!(dropped, tracked = last_request.len(), "Pruned idle politeness hosts");
            }
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tracing::trace!(host = %host, wait_ms = wait.as_millis() as u64, "Politeness wait");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    pub async fn tracked_hosts(&self) -> usize {
        self.last_request.lock().await.len()
    }
}

/// Remove hosts whose next request would not wait. Returns how many went.
fn prune_expired(last_request: &mut HashMap<String, Instant>, now: Instant, delay: Duration) -> usize {
    let before = last_request.len();
    last_request.retain(|_, last| now < *last + delay);
    before - last_request.len()
}
