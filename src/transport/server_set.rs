use crate::config::ServerConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub ws_uri: String,
    pub weight: u16,
    pub status: ServerStatus,
}

/// The prioritized pool of candidate WebSocket servers plus the
/// recovery backoff state.
///
/// Selection: among servers whose status is not `Error`, take the
/// highest-weight bucket and pick uniformly at random within it.
///
/// Backoff: each exhausted round waits `k * min_interval` seconds
/// with `k` uniform in `[1, 2^attempts]`, capped at `max_interval`;
/// reaching the cap resets `attempts`, as does a successful connect.
pub struct ServerSet {
    entries: Vec<ServerEntry>,
    attempts: u32,
    min_interval: Duration,
    max_interval: Duration,
}

impl ServerSet {
    pub fn new(servers: &[ServerConfig], min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            entries: servers
                .iter()
                .map(|s| ServerEntry {
                    ws_uri: s.ws_uri.clone(),
                    weight: s.weight,
                    status: ServerStatus::Ready,
                })
                .collect(),
            attempts: 0,
            min_interval,
            max_interval,
        }
    }

    pub fn pick(&self) -> Option<String> {
        let best = self
            .entries
            .iter()
            .filter(|e| e.status != ServerStatus::Error)
            .map(|e| e.weight)
            .max()?;
        let bucket: Vec<&ServerEntry> = self
            .entries
            .iter()
            .filter(|e| e.status != ServerStatus::Error && e.weight == best)
            .collect();
        let index = rand::rng().random_range(0..bucket.len());
        Some(bucket[index].ws_uri.clone())
    }

    pub fn mark_error(&mut self, ws_uri: &str) {
        for entry in self.entries.iter_mut() {
            if entry.ws_uri == ws_uri {
                entry.status = ServerStatus::Error;
            }
        }
    }

    pub fn exhausted(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status == ServerStatus::Error)
    }

    /// Bring every server back into rotation for a fresh round.
    pub fn reset_pool(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.status = ServerStatus::Ready;
        }
    }

    pub fn on_connect(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next round once every server has failed:
    /// `k * min_interval` with `k` uniform in `[1, 2^attempts]`, so
    /// the first exhausted round already draws from `[1, 2]`.
    pub fn next_retry(&mut self) -> Duration {
        self.attempts += 1;
        let ceiling = 2u64.saturating_pow(self.attempts.min(16));
        let k = rand::rng().random_range(1..=ceiling);
        let wait = self.min_interval.saturating_mul(k as u32);
        if wait >= self.max_interval {
            self.attempts = 0;
            self.max_interval
        } else {
            wait
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(weights: &[(&str, u16)]) -> ServerSet {
        let servers: Vec<ServerConfig> = weights
            .iter()
            .map(|(uri, w)| ServerConfig::with_weight(uri, *w))
            .collect();
        ServerSet::new(&servers, Duration::from_secs(2), Duration::from_secs(30))
    }

    #[test]
    fn test_pick_highest_weight() {
        let set = pool(&[("wss://a", 2), ("wss://b", 1)]);
        for _ in 0..16 {
            assert_eq!(set.pick().as_deref(), Some("wss://a"));
        }
    }

    #[test]
    fn test_pick_skips_failed() {
        let mut set = pool(&[("wss://a", 2), ("wss://b", 1)]);
        set.mark_error("wss://a");
        assert_eq!(set.pick().as_deref(), Some("wss://b"));
        set.mark_error("wss://b");
        assert!(set.exhausted());
        assert_eq!(set.pick(), None);
        set.reset_pool();
        assert_eq!(set.pick().as_deref(), Some("wss://a"));
    }

    #[test]
    fn test_pick_uniform_within_bucket() {
        let set = pool(&[("wss://a", 1), ("wss://b", 1)]);
        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..256 {
            match set.pick().as_deref() {
                Some("wss://a") => seen_a = true,
                Some("wss://b") => seen_b = true,
                other => panic!("unexpected pick: {:?}", other),
            }
        }
        assert!(seen_a && seen_b);
    }

    #[test]
    fn test_backoff_bounds() {
        let mut set = pool(&[("wss://a", 0)]);
        // first round draws k from [1, 2]
        let first = set.next_retry();
        assert!(first >= Duration::from_secs(2));
        assert!(first <= Duration::from_secs(4));
        assert_eq!(set.attempts(), 1);

        for _ in 0..64 {
            let wait = set.next_retry();
            assert!(wait >= Duration::from_secs(2));
            assert!(wait <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_connect_resets_attempts() {
        let mut set = pool(&[("wss://a", 0)]);
        set.next_retry();
        set.next_retry();
        set.on_connect();
        assert_eq!(set.attempts(), 0);
    }
}
