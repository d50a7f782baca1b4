/// Cached reachability of remote endpoints
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Something that can answer "are you there?" quickly
#[async_trait]
pub trait Probe: Send + Sync {
    /// Stable key for the endpoint, used to index cached state
    fn target(&self) -> &str;
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub reachable: bool,
    pub checked_at: Instant,
}

/// Remembers the last probe verdict per endpoint for `ttl`
pub struct ConnectivityCache {
    ttl: Duration,
    states: HashMap<String, ConnectivityState>,
}

impl ConnectivityCache {
    pub fn new(ttl: Duration) -> Self {
        ConnectivityCache {
            ttl,
            states: HashMap::new(),
        }
    }

    /// Probe now, regardless of cached state
    pub async fn probe<P: Probe + ?Sized>(&mut self, target: &P) -> bool {
        let reachable = target.probe().await;
        let previous = self
            .states
            .insert(
                target.target().to_string(),
                ConnectivityState {
                    reachable,
                    checked_at: Instant::now(),
                },
            )
            .map(|state| state.reachable);

        match (previous, reachable) {
            (Some(false), true) | (None, true) => info!("{} is reachable", target.target()),
            (Some(true), false) | (None, false) => warn!("Cannot reach {}", target.target()),
            _ => debug!("{} reachable={} (unchanged)", target.target(), reachable),
        }
        reachable
    }

    /// Cached verdict while it is younger than the TTL, otherwise a fresh probe
    pub async fn is_reachable<P: Probe + ?Sized>(&mut self, target: &P) -> bool {
        if let Some(state) = self.states.get(target.target()) {
            if state.checked_at.elapsed() < self.ttl {
                return state.reachable;
            }
        }
        self.probe(target).await
    }

    pub fn state(&self, target: &str) -> Option<ConnectivityState> {
        self.states.get(target).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCollector;

    #[tokio::test(start_paused = true)]
    async fn reuses_verdict_within_ttl() {
        let collector = FakeCollector::new();
        let mut cache = ConnectivityCache::new(Duration::from_secs(300));

        assert!(cache.is_reachable(&collector).await);
        collector.set_reachable(false);
        tokio::time::advance(Duration::from_secs(299)).await;

        assert!(cache.is_reachable(&collector).await);
        assert_eq!(collector.probes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reprobes_once_after_expiry() {
        let collector = FakeCollector::new();
        let mut cache = ConnectivityCache::new(Duration::from_secs(300));

        assert!(cache.is_reachable(&collector).await);
        collector.set_reachable(false);
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(!cache.is_reachable(&collector).await);
        assert!(!cache.is_reachable(&collector).await);
        assert_eq!(collector.probes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_probe_refreshes_state() {
        let collector = FakeCollector::new();
        let mut cache = ConnectivityCache::new(Duration::from_secs(300));

        assert!(cache.state(collector.target()).is_none());
        collector.set_reachable(false);
        assert!(!cache.probe(&collector).await);

        let state = cache.state(collector.target()).unwrap();
        assert!(!state.reachable);
        assert_eq!(state.checked_at, Instant::now());

        collector.set_reachable(true);
        assert!(cache.probe(&collector).await);
        assert!(cache.is_reachable(&collector).await);
        assert_eq!(collector.probes(), 2);
    }
}
