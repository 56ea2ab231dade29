//! TTL layer in front of the stateless aggregator

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use ecoho_core::MarketSnapshot;

use crate::aggregator::MarketAggregator;

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: MarketSnapshot,
    taken_at: Instant,
}

impl CachedSnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.taken_at.elapsed() < ttl
    }
}

/// Serves the last snapshot while it is younger than `ttl`.
///
/// Snapshots with failed sources are cached too; a zero TTL disables reuse.
/// Concurrent misses may each run an aggregation, last one wins.
pub struct CachedAggregator {
    aggregator: MarketAggregator,
    ttl: Duration,
    cached: RwLock<Option<CachedSnapshot>>,
}

impl CachedAggregator {
    pub fn new(aggregator: MarketAggregator, ttl: Duration) -> Self {
        Self {
            aggregator,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn aggregator(&self) -> &MarketAggregator {
        &self.aggregator
    }

    pub async fn snapshot(&self) -> MarketSnapshot {
        if let Some(hit) = self.fresh() {
            debug!("Serving cached market snapshot");
            return hit;
        }

        let snapshot = self.aggregator.aggregate().await;

        if !self.ttl.is_zero() {
            *self.cached.write() = Some(CachedSnapshot {
                snapshot: snapshot.clone(),
                taken_at: Instant::now(),
            });
        }

        snapshot
    }

    /// Age of the cached snapshot, if any
    pub fn age(&self) -> Option<Duration> {
        self.cached.read().as_ref().map(|c| c.taken_at.elapsed())
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn fresh(&self) -> Option<MarketSnapshot> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.is_fresh(self.ttl))
            .map(|c| c.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::connector::SourceConnector;
    use ecoho_core::{MarketFields, SourceId, SourceResult};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl SourceConnector for Counting {
        fn id(&self) -> SourceId {
            SourceId::PriceVolume
        }

        async fn fetch(&self) -> SourceResult<MarketFields> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MarketFields {
                volume_24h: Some(n as f64),
                ..Default::default()
            })
        }
    }

    fn counting_cache(ttl: Duration) -> (CachedAggregator, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let aggregator = MarketAggregator::new(AggregatorConfig::default()).with_connector(Counting {
            calls: Arc::clone(&calls),
        });
        (CachedAggregator::new(aggregator, ttl), calls)
    }

    #[test]
    fn test_fresh_snapshot_reused() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        let first = tokio_test::block_on(cache.snapshot());
        let second = tokio_test::block_on(cache.snapshot());

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.age().is_some());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let (cache, calls) = counting_cache(Duration::ZERO);

        let first = tokio_test::block_on(cache.snapshot());
        let second = tokio_test::block_on(cache.snapshot());

        assert_eq!(first.volume_24h, Some(1.0));
        assert_eq!(second.volume_24h, Some(2.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.age().is_none());
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let (cache, calls) = counting_cache(Duration::from_secs(60));

        tokio_test::block_on(cache.snapshot());
        cache.invalidate();
        let refreshed = tokio_test::block_on(cache.snapshot());

        assert_eq!(refreshed.volume_24h, Some(2.0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
