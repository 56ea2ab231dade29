//! Market aggregator - fans out to every connector and merges what succeeded

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ecoho_core::{DataLayerConfig, ErrorDetail, MarketFields, MarketSnapshot, SourceId, SourceResult};

use crate::connector::{SharedConnector, SourceConnector};
use crate::sources::{AllTimeHighSource, LiquiditySource, PriceVolumeSource};

/// Aggregator configuration
#[derive(Debug, Clone, Default)]
pub struct AggregatorConfig {
    /// Overall bound; connectors still pending when it elapses count as timeouts
    pub deadline: Option<Duration>,
}

/// Stateless fan-out/fan-in over registered connectors
pub struct MarketAggregator {
    config: AggregatorConfig,
    connectors: Vec<SharedConnector>,
}

impl MarketAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            connectors: vec![],
        }
    }

    /// Aggregator with the price/volume, liquidity and all-time-high connectors
    pub fn from_config(config: &DataLayerConfig) -> Self {
        let aggregator_config = AggregatorConfig {
            deadline: config.aggregation.deadline(),
        };

        Self::new(aggregator_config)
            .with_connector(PriceVolumeSource::new(&config.sources.price_volume, &config.market))
            .with_connector(LiquiditySource::new(&config.sources.liquidity, &config.market))
            .with_connector(AllTimeHighSource::new(&config.sources.all_time_high))
    }

    pub fn with_connector(mut self, connector: impl SourceConnector + 'static) -> Self {
        self.register(Arc::new(connector));
        self
    }

    /// Register a connector; merge order follows registration order.
    /// A second connector for an already registered source is ignored and
    /// `false` is returned.
    pub fn register(&mut self, connector: SharedConnector) -> bool {
        let id = connector.id();
        if self.connectors.iter().any(|c| c.id() == id) {
            warn!(source = %id, "Connector already registered, ignoring duplicate");
            return false;
        }
        self.connectors.push(connector);
        true
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.connectors.iter().map(|c| c.id()).collect()
    }

    /// Run one aggregation pass. Never fails: total failure is an empty
    /// snapshot with every source listed in `errors`.
    pub async fn aggregate(&self) -> MarketSnapshot {
        aggregate(&self.connectors, self.config.deadline).await
    }
}

/// Fan out to every connector concurrently, wait for all to settle, then merge
pub async fn aggregate(connectors: &[SharedConnector], deadline: Option<Duration>) -> MarketSnapshot {
    let start = Instant::now();
    let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);

    let handles: Vec<(SourceId, JoinHandle<SourceResult<MarketFields>>)> = connectors
        .iter()
        .map(|connector| {
            let connector = Arc::clone(connector);
            let id = connector.id();
            debug!(source = %id, "Dispatching connector");
            (id, tokio::spawn(async move { connector.fetch().await }))
        })
        .collect();

    let settled = join_all(
        handles
            .into_iter()
            .map(|(id, handle)| async move { (id, settle(id, handle, deadline_at).await) }),
    )
    .await;

    let snapshot = merge(settled);

    info!(
        succeeded = connectors.len() - snapshot.errors.len(),
        failed = snapshot.errors.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Market aggregation complete"
    );

    snapshot
}

async fn settle(
    id: SourceId,
    mut handle: JoinHandle<SourceResult<MarketFields>>,
    deadline_at: Option<tokio::time::Instant>,
) -> SourceResult<MarketFields> {
    let joined = match deadline_at {
        Some(at) => match tokio::time::timeout_at(at, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(ErrorDetail::timeout(
                    id.name(),
                    "still pending at aggregation deadline",
                ));
            }
        },
        None => handle.await,
    };

    joined.unwrap_or_else(|e| {
        Err(ErrorDetail::protocol(
            id.name(),
            format!("connector task failed: {e}"),
        ))
    })
}

/// Pure merge of settled results, applied in the given order
pub fn merge(settled: impl IntoIterator<Item = (SourceId, SourceResult<MarketFields>)>) -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::empty();

    for (id, result) in settled {
        match result {
            Ok(fields) => snapshot.merge_from(id, &fields),
            Err(detail) => {
                warn!(source = %id, kind = %detail.kind, "Source failed: {}", detail.message);
                snapshot.record_failure(id, detail);
            }
        }
    }

    snapshot
}
