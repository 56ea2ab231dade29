//! Source connector contract

use std::sync::Arc;

use ecoho_core::{MarketFields, SourceId, SourceResult};

/// One external data provider.
///
/// `fetch` issues a single bounded request and reports every failure as a
/// `SourceResult` value; implementations must not panic on bad input.
#[async_trait::async_trait]
pub trait SourceConnector: Send + Sync {
    fn id(&self) -> SourceId;

    async fn fetch(&self) -> SourceResult<MarketFields>;
}

/// Connector handle shareable with spawned tasks
pub type SharedConnector = Arc<dyn SourceConnector>;
