//! Core type definitions

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ErrorDetail;

/// Default number of recent blocks kept by the block feed
pub const DEFAULT_BLOCK_CAPACITY: usize = 5;

/// External data domains feeding the market snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceId {
    PriceVolume,
    Liquidity,
    AllTimeHigh,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::PriceVolume, SourceId::Liquidity, SourceId::AllTimeHigh];

    pub fn name(&self) -> &'static str {
        match self {
            SourceId::PriceVolume => "price-volume",
            SourceId::Liquidity => "liquidity",
            SourceId::AllTimeHigh => "all-time-high",
        }
    }

    /// Snapshot fields this source is authoritative for
    pub fn owned_fields(&self) -> &'static [MarketField] {
        match self {
            SourceId::PriceVolume => &[
                MarketField::AsOf,
                MarketField::Volume24h,
                MarketField::Trades24h,
                MarketField::High24h,
                MarketField::Low24h,
            ],
            SourceId::Liquidity => &[MarketField::MonthlyBuyVolume, MarketField::MonthlySellVolume],
            SourceId::AllTimeHigh => &[MarketField::AthPriceUsd],
        }
    }

    pub fn owns(&self, field: MarketField) -> bool {
        self.owned_fields().contains(&field)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Individual snapshot fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketField {
    AsOf,
    Volume24h,
    Trades24h,
    High24h,
    Low24h,
    AthPriceUsd,
    MonthlyBuyVolume,
    MonthlySellVolume,
}

/// Partial market data as reported by one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketFields {
    pub as_of: Option<DateTime<Utc>>,
    pub volume_24h: Option<f64>,
    pub trades_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub ath_price_usd: Option<f64>,
    pub monthly_buy_volume: Option<f64>,
    pub monthly_sell_volume: Option<f64>,
}

impl MarketFields {
    pub fn is_empty(&self) -> bool {
        *self == MarketFields::default()
    }
}

/// Merged, partial-failure-tolerant result of one aggregation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub as_of: Option<DateTime<Utc>>,
    pub volume_24h: Option<f64>,
    pub trades_24h: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub ath_price_usd: Option<f64>,
    pub monthly_buy_volume: Option<f64>,
    pub monthly_sell_volume: Option<f64>,
    pub errors: BTreeMap<SourceId, ErrorDetail>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Copy the fields `source` owns out of its reported data
    pub fn merge_from(&mut self, source: SourceId, fields: &MarketFields) {
        for field in source.owned_fields() {
            match field {
                MarketField::AsOf => self.as_of = fields.as_of,
                MarketField::Volume24h => self.volume_24h = fields.volume_24h,
                MarketField::Trades24h => self.trades_24h = fields.trades_24h,
                MarketField::High24h => self.high_24h = fields.high_24h,
                MarketField::Low24h => self.low_24h = fields.low_24h,
                MarketField::AthPriceUsd => self.ath_price_usd = fields.ath_price_usd,
                MarketField::MonthlyBuyVolume => self.monthly_buy_volume = fields.monthly_buy_volume,
                MarketField::MonthlySellVolume => self.monthly_sell_volume = fields.monthly_sell_volume,
            }
        }
    }

    pub fn record_failure(&mut self, source: SourceId, detail: ErrorDetail) {
        self.errors.insert(source, detail);
    }

    pub fn has_data(&self) -> bool {
        self.as_of.is_some()
            || self.volume_24h.is_some()
            || self.trades_24h.is_some()
            || self.high_24h.is_some()
            || self.low_24h.is_some()
            || self.ath_price_usd.is_some()
            || self.monthly_buy_volume.is_some()
            || self.monthly_sell_volume.is_some()
    }

    pub fn failed_sources(&self) -> Vec<SourceId> {
        self.errors.keys().copied().collect()
    }

    /// Every scalar null and at least one failure recorded
    pub fn is_total_failure(&self) -> bool {
        !self.errors.is_empty() && !self.has_data()
    }
}

/// Minimal identifying data for one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    /// Chain timestamp, when the node reports one
    pub timestamp: Option<DateTime<Utc>>,
    /// Local receipt time
    pub observed_at: DateTime<Utc>,
}

impl BlockHeader {
    pub fn hash_hex(&self) -> String {
        format!("{:#x}", self.hash)
    }
}

/// Lifecycle phase of a streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Error => "Error",
        }
    }

    /// No automatic transition leaves these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// Forward path is Idle -> Connecting -> Connected -> {Disconnected, Error}.
    /// Teardown may move any live state to Disconnected.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (*self, next) {
            (Idle, Connecting) => true,
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connected, Error) => true,
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_ownership_is_disjoint() {
        for (i, a) in SourceId::ALL.iter().enumerate() {
            for b in SourceId::ALL.iter().skip(i + 1) {
                for field in a.owned_fields() {
                    assert!(!b.owns(*field), "{field:?} owned by both {a} and {b}");
                }
            }
        }
    }

    #[test]
    fn test_merge_copies_only_owned_fields() {
        let fields = MarketFields {
            volume_24h: Some(100.0),
            ath_price_usd: Some(9.5),
            ..Default::default()
        };

        let mut snapshot = MarketSnapshot::empty();
        snapshot.merge_from(SourceId::PriceVolume, &fields);

        assert_eq!(snapshot.volume_24h, Some(100.0));
        assert_eq!(snapshot.ath_price_usd, None);
    }

    #[test]
    fn test_total_failure() {
        let mut snapshot = MarketSnapshot::empty();
        assert!(!snapshot.is_total_failure());

        snapshot.record_failure(
            SourceId::Liquidity,
            ErrorDetail::network("liquidity", "connection refused"),
        );
        assert!(snapshot.is_total_failure());
        assert_eq!(snapshot.failed_sources(), vec![SourceId::Liquidity]);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = MarketSnapshot {
            volume_24h: Some(1.0),
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["volume24h"], 1.0);
        assert!(json["athPriceUsd"].is_null());
        assert!(json["errors"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_connection_state_transitions() {
        use ConnectionState::*;

        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Error));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Error));
    }
}
