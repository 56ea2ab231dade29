//! Connector implementations for the three market data domains

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use ecoho_core::{
    AthSourceConfig, ErrorDetail, GraphQlSourceConfig, MarketConfig, MarketFields, SourceId,
    SourceResult,
};

use crate::connector::SourceConnector;
use crate::http::{HttpSource, RestRequest};

/// Where both GraphQL sources keep their rows inside `data`
const TRADES_POINTER: &str = "/Solana/DEXTradeByTokens";

const DAILY_TRADES_QUERY: &str = r#"
query DailyMarketData {
  Solana(dataset: combined) {
    DEXTradeByTokens(
      orderBy: { descendingByField: "Block_Timefield" }
      where: {
        Trade: {
          Currency: { MintAddress: { is: "%TOKEN_MINT%" } }
          Side: { Currency: { MintAddress: { is: "%QUOTE_MINT%" } } }
          PriceAsymmetry: { lt: 0.1 }
        }
      }
      limit: { count: 1 }
    ) {
      Block { Timefield: Time(interval: { in: days, count: 1 }) }
      volume: sum(of: Trade_Amount)
      Trade {
        high: Price(maximum: Trade_Price)
        low: Price(minimum: Trade_Price)
      }
      count
    }
  }
}
"#;

const MONTHLY_ACTIVITY_QUERY: &str = r#"
query MonthlyMarketActivity {
  Solana(dataset: combined) {
    DEXTradeByTokens(
      where: {
        Trade: {
          Currency: { MintAddress: { is: "%TOKEN_MINT%" } }
          Side: { Currency: { MintAddress: { is: "%QUOTE_MINT%" } } }
          Market: { MarketAddress: { is: "%MARKET_ADDRESS%" } }
        }
      }
      orderBy: { descendingByField: "Block_Timefield" }
      limit: { count: 1 }
    ) {
      tokenLiquidity: sum(of: Trade_Amount, if: { Trade: { Side: { Type: { is: buy } } } })
      wsolLiquidity: sum(of: Trade_Side_Amount, if: { Trade: { Side: { Type: { is: sell } } } })
      Block { Timefield: Time(interval: { in: months, count: 1 }) }
    }
  }
}
"#;

/// Providers send aggregates either as JSON numbers or numeric strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    /// Finite values only; "NaN" and "inf" strings count as missing
    fn value(&self) -> Option<f64> {
        match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(s) => s.trim().parse().ok(),
        }
        .filter(|v: &f64| v.is_finite())
    }
}

fn numeric(value: &Option<Numeric>) -> Option<f64> {
    value.as_ref().and_then(Numeric::value)
}

/// Time bucket, aliased to a plain string or left as `{Time}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimeBucket {
    Plain(String),
    Nested {
        #[serde(rename = "Time")]
        time: String,
    },
}

impl TimeBucket {
    fn parse(&self) -> Option<DateTime<Utc>> {
        let raw = match self {
            TimeBucket::Plain(s) => s,
            TimeBucket::Nested { time } => time,
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!("Unparseable time bucket {:?}: {}", raw, e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockBucket {
    #[serde(rename = "Timefield")]
    timefield: Option<TimeBucket>,
}

#[derive(Debug, Deserialize)]
struct TradePrices {
    high: Option<Numeric>,
    low: Option<Numeric>,
}

#[derive(Debug, Deserialize)]
struct DailyTradeRow {
    #[serde(rename = "Block")]
    block: Option<BlockBucket>,
    volume: Option<Numeric>,
    #[serde(rename = "Trade")]
    trade: Option<TradePrices>,
    count: Option<Numeric>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonthlyActivityRow {
    token_liquidity: Option<Numeric>,
    wsol_liquidity: Option<Numeric>,
}

/// First row at `TRADES_POINTER`; a missing or empty list is "no data yet"
fn first_row<T: DeserializeOwned>(source: SourceId, data: &Value) -> SourceResult<Option<T>> {
    let rows = match data.pointer(TRADES_POINTER) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(rows)) => rows,
        Some(other) => {
            return Err(ErrorDetail::protocol(
                source.name(),
                format!("expected a list at {TRADES_POINTER}, got {other}"),
            ))
        }
    };

    match rows.first() {
        None => Ok(None),
        Some(row) => serde_json::from_value(row.clone())
            .map(Some)
            .map_err(|e| ErrorDetail::protocol(source.name(), format!("unexpected row shape: {e}"))),
    }
}

pub fn parse_daily_trades(data: &Value) -> SourceResult<MarketFields> {
    let Some(row) = first_row::<DailyTradeRow>(SourceId::PriceVolume, data)? else {
        return Ok(MarketFields::default());
    };

    Ok(MarketFields {
        as_of: row
            .block
            .as_ref()
            .and_then(|b| b.timefield.as_ref())
            .and_then(TimeBucket::parse),
        volume_24h: numeric(&row.volume),
        trades_24h: numeric(&row.count),
        high_24h: row.trade.as_ref().and_then(|t| numeric(&t.high)),
        low_24h: row.trade.as_ref().and_then(|t| numeric(&t.low)),
        ..Default::default()
    })
}

pub fn parse_monthly_activity(data: &Value) -> SourceResult<MarketFields> {
    let Some(row) = first_row::<MonthlyActivityRow>(SourceId::Liquidity, data)? else {
        return Ok(MarketFields::default());
    };

    Ok(MarketFields {
        monthly_buy_volume: numeric(&row.token_liquidity),
        monthly_sell_volume: numeric(&row.wsol_liquidity),
        ..Default::default()
    })
}

pub fn parse_all_time_high(body: &Value, pointer: &str) -> SourceResult<MarketFields> {
    let value = body.pointer(pointer).ok_or_else(|| {
        ErrorDetail::protocol(SourceId::AllTimeHigh.name(), format!("no value at {pointer}"))
    })?;

    let price = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
    .ok_or_else(|| {
        ErrorDetail::protocol(
            SourceId::AllTimeHigh.name(),
            format!("non-numeric value at {pointer}: {value}"),
        )
    })?;

    Ok(MarketFields {
        ath_price_usd: Some(price),
        ..Default::default()
    })
}

/// Addresses are spliced into query text, so only plain base58/hex survive
fn check_address(source: SourceId, name: &str, value: &str) -> Result<(), ErrorDetail> {
    if value.is_empty() {
        return Err(ErrorDetail::configuration(source.name(), format!("market.{name} is not configured")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ErrorDetail::configuration(source.name(), format!("market.{name} is not a valid address")));
    }
    Ok(())
}

fn render_query(source: SourceId, template: &str, market: &MarketConfig, with_market: bool) -> Result<String, ErrorDetail> {
    check_address(source, "token_mint", &market.token_mint)?;
    check_address(source, "quote_mint", &market.quote_mint)?;
    if with_market {
        check_address(source, "market_address", &market.market_address)?;
    }

    Ok(template
        .replace("%TOKEN_MINT%", &market.token_mint)
        .replace("%QUOTE_MINT%", &market.quote_mint)
        .replace("%MARKET_ADDRESS%", &market.market_address))
}

/// Daily price and volume
pub struct PriceVolumeSource {
    http: HttpSource,
    query: Result<String, ErrorDetail>,
}

impl PriceVolumeSource {
    pub fn new(config: &GraphQlSourceConfig, market: &MarketConfig) -> Self {
        Self {
            http: HttpSource::new(SourceId::PriceVolume, &config.endpoint),
            query: render_query(SourceId::PriceVolume, DAILY_TRADES_QUERY, market, false),
        }
    }
}

#[async_trait::async_trait]
impl SourceConnector for PriceVolumeSource {
    fn id(&self) -> SourceId {
        SourceId::PriceVolume
    }

    async fn fetch(&self) -> SourceResult<MarketFields> {
        let query = self.query.as_ref().map_err(|e| e.clone())?;
        let data = self.http.post_graphql(query).await?;
        let fields = parse_daily_trades(&data)?;
        debug!(source = %self.id(), empty = fields.is_empty(), "Parsed daily trades");
        Ok(fields)
    }
}

/// Monthly buy/sell activity on the configured market
pub struct LiquiditySource {
    http: HttpSource,
    query: Result<String, ErrorDetail>,
}

impl LiquiditySource {
    pub fn new(config: &GraphQlSourceConfig, market: &MarketConfig) -> Self {
        Self {
            http: HttpSource::new(SourceId::Liquidity, &config.endpoint),
            query: render_query(SourceId::Liquidity, MONTHLY_ACTIVITY_QUERY, market, true),
        }
    }
}

#[async_trait::async_trait]
impl SourceConnector for LiquiditySource {
    fn id(&self) -> SourceId {
        SourceId::Liquidity
    }

    async fn fetch(&self) -> SourceResult<MarketFields> {
        let query = self.query.as_ref().map_err(|e| e.clone())?;
        let data = self.http.post_graphql(query).await?;
        let fields = parse_monthly_activity(&data)?;
        debug!(source = %self.id(), empty = fields.is_empty(), "Parsed monthly activity");
        Ok(fields)
    }
}

/// All-time-high USD price from a REST endpoint
pub struct AllTimeHighSource {
    http: HttpSource,
    request: Result<RestRequest, ErrorDetail>,
    value_pointer: String,
}

impl AllTimeHighSource {
    pub fn new(config: &AthSourceConfig) -> Self {
        let source = SourceId::AllTimeHigh;

        let request = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ErrorDetail::configuration(source.name(), format!("invalid HTTP method {:?}", config.method)))
            .and_then(|method| {
                if config.value_pointer.is_empty() || config.value_pointer.starts_with('/') {
                    Ok(RestRequest {
                        method,
                        body: config.body.clone(),
                    })
                } else {
                    Err(ErrorDetail::configuration(
                        source.name(),
                        format!("value_pointer {:?} must start with '/'", config.value_pointer),
                    ))
                }
            });

        Self {
            http: HttpSource::new(source, &config.endpoint),
            request,
            value_pointer: config.value_pointer.clone(),
        }
    }
}

#[async_trait::async_trait]
impl SourceConnector for AllTimeHighSource {
    fn id(&self) -> SourceId {
        SourceId::AllTimeHigh
    }

    async fn fetch(&self) -> SourceResult<MarketFields> {
        let request = self.request.as_ref().map_err(|e| e.clone())?;
        let body = self.http.send_json(request).await?;
        parse_all_time_high(&body, &self.value_pointer)
    }
}
