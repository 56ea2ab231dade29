//! JSON-RPC subscription frames

use alloy_primitives::B256;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use ecoho_core::{BlockHeader, ErrorDetail};

/// Component name used in block feed error details
pub const FEED_SOURCE: &str = "block-feed";

/// Outbound subscribe request
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: [&'a str; 1],
}

impl<'a> SubscribeRequest<'a> {
    pub fn new(id: u64, method: &'a str, event: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params: [event],
        }
    }

    pub fn to_json(&self) -> String {
        // Only &str and integers: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Header fields as the node sends them, numbers hex-encoded
#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeaderWire {
    pub number: String,
    pub hash: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: Value,
    result: Value,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
    method: Option<String>,
    params: Option<NotificationParams>,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Subscription accepted, carries the subscription id
    Ack { id: u64, subscription: String },
    /// Subscription rejected by the node
    Rejected { id: u64, code: i64, message: String },
    /// Header notification, still in wire form
    Notification { subscription: String, header: Value },
    /// Anything else: responses to other ids, other methods
    Other,
}

/// Sort a text frame into ack / rejection / notification
pub fn classify(text: &str, request_id: u64, notification_method: &str) -> Result<Frame, ErrorDetail> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| ErrorDetail::protocol(FEED_SOURCE, format!("malformed frame: {e}")))?;

    if raw.id.as_ref().and_then(Value::as_u64) == Some(request_id) {
        if let Some(error) = raw.error {
            return Ok(Frame::Rejected {
                id: request_id,
                code: error.code,
                message: error.message,
            });
        }
        if let Some(result) = raw.result {
            return Ok(Frame::Ack {
                id: request_id,
                subscription: id_string(&result),
            });
        }
    }

    if raw.method.as_deref() == Some(notification_method) {
        if let Some(params) = raw.params {
            return Ok(Frame::Notification {
                subscription: id_string(&params.subscription),
                header: params.result,
            });
        }
        return Err(ErrorDetail::protocol(FEED_SOURCE, "notification without params"));
    }

    Ok(Frame::Other)
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hex quantity ("0x1b4") to integer
pub fn parse_hex_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Decode a wire header, stamping it with the local receipt time
pub fn decode_header(header: Value, observed_at: DateTime<Utc>) -> Result<BlockHeader, ErrorDetail> {
    let wire: BlockHeaderWire = serde_json::from_value(header)
        .map_err(|e| ErrorDetail::protocol(FEED_SOURCE, format!("unexpected header shape: {e}")))?;

    let number = parse_hex_quantity(&wire.number).ok_or_else(|| {
        ErrorDetail::protocol(FEED_SOURCE, format!("invalid block number {:?}", wire.number))
    })?;

    if !wire.hash.starts_with("0x") {
        return Err(ErrorDetail::protocol(FEED_SOURCE, format!("hash {:?} is not 0x-prefixed", wire.hash)));
    }
    let hash = B256::from_str(&wire.hash)
        .map_err(|e| ErrorDetail::protocol(FEED_SOURCE, format!("invalid block hash {:?}: {e}", wire.hash)))?;

    let timestamp = wire
        .timestamp
        .as_deref()
        .and_then(parse_hex_quantity)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Ok(BlockHeader {
        number,
        hash,
        timestamp,
        observed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoho_core::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    const HASH: &str = "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6";

    #[test]
    fn test_subscribe_request_shape() {
        let json: Value = serde_json::from_str(&SubscribeRequest::new(1, "eth_subscribe", "newHeads").to_json()).unwrap();
        assert_eq!(json, json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        }));
    }

    #[test]
    fn test_classify_ack() {
        let frame = classify(r#"{"id":1,"result":"sub-1"}"#, 1, "eth_subscription").unwrap();
        assert_eq!(frame, Frame::Ack { id: 1, subscription: "sub-1".into() });
    }

    #[test]
    fn test_classify_ack_for_other_id_ignored() {
        let frame = classify(r#"{"id":9,"result":"sub-9"}"#, 1, "eth_subscription").unwrap();
        assert_eq!(frame, Frame::Other);
    }

    #[test]
    fn test_classify_string_id_is_other() {
        let frame = classify(r#"{"jsonrpc":"2.0","id":"abc","result":true}"#, 1, "eth_subscription").unwrap();
        assert_eq!(frame, Frame::Other);

        let frame = classify(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"parse error"}}"#, 1, "eth_subscription").unwrap();
        assert_eq!(frame, Frame::Other);
    }

    #[test]
    fn test_classify_rejection() {
        let text = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#;
        let frame = classify(text, 1, "eth_subscription").unwrap();
        assert_eq!(
            frame,
            Frame::Rejected { id: 1, code: -32601, message: "method not found".into() }
        );
    }

    #[test]
    fn test_classify_notification() {
        let text = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "sub-1", "result": { "number": "0x1b4", "hash": HASH } }
        })
        .to_string();

        match classify(&text, 1, "eth_subscription").unwrap() {
            Frame::Notification { subscription, header } => {
                assert_eq!(subscription, "sub-1");
                assert_eq!(header["number"], "0x1b4");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame() {
        let err = classify("not json", 1, "eth_subscription").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert_eq!(err.source_id, FEED_SOURCE);
    }

    #[test]
    fn test_decode_header() {
        let observed = Utc::now();
        let header = decode_header(
            json!({ "number": "0x1b4", "hash": HASH, "timestamp": "0x6655f0a0" }),
            observed,
        )
        .unwrap();

        assert_eq!(header.number, 436);
        assert_eq!(header.hash_hex(), HASH);
        assert_eq!(header.observed_at, observed);
        assert_eq!(header.timestamp.unwrap().timestamp(), 0x6655f0a0);
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        let now = Utc::now();
        assert!(decode_header(json!({ "number": "436", "hash": HASH }), now).is_err());
        assert!(decode_header(json!({ "number": "0x1", "hash": "0x1234" }), now).is_err());
        assert!(decode_header(json!({ "number": "0x1", "hash": &HASH[2..] }), now).is_err());
        assert!(decode_header(json!({ "hash": HASH }), now).is_err());
    }

    #[test]
    fn test_parse_hex_quantity_edges() {
        assert_eq!(parse_hex_quantity("0x0"), Some(0));
        assert_eq!(parse_hex_quantity("0xffffffffffffffff"), Some(u64::MAX));
        assert_eq!(parse_hex_quantity("0x10000000000000000"), None);
        assert_eq!(parse_hex_quantity("0x"), None);
        assert_eq!(parse_hex_quantity("12"), None);
    }

    proptest! {
        #[test]
        fn prop_hex_quantity_matches_formatting(n in any::<u64>()) {
            prop_assert_eq!(parse_hex_quantity(&format!("{n:#x}")), Some(n));
        }
    }
}
