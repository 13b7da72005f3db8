use std::time::Duration;

use serde_json::{Value, json};

use crate::connectors::connector::{
    BookFrame, Compression, ExchangeConnector, ParsedFrame, TradeFrame, WireProfile,
};
use crate::connectors::rest::RestClient;
use crate::error::{IngestError, Result};
use crate::normalizer::canonicalize;
use crate::schema::{ExchangeId, FundingRate, Instrument, InstrumentKind, PriceLevel, PriceTicker};
use crate::util;

const REST_BASE: &str = "https://lbkperp.lbank.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://lbkperp.lbank.com/ws/V3/",
    ping_interval: Duration::from_secs(30),
    compression: Compression::None,
    max_subs_per_frame: 1,
    rest_seed: false,
};

/// LBank USDT-perpetual connector
///
/// Depth pushes carry the full top-N book each tick (no deltas); the
/// server drives keepalive with a uuid ping that must be echoed.
pub struct LbankConnector {
    rest: RestClient,
}

impl LbankConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Lbank),
        }
    }

    fn levels(raw: Option<&Value>) -> Vec<PriceLevel> {
        raw.and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(util::json_level)
                    .map(|(p, q)| PriceLevel::new(p, q))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for LbankConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for LbankConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Lbank
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/cfd/openApi/v1/pub/instrument?productGroup=SwapU"
            ))
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "instrument missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            let Some(native) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s
                .get("baseCurrency")
                .and_then(|v| v.as_str())
                .unwrap_or("");

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                quote_asset: s
                    .get("clearCurrency")
                    .and_then(|v| v.as_str())
                    .unwrap_or("USDT")
                    .to_string(),
                kind: InstrumentKind::Perpetual,
                contract_size: s
                    .get("volumeMultiple")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                tick_size: s.get("priceTick").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: s.get("volumeTick").and_then(util::json_f64).unwrap_or(1.0),
                min_notional: 0.0,
                maker_fee: 0.0002,
                taker_fee: 0.0006,
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/cfd/openApi/v1/pub/marketOrder?symbol={native_symbol}&depth={depth}"
            ))
            .await?;

        let data = body
            .get("data")
            .ok_or_else(|| IngestError::protocol(self.id(), "marketOrder missing data"))?;

        let ts = util::now_ms();
        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(data.get("bids")),
            asks: Self::levels(data.get("asks")),
            first_seq: None,
            last_seq: ts as u64,
            prev_seq: None,
            timestamp: ts,
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // marketData covers the venue, funding included
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/cfd/openApi/v1/pub/marketData?productGroup=SwapU"
            ))
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "marketData missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("symbol")?.as_str()?.to_string(),
                    rate: r.get("fundingRate").and_then(util::json_f64)?,
                    next_funding_time: r.get("nextFeeTime").and_then(util::json_ts_ms),
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/cfd/openApi/v1/pub/marketData?productGroup=SwapU"
            ))
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "marketData missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|t| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("symbol")?.as_str()?.to_string(),
                    bid: t.get("bestBid").and_then(util::json_f64),
                    ask: t.get("bestAsk").and_then(util::json_f64),
                    last: t.get("lastPrice").and_then(util::json_f64),
                    volume_24h: t.get("turnover").and_then(util::json_f64),
                    timestamp: util::now_ms(),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "action": "subscribe",
                        "subscribe": "depth",
                        "depth": depth.to_string(),
                        "pair": s
                    })
                    .to_string(),
                    json!({
                        "action": "subscribe",
                        "subscribe": "trade",
                        "pair": s
                    })
                    .to_string(),
                ]
            })
            .collect()
    }

    fn unsubscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "action": "unsubscribe",
                        "subscribe": "depth",
                        "depth": depth.to_string(),
                        "pair": s
                    })
                    .to_string(),
                    json!({
                        "action": "unsubscribe",
                        "subscribe": "trade",
                        "pair": s
                    })
                    .to_string(),
                ]
            })
            .collect()
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        // Server keepalive: {"action":"ping","ping":"<uuid>"}
        if v.get("action").and_then(|a| a.as_str()) == Some("ping") {
            let id = v.get("ping").and_then(|p| p.as_str()).unwrap_or("");
            return vec![ParsedFrame::Ping(Some(id.to_string()))];
        }
        if v.get("pong").is_some() {
            return vec![ParsedFrame::Pong];
        }

        let Some(kind) = v.get("type").and_then(|t| t.as_str()) else {
            return vec![ParsedFrame::Control];
        };
        let Some(pair) = v.get("pair").and_then(|p| p.as_str()) else {
            return vec![ParsedFrame::Control];
        };

        match kind {
            "depth" => {
                let Some(depth) = v.get("depth") else {
                    return vec![ParsedFrame::Malformed("depth push without body".into())];
                };
                let ts = v
                    .get("TS")
                    .and_then(|t| t.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_else(util::now_ms);

                // Full top-N book each push
                vec![ParsedFrame::Snapshot(BookFrame {
                    native_symbol: pair.to_string(),
                    bids: Self::levels(depth.get("bids")),
                    asks: Self::levels(depth.get("asks")),
                    first_seq: None,
                    last_seq: ts as u64,
                    prev_seq: None,
                    timestamp: ts,
                })]
            }

            "trade" => {
                let Some(trade) = v.get("trade") else {
                    return vec![ParsedFrame::Malformed("trade push without body".into())];
                };
                let ts = trade
                    .get("TS")
                    .and_then(|t| t.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_else(util::now_ms);

                vec![ParsedFrame::Trade(TradeFrame {
                    native_symbol: pair.to_string(),
                    price: trade.get("price").and_then(util::json_f64).unwrap_or(0.0),
                    quantity: trade.get("volume").and_then(util::json_f64).unwrap_or(0.0),
                    side: trade
                        .get("direction")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_lowercase(),
                    timestamp: ts,
                })]
            }

            _ => vec![ParsedFrame::Control],
        }
    }

    /// Echo the server's ping uuid.
    fn pong_frame(&self, payload: Option<&str>) -> Option<String> {
        Some(
            json!({
                "action": "pong",
                "pong": payload.unwrap_or("")
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_push_with_rfc3339_timestamp() {
        let c = LbankConnector::new();
        let raw = r#"{
            "type":"depth","pair":"BTCUSDT",
            "depth":{"asks":[[60000.5,0.8]],"bids":[[60000.0,1.1]]},
            "TS":"2026-08-01T17:49:22.722+08:00"
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(s.native_symbol, "BTCUSDT");
        assert_eq!(s.asks[0].price, 60000.5);
        assert!(s.timestamp > 1_700_000_000_000);
    }

    #[test]
    fn uuid_ping_echo() {
        let c = LbankConnector::new();
        let frames =
            c.parse_frame(r#"{"action":"ping","ping":"0ca8f854-7ba7-4341-9d86-d3327e52804e"}"#);
        let ParsedFrame::Ping(Some(id)) = &frames[0] else {
            panic!()
        };
        let reply = c.pong_frame(Some(id)).unwrap();
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["action"], "pong");
        assert_eq!(v["pong"], "0ca8f854-7ba7-4341-9d86-d3327e52804e");
    }

    #[test]
    fn trade_push() {
        let c = LbankConnector::new();
        let raw = r#"{
            "type":"trade","pair":"ETHUSDT",
            "trade":{"price":3000.4,"volume":1.5,"direction":"sell","TS":"2026-08-01T17:49:22.722+08:00"},
            "TS":"2026-08-01T17:49:22.722+08:00"
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.side, "sell");
        assert_eq!(t.quantity, 1.5);
    }
}
