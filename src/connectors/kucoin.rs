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

const REST_BASE: &str = "https://api-futures.kucoin.com";

static WIRE: WireProfile = WireProfile {
    // Placeholder; the real endpoint is handed out per session by the
    // bullet-public token call (ws_endpoint).
    ws_url: "wss://ws-api-futures.kucoin.com",
    ping_interval: Duration::from_secs(18),
    compression: Compression::None,
    max_subs_per_frame: 1,
    rest_seed: true,
};

/// KuCoin futures connector
///
/// Quirks:
/// - The WS endpoint + connect token come from a REST bullet request.
/// - level2 deltas carry one price change each, encoded as a
///   "price,side,quantity" string, with a strictly consecutive
///   sequence number.
/// - BTC trades as XBT; the synonym table folds it back.
pub struct KucoinConnector {
    rest: RestClient,
}

impl KucoinConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Kucoin),
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

    /// Parses a level2 change string "5000.0,sell,83" into a one-sided
    /// book frame.
    fn parse_change(change: &str, sequence: u64, timestamp: i64, symbol: &str) -> Option<BookFrame> {
        let mut parts = change.split(',');
        let price: f64 = parts.next()?.parse().ok()?;
        let side = parts.next()?;
        let quantity: f64 = parts.next()?.parse().ok()?;

        let level = PriceLevel::new(price, quantity);
        let (bids, asks) = match side {
            "buy" => (vec![level], Vec::new()),
            "sell" => (Vec::new(), vec![level]),
            _ => return None,
        };

        Some(BookFrame {
            native_symbol: symbol.to_string(),
            bids,
            asks,
            first_seq: Some(sequence),
            last_seq: sequence,
            prev_seq: None,
            timestamp,
        })
    }
}

impl Default for KucoinConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for KucoinConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Kucoin
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    /// Session endpoints are token-scoped: POST bullet-public, then
    /// append the token to the advertised instance server.
    async fn ws_endpoint(&self) -> Result<String> {
        let body = self
            .rest
            .post_json(&format!("{REST_BASE}/api/v1/bullet-public"))
            .await?;

        let token = body
            .pointer("/data/token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IngestError::protocol(self.id(), "bullet response missing token"))?;
        let endpoint = body
            .pointer("/data/instanceServers/0/endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| IngestError::protocol(self.id(), "bullet response missing endpoint"))?;

        Ok(format!(
            "{endpoint}?token={token}&connectId={}",
            util::now_ms()
        ))
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/contracts/active"),
                "code",
                "200000",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            if s.get("status").and_then(|v| v.as_str()) != Some("Open") {
                continue;
            }
            let Some(native) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            // Dated futures carry a settlement suffix (XBTMM24); the
            // perpetual set ends in M after the quote.
            if s.get("type").and_then(|v| v.as_str()) == Some("FFICSX") {
                continue;
            }
            let base = s.get("baseCurrency").and_then(|v| v.as_str()).unwrap_or("");

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                quote_asset: s
                    .get("quoteCurrency")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                kind: InstrumentKind::Perpetual,
                // multiplier converts contract counts into base units
                contract_size: s.get("multiplier").and_then(util::json_f64).unwrap_or(1.0),
                tick_size: s.get("tickSize").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: s.get("lotSize").and_then(util::json_f64).unwrap_or(1.0),
                min_notional: 0.0,
                maker_fee: s
                    .get("makerFeeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0002),
                taker_fee: s
                    .get("takerFeeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0006),
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, _depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/level2/snapshot?symbol={native_symbol}"),
                "code",
                "200000",
            )
            .await?;

        let data = body
            .get("data")
            .ok_or_else(|| IngestError::protocol(self.id(), "snapshot missing data"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(data.get("bids")),
            asks: Self::levels(data.get("asks")),
            first_seq: None,
            last_seq: data.get("sequence").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: data
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // The active-contract list already carries current funding.
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/contracts/active"),
                "code",
                "200000",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("symbol")?.as_str()?.to_string(),
                    rate: r.get("fundingFeeRate").and_then(util::json_f64)?,
                    next_funding_time: r.get("nextFundingRateTime").and_then(|v| v.as_i64()).map(
                        |offset_ms| {
                            // Reported as an offset from now, not an epoch
                            util::now_ms() + offset_ms
                        },
                    ),
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/contracts/active"),
                "code",
                "200000",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: r.get("symbol")?.as_str()?.to_string(),
                    bid: None,
                    ask: None,
                    last: r.get("lastTradePrice").and_then(util::json_f64),
                    volume_24h: r.get("turnoverOf24h").and_then(util::json_f64),
                    timestamp: util::now_ms(),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "id": util::now_ms().to_string(),
                        "type": "subscribe",
                        "topic": format!("/contractMarket/level2:{s}"),
                        "response": true
                    })
                    .to_string(),
                    json!({
                        "id": util::now_ms().to_string(),
                        "type": "subscribe",
                        "topic": format!("/contractMarket/execution:{s}"),
                        "response": true
                    })
                    .to_string(),
                ]
            })
            .collect()
    }

    fn unsubscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "id": util::now_ms().to_string(),
                        "type": "unsubscribe",
                        "topic": format!("/contractMarket/level2:{s}")
                    })
                    .to_string(),
                    json!({
                        "id": util::now_ms().to_string(),
                        "type": "unsubscribe",
                        "topic": format!("/contractMarket/execution:{s}")
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

        match v.get("type").and_then(|t| t.as_str()) {
            Some("welcome") => return vec![ParsedFrame::Control],
            Some("pong") => return vec![ParsedFrame::Pong],
            Some("ack") => {
                return vec![ParsedFrame::SubAck {
                    ok: true,
                    detail: None,
                }];
            }
            Some("error") => {
                return vec![ParsedFrame::SubAck {
                    ok: false,
                    detail: v.get("data").map(|d| d.to_string()),
                }];
            }
            Some("message") => {}
            _ => return vec![ParsedFrame::Control],
        }

        let topic = v.get("topic").and_then(|t| t.as_str()).unwrap_or("");
        let Some(data) = v.get("data") else {
            return vec![ParsedFrame::Control];
        };

        if let Some(symbol) = topic.strip_prefix("/contractMarket/level2:") {
            let sequence = data.get("sequence").and_then(util::json_u64).unwrap_or(0);
            let timestamp = data
                .get("timestamp")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms);
            let Some(change) = data.get("change").and_then(|c| c.as_str()) else {
                return vec![ParsedFrame::Malformed("level2 without change".into())];
            };
            return match Self::parse_change(change, sequence, timestamp, symbol) {
                Some(frame) => vec![ParsedFrame::Delta(frame)],
                None => vec![ParsedFrame::Malformed(format!("bad change '{change}'"))],
            };
        }

        if let Some(symbol) = topic.strip_prefix("/contractMarket/execution:") {
            return vec![
                TradeFrame {
                    native_symbol: symbol.to_string(),
                    price: data.get("price").and_then(util::json_f64).unwrap_or(0.0),
                    quantity: data.get("size").and_then(util::json_f64).unwrap_or(0.0),
                    side: data
                        .get("side")
                        .and_then(|s| s.as_str())
                        .unwrap_or("")
                        .to_lowercase(),
                    timestamp: data
                        .get("ts")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                },
            ]
            .into_iter()
            .map(ParsedFrame::Trade)
            .collect();
        }

        vec![ParsedFrame::Control]
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some(
            json!({
                "id": util::now_ms().to_string(),
                "type": "ping"
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level2_change_string() {
        let c = KucoinConnector::new();
        let raw = r#"{
            "topic":"/contractMarket/level2:XBTUSDTM",
            "type":"message","subject":"level2",
            "data":{"sequence":18,"change":"5000.0,sell,83","timestamp":1700000000000}
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(d.native_symbol, "XBTUSDTM");
        assert!(d.bids.is_empty());
        assert_eq!(d.asks[0].price, 5000.0);
        assert_eq!(d.asks[0].quantity, 83.0);
        assert_eq!(d.first_seq, Some(18));
    }

    #[test]
    fn buy_side_change_and_deletion() {
        let frame =
            KucoinConnector::parse_change("59999.5,buy,0", 42, 1_700_000_000_000, "XBTUSDTM")
                .unwrap();
        assert_eq!(frame.bids[0].quantity, 0.0);
        assert!(frame.asks.is_empty());

        assert!(KucoinConnector::parse_change("bad,data", 1, 0, "X").is_none());
    }

    #[test]
    fn welcome_and_pong() {
        let c = KucoinConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"id":"1","type":"welcome"}"#)[0],
            ParsedFrame::Control
        ));
        assert!(matches!(
            c.parse_frame(r#"{"id":"2","type":"pong"}"#)[0],
            ParsedFrame::Pong
        ));
    }

    #[test]
    fn execution_trades() {
        let c = KucoinConnector::new();
        let raw = r#"{
            "topic":"/contractMarket/execution:ETHUSDTM",
            "type":"message","subject":"match",
            "data":{"symbol":"ETHUSDTM","sequence":36,"side":"buy","size":10,
                    "price":3000.5,"ts":1700000000000000000}
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.quantity, 10.0);
        assert_eq!(t.price, 3000.5);
    }
}
