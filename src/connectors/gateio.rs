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

const REST_BASE: &str = "https://api.gateio.ws/api/v4";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://fx-ws.gateio.ws/v4/ws/usdt",
    ping_interval: Duration::from_secs(20),
    compression: Compression::None,
    max_subs_per_frame: 1,
    rest_seed: true,
};

/// Gate.io USDT-futures connector
///
/// `futures.order_book_update` is a diff stream with binance-style
/// U/u ids, seeded from the REST order book (`with_id=true`). Sizes
/// are signed contract counts on the wire; the sign encodes the side
/// in trades and is absolute in book levels.
pub struct GateioConnector {
    rest: RestClient,
}

impl GateioConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Gateio),
        }
    }

    /// Futures book levels are objects: {"p": "60000.1", "s": 1500}
    fn obj_levels(raw: Option<&Value>) -> Vec<PriceLevel> {
        raw.and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|row| {
                        let price = row.get("p").and_then(util::json_f64)?;
                        let size = row.get("s").and_then(util::json_f64)?;
                        Some(PriceLevel::new(price, size.abs()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for GateioConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for GateioConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Gateio
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/futures/usdt/contracts"))
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts not an array"))?;

        let mut out = Vec::new();
        for s in rows {
            if s.get("in_delisting").and_then(|v| v.as_bool()) == Some(true) {
                continue;
            }
            let Some(native) = s.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            // "BTC_USDT" → base BTC, quote USDT
            let mut parts = native.split('_');
            let base = parts.next().unwrap_or("").to_string();
            let quote = parts.next().unwrap_or("").to_string();

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base,
                quote_asset: quote,
                kind: InstrumentKind::Perpetual,
                contract_size: s
                    .get("quanto_multiplier")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                tick_size: s
                    .get("order_price_round")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                lot_size: s
                    .get("order_size_min")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                min_notional: 0.0,
                maker_fee: s
                    .get("maker_fee_rate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0002),
                taker_fee: s
                    .get("taker_fee_rate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0005),
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/futures/usdt/order_book?contract={native_symbol}&limit={depth}&with_id=true"
            ))
            .await?;

        let id = body
            .get("id")
            .and_then(util::json_u64)
            .ok_or_else(|| IngestError::protocol(self.id(), "order_book missing id"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::obj_levels(body.get("bids")),
            asks: Self::obj_levels(body.get("asks")),
            first_seq: None,
            last_seq: id,
            prev_seq: None,
            timestamp: body
                .get("current")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // Contracts carry funding_rate + funding_next_apply venue-wide
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/futures/usdt/contracts"))
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts not an array"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("name")?.as_str()?.to_string(),
                    rate: r.get("funding_rate").and_then(util::json_f64)?,
                    next_funding_time: r.get("funding_next_apply").and_then(util::json_ts_ms),
                    interval_hours: r
                        .get("funding_interval")
                        .and_then(util::json_f64)
                        .map(|secs| secs / 3600.0)
                        .unwrap_or(8.0),
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/futures/usdt/tickers"))
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| IngestError::protocol(self.id(), "tickers not an array"))?;

        Ok(rows
            .iter()
            .filter_map(|t| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("contract")?.as_str()?.to_string(),
                    bid: t.get("highest_bid").and_then(util::json_f64),
                    ask: t.get("lowest_ask").and_then(util::json_f64),
                    last: t.get("last").and_then(util::json_f64),
                    volume_24h: t.get("volume_24h_settle").and_then(util::json_f64),
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
                        "time": util::now_ms() / 1000,
                        "channel": "futures.order_book_update",
                        "event": "subscribe",
                        "payload": [s, "100ms", depth.to_string()]
                    })
                    .to_string(),
                    json!({
                        "time": util::now_ms() / 1000,
                        "channel": "futures.trades",
                        "event": "subscribe",
                        "payload": [s]
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
                        "time": util::now_ms() / 1000,
                        "channel": "futures.order_book_update",
                        "event": "unsubscribe",
                        "payload": [s, "100ms", depth.to_string()]
                    })
                    .to_string(),
                    json!({
                        "time": util::now_ms() / 1000,
                        "channel": "futures.trades",
                        "event": "unsubscribe",
                        "payload": [s]
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

        let channel = v.get("channel").and_then(|c| c.as_str()).unwrap_or("");
        let event = v.get("event").and_then(|e| e.as_str()).unwrap_or("");

        if channel == "futures.pong" {
            return vec![ParsedFrame::Pong];
        }

        if event == "subscribe" || event == "unsubscribe" {
            let ok = v.get("error").map(|e| e.is_null()).unwrap_or(true);
            return vec![ParsedFrame::SubAck {
                ok,
                detail: v.get("error").map(|e| e.to_string()).filter(|_| !ok),
            }];
        }

        if event != "update" && event != "all" {
            return vec![ParsedFrame::Control];
        }

        match channel {
            "futures.order_book_update" => {
                let Some(result) = v.get("result") else {
                    return vec![ParsedFrame::Malformed("update without result".into())];
                };
                let Some(symbol) = result.get("s").and_then(|s| s.as_str()) else {
                    return vec![ParsedFrame::Malformed("update without s".into())];
                };
                let (Some(first), Some(last)) = (
                    result.get("U").and_then(util::json_u64),
                    result.get("u").and_then(util::json_u64),
                ) else {
                    return vec![ParsedFrame::Malformed("update without U/u".into())];
                };

                vec![ParsedFrame::Delta(BookFrame {
                    native_symbol: symbol.to_string(),
                    bids: Self::obj_levels(result.get("b")),
                    asks: Self::obj_levels(result.get("a")),
                    first_seq: Some(first),
                    last_seq: last,
                    prev_seq: None,
                    timestamp: result
                        .get("t")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            "futures.trades" => {
                let Some(rows) = v.get("result").and_then(|r| r.as_array()) else {
                    return vec![ParsedFrame::Malformed("trades without result".into())];
                };
                rows.iter()
                    .filter_map(|t| {
                        // Negative size = taker sell
                        let size = t.get("size").and_then(util::json_f64)?;
                        Some(ParsedFrame::Trade(TradeFrame {
                            native_symbol: t.get("contract")?.as_str()?.to_string(),
                            price: t.get("price").and_then(util::json_f64)?,
                            quantity: size.abs(),
                            side: if size < 0.0 { "sell" } else { "buy" }.to_string(),
                            timestamp: t
                                .get("create_time_ms")
                                .and_then(util::json_ts_ms)
                                .unwrap_or_else(util::now_ms),
                        }))
                    })
                    .collect()
            }

            _ => vec![ParsedFrame::Control],
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some(
            json!({
                "time": util::now_ms() / 1000,
                "channel": "futures.ping"
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_book_update_with_object_levels() {
        let c = GateioConnector::new();
        let raw = r#"{
            "time":1700000000,"channel":"futures.order_book_update","event":"update",
            "result":{"t":1700000000123,"s":"BTC_USDT","U":4622074361,"u":4622074369,
                      "b":[{"p":"60000.0","s":1500},{"p":"59999.5","s":0}],
                      "a":[{"p":"60000.5","s":-200}]}
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(d.native_symbol, "BTC_USDT");
        assert_eq!(d.first_seq, Some(4622074361));
        assert_eq!(d.last_seq, 4622074369);
        assert_eq!(d.bids[1].quantity, 0.0);
        // Sizes are absolute in book levels
        assert_eq!(d.asks[0].quantity, 200.0);
    }

    #[test]
    fn signed_trade_sizes() {
        let c = GateioConnector::new();
        let raw = r#"{
            "channel":"futures.trades","event":"update",
            "result":[
                {"id":1,"contract":"BTC_USDT","size":50,"price":"60000.1","create_time_ms":1700000000000},
                {"id":2,"contract":"BTC_USDT","size":-20,"price":"60000.0","create_time_ms":1700000000001}
            ]
        }"#;
        let frames = c.parse_frame(raw);
        let ParsedFrame::Trade(buy) = &frames[0] else {
            panic!()
        };
        let ParsedFrame::Trade(sell) = &frames[1] else {
            panic!()
        };
        assert_eq!(buy.side, "buy");
        assert_eq!(buy.quantity, 50.0);
        assert_eq!(sell.side, "sell");
        assert_eq!(sell.quantity, 20.0);
    }

    #[test]
    fn subscribe_ack_with_error() {
        let c = GateioConnector::new();
        let ok = r#"{"time":1,"channel":"futures.order_book_update","event":"subscribe","error":null,"result":{"status":"success"}}"#;
        assert!(matches!(
            c.parse_frame(ok)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));

        let bad = r#"{"time":1,"channel":"futures.order_book_update","event":"subscribe","error":{"code":2,"message":"unknown contract"}}"#;
        assert!(matches!(
            c.parse_frame(bad)[0],
            ParsedFrame::SubAck { ok: false, .. }
        ));
    }
}
