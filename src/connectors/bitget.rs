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

const REST_BASE: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "usdt-futures";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://ws.bitget.com/v2/ws/public",
    ping_interval: Duration::from_secs(30),
    compression: Compression::None,
    max_subs_per_frame: 20,
    rest_seed: false,
};

/// Bitget v2 USDT-futures connector
///
/// The `books` channel pushes a snapshot action followed by seq-chained
/// updates; text "ping"/"pong" keepalive.
pub struct BitgetConnector {
    rest: RestClient,
}

impl BitgetConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Bitget),
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

    async fn tickers(&self) -> Result<Vec<Value>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v2/mix/market/tickers?productType={PRODUCT_TYPE}"),
                "code",
                "00000",
            )
            .await?;
        body.get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| IngestError::protocol(self.id(), "tickers missing data"))
    }
}

impl Default for BitgetConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for BitgetConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bitget
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v2/mix/market/contracts?productType={PRODUCT_TYPE}"),
                "code",
                "00000",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            if s.get("symbolStatus").and_then(|v| v.as_str()) != Some("normal") {
                continue;
            }
            if s.get("symbolType").and_then(|v| v.as_str()) == Some("delivery") {
                continue;
            }
            let Some(native) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s.get("baseCoin").and_then(|v| v.as_str()).unwrap_or("");

            // tick = priceEndStep * 10^-pricePlace
            let price_place = s.get("pricePlace").and_then(util::json_f64).unwrap_or(0.0);
            let end_step = s.get("priceEndStep").and_then(util::json_f64).unwrap_or(1.0);
            let tick_size = end_step * 10f64.powf(-price_place);

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                quote_asset: s
                    .get("quoteCoin")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                kind: InstrumentKind::Perpetual,
                contract_size: s
                    .get("sizeMultiplier")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                tick_size,
                lot_size: s
                    .get("minTradeNum")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                min_notional: s
                    .get("minTradeUSDT")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
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

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json_checked(
                &format!(
                    "{REST_BASE}/api/v2/mix/market/merge-depth?productType={PRODUCT_TYPE}&symbol={native_symbol}&limit={depth}"
                ),
                "code",
                "00000",
            )
            .await?;

        let data = body
            .get("data")
            .ok_or_else(|| IngestError::protocol(self.id(), "merge-depth missing data"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(data.get("bids")),
            asks: Self::levels(data.get("asks")),
            first_seq: None,
            last_seq: data.get("ts").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: data
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // Funding rides on the venue-wide ticker list
        Ok(self
            .tickers()
            .await?
            .iter()
            .filter_map(|t| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: t.get("symbol")?.as_str()?.to_string(),
                    rate: t.get("fundingRate").and_then(util::json_f64)?,
                    next_funding_time: None,
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        Ok(self
            .tickers()
            .await?
            .iter()
            .filter_map(|t| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("symbol")?.as_str()?.to_string(),
                    bid: t.get("bidPr").and_then(util::json_f64),
                    ask: t.get("askPr").and_then(util::json_f64),
                    last: t.get("lastPr").and_then(util::json_f64),
                    volume_24h: t.get("usdtVolume").and_then(util::json_f64),
                    timestamp: t
                        .get("ts")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        let args: Vec<Value> = symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({"instType": "USDT-FUTURES", "channel": "books", "instId": s}),
                    json!({"instType": "USDT-FUTURES", "channel": "trade", "instId": s}),
                ]
            })
            .collect();
        vec![json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn unsubscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        let args: Vec<Value> = symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({"instType": "USDT-FUTURES", "channel": "books", "instId": s}),
                    json!({"instType": "USDT-FUTURES", "channel": "trade", "instId": s}),
                ]
            })
            .collect();
        vec![json!({"op": "unsubscribe", "args": args}).to_string()]
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        if raw == "pong" {
            return vec![ParsedFrame::Pong];
        }

        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        if let Some(event) = v.get("event").and_then(|e| e.as_str()) {
            return match event {
                "subscribe" | "unsubscribe" => vec![ParsedFrame::SubAck {
                    ok: true,
                    detail: None,
                }],
                "error" => vec![ParsedFrame::SubAck {
                    ok: false,
                    detail: v.get("msg").and_then(|m| m.as_str()).map(String::from),
                }],
                "login" => vec![ParsedFrame::AuthAck {
                    ok: v.get("code").and_then(util::json_u64) == Some(0),
                    detail: v.get("msg").and_then(|m| m.as_str()).map(String::from),
                }],
                _ => vec![ParsedFrame::Control],
            };
        }

        let Some(arg) = v.get("arg") else {
            return vec![ParsedFrame::Control];
        };
        let channel = arg.get("channel").and_then(|c| c.as_str()).unwrap_or("");
        let inst_id = arg.get("instId").and_then(|i| i.as_str()).unwrap_or("");
        let Some(rows) = v.get("data").and_then(|d| d.as_array()) else {
            return vec![ParsedFrame::Control];
        };

        match channel {
            "books" => {
                let action = v.get("action").and_then(|a| a.as_str()).unwrap_or("update");
                rows.iter()
                    .map(|row| {
                        let seq = row.get("seq").and_then(util::json_u64).unwrap_or(0);
                        let frame = BookFrame {
                            native_symbol: inst_id.to_string(),
                            bids: Self::levels(row.get("bids")),
                            asks: Self::levels(row.get("asks")),
                            first_seq: Some(seq),
                            last_seq: seq,
                            prev_seq: None,
                            timestamp: row
                                .get("ts")
                                .and_then(util::json_ts_ms)
                                .unwrap_or_else(util::now_ms),
                        };
                        if action == "snapshot" {
                            ParsedFrame::Snapshot(frame)
                        } else {
                            ParsedFrame::Delta(frame)
                        }
                    })
                    .collect()
            }

            "trade" => rows
                .iter()
                .filter_map(|t| {
                    Some(ParsedFrame::Trade(TradeFrame {
                        native_symbol: inst_id.to_string(),
                        price: t.get("price").and_then(util::json_f64)?,
                        quantity: t.get("size").and_then(util::json_f64)?,
                        side: t
                            .get("side")
                            .and_then(|s| s.as_str())
                            .unwrap_or("")
                            .to_lowercase(),
                        timestamp: t
                            .get("ts")
                            .and_then(util::json_ts_ms)
                            .unwrap_or_else(util::now_ms),
                    }))
                })
                .collect(),

            _ => vec![ParsedFrame::Control],
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some("ping".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn books_snapshot_then_update() {
        let c = BitgetConnector::new();
        let snapshot = r#"{
            "action":"snapshot",
            "arg":{"instType":"USDT-FUTURES","channel":"books","instId":"BTCUSDT"},
            "data":[{"asks":[["60001.0","2.5"]],"bids":[["60000.0","1.0"]],
                     "checksum":0,"seq":1400,"ts":"1700000000000"}],
            "ts":1700000000001
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(snapshot)[0] else {
            panic!()
        };
        assert_eq!(s.last_seq, 1400);
        assert_eq!(s.native_symbol, "BTCUSDT");

        let update = r#"{
            "action":"update",
            "arg":{"instType":"USDT-FUTURES","channel":"books","instId":"BTCUSDT"},
            "data":[{"asks":[["60001.0","0"]],"bids":[],"checksum":0,"seq":1401,"ts":"1700000000100"}],
            "ts":1700000000101
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(update)[0] else {
            panic!()
        };
        assert_eq!(d.first_seq, Some(1401));
        assert_eq!(d.asks[0].quantity, 0.0);
    }

    #[test]
    fn trade_channel() {
        let c = BitgetConnector::new();
        let raw = r#"{
            "action":"update",
            "arg":{"instType":"USDT-FUTURES","channel":"trade","instId":"ETHUSDT"},
            "data":[{"ts":"1700000000000","price":"3000.12","size":"0.5","side":"sell","tradeId":"1"}]
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.native_symbol, "ETHUSDT");
        assert_eq!(t.side, "sell");
    }

    #[test]
    fn text_pong() {
        let c = BitgetConnector::new();
        assert!(matches!(c.parse_frame("pong")[0], ParsedFrame::Pong));
    }
}
