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

const REST_BASE: &str = "https://www.okx.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://ws.okx.com:8443/ws/v5/public",
    // OKX closes connections idle for 30s; text "ping" keeps it open.
    ping_interval: Duration::from_secs(25),
    compression: Compression::None,
    max_subs_per_frame: 20,
    rest_seed: false,
};

/// OKX v5 USDT-swap connector
///
/// The `books` channel pushes a 400-level snapshot on subscribe and
/// seqId/prevSeqId-chained updates after it. The per-frame checksum is
/// tolerated but not verified; the sequence chain subsumes it for our
/// depth prefix.
pub struct OkxConnector {
    rest: RestClient,
}

impl OkxConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Okx),
        }
    }

    /// OKX levels are [price, size, liquidated, orders]; only the
    /// first two matter.
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

impl Default for OkxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for OkxConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v5/public/instruments?instType=SWAP"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "instruments missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            if s.get("state").and_then(|v| v.as_str()) != Some("live") {
                continue;
            }
            let Some(inst_id) = s.get("instId").and_then(|v| v.as_str()) else {
                continue;
            };
            // "BTC-USDT-SWAP" → base BTC, quote USDT
            let mut parts = inst_id.split('-');
            let base = parts.next().unwrap_or("").to_string();
            let quote = parts.next().unwrap_or("").to_string();

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: inst_id.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base,
                quote_asset: quote,
                kind: InstrumentKind::Perpetual,
                // ctVal is the contract value in base units; together
                // with price that yields quote depth.
                contract_size: s.get("ctVal").and_then(util::json_f64).unwrap_or(1.0),
                tick_size: s.get("tickSz").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: s.get("lotSz").and_then(util::json_f64).unwrap_or(0.0),
                min_notional: 0.0,
                maker_fee: 0.0002,
                taker_fee: 0.0005,
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v5/market/books?instId={native_symbol}&sz={depth}"),
                "code",
                "0",
            )
            .await?;

        let row = body
            .get("data")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .ok_or_else(|| IngestError::protocol(self.id(), "books missing data"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(row.get("bids")),
            asks: Self::levels(row.get("asks")),
            first_seq: None,
            last_seq: row.get("seqId").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: row
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // instId=ANY returns the whole venue in one call
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v5/public/funding-rate?instId=ANY"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "funding-rate missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("instId")?.as_str()?.to_string(),
                    rate: r.get("fundingRate").and_then(util::json_f64)?,
                    next_funding_time: r.get("nextFundingTime").and_then(util::json_ts_ms),
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v5/market/tickers?instType=SWAP"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "tickers missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|t| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("instId")?.as_str()?.to_string(),
                    bid: t.get("bidPx").and_then(util::json_f64),
                    ask: t.get("askPx").and_then(util::json_f64),
                    last: t.get("last").and_then(util::json_f64),
                    // volCcy24h is quote turnover for linear swaps
                    volume_24h: t.get("volCcy24h").and_then(util::json_f64),
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
                    json!({"channel": "books", "instId": s}),
                    json!({"channel": "trades", "instId": s}),
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
                    json!({"channel": "books", "instId": s}),
                    json!({"channel": "trades", "instId": s}),
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
                    ok: v.get("code").and_then(|c| c.as_str()) == Some("0"),
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
                        let seq = row.get("seqId").and_then(util::json_u64).unwrap_or(0);
                        // prevSeqId is -1 on snapshots
                        let prev = row
                            .get("prevSeqId")
                            .and_then(|p| p.as_i64())
                            .filter(|p| *p >= 0)
                            .map(|p| p as u64);
                        let frame = BookFrame {
                            native_symbol: inst_id.to_string(),
                            bids: Self::levels(row.get("bids")),
                            asks: Self::levels(row.get("asks")),
                            first_seq: None,
                            last_seq: seq,
                            prev_seq: prev,
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

            "trades" => rows
                .iter()
                .filter_map(|t| {
                    Some(ParsedFrame::Trade(TradeFrame {
                        native_symbol: t
                            .get("instId")
                            .and_then(|i| i.as_str())
                            .unwrap_or(inst_id)
                            .to_string(),
                        price: t.get("px").and_then(util::json_f64)?,
                        quantity: t.get("sz").and_then(util::json_f64)?,
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
    fn books_snapshot_and_chained_update() {
        let c = OkxConnector::new();
        let snapshot = r#"{
            "arg":{"channel":"books","instId":"BTC-USDT-SWAP"},
            "action":"snapshot",
            "data":[{"asks":[["60000.1","25","0","3"]],"bids":[["60000.0","10","0","1"]],
                     "ts":"1700000000000","seqId":123456,"prevSeqId":-1,"checksum":-855196043}]
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(snapshot)[0] else {
            panic!()
        };
        assert_eq!(s.last_seq, 123456);
        assert_eq!(s.prev_seq, None);
        assert_eq!(s.asks[0].quantity, 25.0);

        let update = r#"{
            "arg":{"channel":"books","instId":"BTC-USDT-SWAP"},
            "action":"update",
            "data":[{"asks":[],"bids":[["60000.0","0","0","0"]],
                     "ts":"1700000000100","seqId":123457,"prevSeqId":123456,"checksum":22}]
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(update)[0] else {
            panic!()
        };
        assert_eq!(d.prev_seq, Some(123456));
        assert_eq!(d.last_seq, 123457);
    }

    #[test]
    fn text_pong_and_error_event() {
        let c = OkxConnector::new();
        assert!(matches!(c.parse_frame("pong")[0], ParsedFrame::Pong));
        assert!(matches!(
            c.parse_frame(r#"{"event":"error","code":"60012","msg":"Invalid request"}"#)[0],
            ParsedFrame::SubAck { ok: false, .. }
        ));
    }

    #[test]
    fn trade_rows() {
        let c = OkxConnector::new();
        let raw = r#"{
            "arg":{"channel":"trades","instId":"ETH-USDT-SWAP"},
            "data":[{"instId":"ETH-USDT-SWAP","tradeId":"517","px":"3000.25","sz":"12","side":"buy","ts":"1700000000000"}]
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.native_symbol, "ETH-USDT-SWAP");
        assert_eq!(t.quantity, 12.0);
        assert_eq!(t.side, "buy");
    }
}
