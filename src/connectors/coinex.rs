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

const REST_BASE: &str = "https://api.coinex.com/v2";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://socket.coinex.com/v2/futures",
    ping_interval: Duration::from_secs(30),
    // v2 sockets gzip every payload
    compression: Compression::Gzip,
    max_subs_per_frame: 50,
    rest_seed: false,
};

/// CoinEx v2 futures connector
///
/// JSON-RPC style frames; `depth.update` carries an `is_full` flag
/// instead of a separate snapshot action, with the book timestamp as
/// the only ordering handle.
pub struct CoinexConnector {
    rest: RestClient,
}

impl CoinexConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Coinex),
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

impl Default for CoinexConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for CoinexConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Coinex
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(&format!("{REST_BASE}/futures/market"), "code", "0")
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "market missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            if s.get("contract_type").and_then(|v| v.as_str()) != Some("linear") {
                continue;
            }
            let Some(native) = s.get("market").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s.get("base_ccy").and_then(|v| v.as_str()).unwrap_or("");

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                quote_asset: s
                    .get("quote_ccy")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                kind: InstrumentKind::Perpetual,
                contract_size: 1.0,
                tick_size: s.get("tick_size").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: s.get("min_amount").and_then(util::json_f64).unwrap_or(0.0),
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
        // interval=0 → no price merging
        let body = self
            .rest
            .get_json_checked(
                &format!(
                    "{REST_BASE}/futures/depth?market={native_symbol}&limit={depth}&interval=0"
                ),
                "code",
                "0",
            )
            .await?;

        let depth_obj = body
            .pointer("/data/depth")
            .ok_or_else(|| IngestError::protocol(self.id(), "depth missing data.depth"))?;

        let ts = depth_obj
            .get("updated_at")
            .and_then(util::json_ts_ms)
            .unwrap_or_else(util::now_ms);

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(depth_obj.get("bids")),
            asks: Self::levels(depth_obj.get("asks")),
            first_seq: None,
            last_seq: ts as u64,
            prev_seq: None,
            timestamp: ts,
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        let body = self
            .rest
            .get_json_checked(&format!("{REST_BASE}/futures/funding-rate"), "code", "0")
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
                    native_symbol: r.get("market")?.as_str()?.to_string(),
                    rate: r.get("latest_funding_rate").and_then(util::json_f64)?,
                    next_funding_time: r.get("next_funding_time").and_then(util::json_ts_ms),
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json_checked(&format!("{REST_BASE}/futures/ticker"), "code", "0")
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "ticker missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|t| {
                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("market")?.as_str()?.to_string(),
                    // Top of book is not part of the ticker payload
                    bid: None,
                    ask: None,
                    last: t.get("last").and_then(util::json_f64),
                    volume_24h: t.get("value").and_then(util::json_f64),
                    timestamp: util::now_ms(),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        let market_list: Vec<Value> = symbols
            .iter()
            .map(|s| json!([s, depth, "0", true]))
            .collect();

        vec![
            json!({
                "method": "depth.subscribe",
                "params": {"market_list": market_list},
                "id": util::now_ms()
            })
            .to_string(),
            json!({
                "method": "deals.subscribe",
                "params": {"market_list": symbols},
                "id": util::now_ms()
            })
            .to_string(),
        ]
    }

    fn unsubscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        vec![
            json!({
                "method": "depth.unsubscribe",
                "params": {"market_list": symbols},
                "id": util::now_ms()
            })
            .to_string(),
            json!({
                "method": "deals.unsubscribe",
                "params": {"market_list": symbols},
                "id": util::now_ms()
            })
            .to_string(),
        ]
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        // RPC replies: {"id":1,"code":0,"message":"OK"} and pong
        if v.get("id").and_then(|i| i.as_i64()).is_some() && v.get("method").is_none() {
            if v.pointer("/data/result").and_then(|r| r.as_str()) == Some("pong")
                || v.get("result").and_then(|r| r.as_str()) == Some("pong")
            {
                return vec![ParsedFrame::Pong];
            }
            let ok = v.get("code").and_then(|c| c.as_i64()) == Some(0);
            return vec![ParsedFrame::SubAck {
                ok,
                detail: v.get("message").and_then(|m| m.as_str()).map(String::from),
            }];
        }

        let method = v.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let Some(data) = v.get("data") else {
            return vec![ParsedFrame::Control];
        };

        match method {
            "depth.update" => {
                let Some(market) = data.get("market").and_then(|m| m.as_str()) else {
                    return vec![ParsedFrame::Malformed("depth.update without market".into())];
                };
                let Some(depth) = data.get("depth") else {
                    return vec![ParsedFrame::Malformed("depth.update without depth".into())];
                };
                let is_full = data.get("is_full").and_then(|f| f.as_bool()).unwrap_or(false);
                let ts = depth
                    .get("updated_at")
                    .and_then(util::json_ts_ms)
                    .unwrap_or_else(util::now_ms);

                let frame = BookFrame {
                    native_symbol: market.to_string(),
                    bids: Self::levels(depth.get("bids")),
                    asks: Self::levels(depth.get("asks")),
                    first_seq: None,
                    last_seq: ts as u64,
                    prev_seq: None,
                    timestamp: ts,
                };
                if is_full {
                    vec![ParsedFrame::Snapshot(frame)]
                } else {
                    vec![ParsedFrame::Delta(frame)]
                }
            }

            "deals.update" => {
                let Some(market) = data.get("market").and_then(|m| m.as_str()) else {
                    return vec![ParsedFrame::Malformed("deals.update without market".into())];
                };
                let Some(rows) = data.get("deal_list").and_then(|d| d.as_array()) else {
                    return vec![ParsedFrame::Malformed("deals.update without list".into())];
                };
                rows.iter()
                    .filter_map(|t| {
                        Some(ParsedFrame::Trade(TradeFrame {
                            native_symbol: market.to_string(),
                            price: t.get("price").and_then(util::json_f64)?,
                            quantity: t.get("amount").and_then(util::json_f64)?,
                            side: t
                                .get("side")
                                .and_then(|s| s.as_str())
                                .unwrap_or("")
                                .to_lowercase(),
                            timestamp: t
                                .get("created_at")
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
                "method": "server.ping",
                "params": {},
                "id": util::now_ms()
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_incremental_depth() {
        let c = CoinexConnector::new();
        let full = r#"{
            "method":"depth.update",
            "data":{"market":"BTCUSDT","is_full":true,
                    "depth":{"asks":[["60000.5","1.2"]],"bids":[["60000.0","0.7"]],
                             "last":"60000.2","updated_at":1700000000000,"checksum":123}},
            "id":null
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(full)[0] else {
            panic!()
        };
        assert_eq!(s.native_symbol, "BTCUSDT");
        assert_eq!(s.last_seq, 1700000000000);

        let incr = r#"{
            "method":"depth.update",
            "data":{"market":"BTCUSDT","is_full":false,
                    "depth":{"asks":[],"bids":[["60000.0","0"]],"updated_at":1700000000100}},
            "id":null
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(incr)[0] else {
            panic!()
        };
        assert_eq!(d.bids[0].quantity, 0.0);
    }

    #[test]
    fn deals_update() {
        let c = CoinexConnector::new();
        let raw = r#"{
            "method":"deals.update",
            "data":{"market":"ETHUSDT","deal_list":[
                {"deal_id":101,"created_at":1700000000000,"side":"sell","price":"3000.1","amount":"2.5"}
            ]},
            "id":null
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.side, "sell");
        assert_eq!(t.quantity, 2.5);
    }

    #[test]
    fn rpc_ack_and_pong() {
        let c = CoinexConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"id":1,"code":0,"message":"OK","data":{}}"#)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));
        assert!(matches!(
            c.parse_frame(r#"{"id":2,"code":0,"message":"OK","data":{"result":"pong"}}"#)[0],
            ParsedFrame::Pong
        ));
    }
}
