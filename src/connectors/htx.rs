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

const REST_BASE: &str = "https://api.hbdm.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://api.hbdm.com/linear-swap-ws",
    ping_interval: Duration::from_secs(5),
    // Every frame is gzip-compressed, including pings
    compression: Compression::Gzip,
    max_subs_per_frame: 1,
    rest_seed: false,
};

/// HTX (Huobi) USDT linear-swap connector
///
/// The step0 depth channel pushes the full merged book on every tick
/// (no deltas); the tick version doubles as the sequence id. The
/// server drives keepalive with `{"ping": ts}` which must be echoed
/// as `{"pong": ts}`.
pub struct HtxConnector {
    rest: RestClient,
}

impl HtxConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Htx),
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

    fn status_ok(&self, body: &Value, what: &str) -> Result<()> {
        if body.get("status").and_then(|s| s.as_str()) == Some("ok") {
            Ok(())
        } else {
            Err(IngestError::protocol(
                self.id(),
                format!("{what} returned status {:?}", body.get("status")),
            ))
        }
    }
}

impl Default for HtxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for HtxConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Htx
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/linear-swap-api/v1/swap_contract_info"))
            .await?;
        self.status_ok(&body, "swap_contract_info")?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contract_info missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            // contract_status 1 = trading
            if s.get("contract_status").and_then(|v| v.as_i64()) != Some(1) {
                continue;
            }
            if s.get("business_type").and_then(|v| v.as_str()) == Some("futures") {
                continue;
            }
            let Some(native) = s.get("contract_code").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s.get("symbol").and_then(|v| v.as_str()).unwrap_or("");

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                // Linear swaps settle in USDT
                quote_asset: "USDT".to_string(),
                kind: InstrumentKind::Perpetual,
                contract_size: s
                    .get("contract_size")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                tick_size: s.get("price_tick").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: 1.0,
                min_notional: 0.0,
                maker_fee: 0.0002,
                taker_fee: 0.0005,
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, _depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/linear-swap-ex/market/depth?contract_code={native_symbol}&type=step0"
            ))
            .await?;
        self.status_ok(&body, "depth")?;

        let tick = body
            .get("tick")
            .ok_or_else(|| IngestError::protocol(self.id(), "depth missing tick"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(tick.get("bids")),
            asks: Self::levels(tick.get("asks")),
            first_seq: None,
            last_seq: tick.get("version").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: tick
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/linear-swap-api/v1/swap_batch_funding_rate"
            ))
            .await?;
        self.status_ok(&body, "swap_batch_funding_rate")?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "funding missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("contract_code")?.as_str()?.to_string(),
                    rate: r.get("funding_rate").and_then(util::json_f64)?,
                    next_funding_time: r.get("funding_time").and_then(util::json_ts_ms),
                    interval_hours: 8.0,
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/v2/linear-swap-ex/market/detail/batch_merged"
            ))
            .await?;
        self.status_ok(&body, "batch_merged")?;

        let rows = body
            .get("ticks")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "batch_merged missing ticks"))?;

        Ok(rows
            .iter()
            .filter_map(|t| {
                // bid/ask are [price, size] pairs
                let bid = t
                    .get("bid")
                    .and_then(|b| b.as_array())
                    .and_then(|b| b.first())
                    .and_then(util::json_f64);
                let ask = t
                    .get("ask")
                    .and_then(|a| a.as_array())
                    .and_then(|a| a.first())
                    .and_then(util::json_f64);

                Some(PriceTicker {
                    exchange: self.id(),
                    native_symbol: t.get("contract_code")?.as_str()?.to_string(),
                    bid,
                    ask,
                    last: t.get("close").and_then(util::json_f64),
                    volume_24h: t.get("trade_turnover").and_then(util::json_f64),
                    timestamp: t
                        .get("ts")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
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
                        "sub": format!("market.{s}.depth.step0"),
                        "id": util::now_ms().to_string()
                    })
                    .to_string(),
                    json!({
                        "sub": format!("market.{s}.trade.detail"),
                        "id": util::now_ms().to_string()
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
                        "unsub": format!("market.{s}.depth.step0"),
                        "id": util::now_ms().to_string()
                    })
                    .to_string(),
                    json!({
                        "unsub": format!("market.{s}.trade.detail"),
                        "id": util::now_ms().to_string()
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

        // Server-driven keepalive: {"ping": 1700000000000}
        if let Some(ts) = v.get("ping") {
            return vec![ParsedFrame::Ping(Some(ts.to_string()))];
        }
        if v.get("pong").is_some() {
            return vec![ParsedFrame::Pong];
        }

        if let Some(subbed) = v.get("subbed") {
            let ok = v.get("status").and_then(|s| s.as_str()) == Some("ok");
            return vec![ParsedFrame::SubAck {
                ok,
                detail: Some(subbed.to_string()),
            }];
        }

        let Some(ch) = v.get("ch").and_then(|c| c.as_str()) else {
            return vec![ParsedFrame::Control];
        };
        let Some(tick) = v.get("tick") else {
            return vec![ParsedFrame::Control];
        };

        // Channel: market.{code}.depth.step0 / market.{code}.trade.detail
        let mut parts = ch.split('.');
        let (Some("market"), Some(code), Some(kind)) = (parts.next(), parts.next(), parts.next())
        else {
            return vec![ParsedFrame::Control];
        };

        match kind {
            "depth" => {
                // Full merged book per push
                vec![ParsedFrame::Snapshot(BookFrame {
                    native_symbol: code.to_string(),
                    bids: Self::levels(tick.get("bids")),
                    asks: Self::levels(tick.get("asks")),
                    first_seq: None,
                    last_seq: tick.get("version").and_then(util::json_u64).unwrap_or(0),
                    prev_seq: None,
                    timestamp: tick
                        .get("ts")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            "trade" => {
                let Some(rows) = tick.get("data").and_then(|d| d.as_array()) else {
                    return vec![ParsedFrame::Malformed("trade.detail without data".into())];
                };
                rows.iter()
                    .filter_map(|t| {
                        Some(ParsedFrame::Trade(TradeFrame {
                            native_symbol: code.to_string(),
                            price: t.get("price").and_then(util::json_f64)?,
                            quantity: t.get("amount").and_then(util::json_f64)?,
                            side: t
                                .get("direction")
                                .and_then(|d| d.as_str())
                                .unwrap_or("")
                                .to_lowercase(),
                            timestamp: t
                                .get("ts")
                                .and_then(util::json_ts_ms)
                                .unwrap_or_else(util::now_ms),
                        }))
                    })
                    .collect()
            }

            _ => vec![ParsedFrame::Control],
        }
    }

    /// Echo the server's ping timestamp back.
    fn pong_frame(&self, payload: Option<&str>) -> Option<String> {
        let ts = payload.unwrap_or("0");
        Some(format!("{{\"pong\":{ts}}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_push_is_full_snapshot() {
        let c = HtxConnector::new();
        let raw = r#"{
            "ch":"market.BTC-USDT.depth.step0","ts":1700000000000,
            "tick":{"mrid":84123,"id":1700000000,"bids":[[59999.9,120]],"asks":[[60000.1,80]],
                    "ts":1700000000000,"version":1700000000,"ch":"market.BTC-USDT.depth.step0"}
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(s.native_symbol, "BTC-USDT");
        assert_eq!(s.bids[0].price, 59999.9);
        assert_eq!(s.last_seq, 1700000000);
    }

    #[test]
    fn ping_echo() {
        let c = HtxConnector::new();
        let frames = c.parse_frame(r#"{"ping":1700000000123}"#);
        let ParsedFrame::Ping(Some(payload)) = &frames[0] else {
            panic!()
        };
        assert_eq!(payload, "1700000000123");
        assert_eq!(
            c.pong_frame(Some(payload)),
            Some("{\"pong\":1700000000123}".to_string())
        );
    }

    #[test]
    fn trade_detail() {
        let c = HtxConnector::new();
        let raw = r#"{
            "ch":"market.ETH-USDT.trade.detail","ts":1700000000000,
            "tick":{"id":100,"ts":1700000000000,
                    "data":[{"amount":6,"ts":1700000000000,"id":1001,"price":3000.2,"direction":"buy"}]}
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.quantity, 6.0);
        assert_eq!(t.side, "buy");
    }

    #[test]
    fn subbed_ack() {
        let c = HtxConnector::new();
        let raw = r#"{"id":"1","status":"ok","subbed":"market.BTC-USDT.depth.step0","ts":1700000000000}"#;
        assert!(matches!(
            c.parse_frame(raw)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));
    }
}
