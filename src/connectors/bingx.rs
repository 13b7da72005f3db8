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

const REST_BASE: &str = "https://open-api.bingx.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://open-api-swap.bingx.com/swap-market",
    ping_interval: Duration::from_secs(25),
    // All frames arrive gzip-compressed, including the text "Ping"
    compression: Compression::Gzip,
    max_subs_per_frame: 1,
    rest_seed: false,
};

/// BingX perpetual-swap connector
///
/// The depth stream pushes the full top-N book on every tick, so each
/// push is a snapshot; there is no delta continuity to track. The
/// push timestamp doubles as the sequence id.
pub struct BingxConnector {
    rest: RestClient,
}

impl BingxConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Bingx),
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

    fn depth_bucket(depth: usize) -> usize {
        [5usize, 10, 20, 50, 100]
            .into_iter()
            .find(|d| *d >= depth)
            .unwrap_or(100)
    }
}

impl Default for BingxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for BingxConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bingx
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/openApi/swap/v2/quote/contracts"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contracts missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            // status 1 = online
            if s.get("status").and_then(|v| v.as_i64()) != Some(1) {
                continue;
            }
            let Some(native) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s.get("asset").and_then(|v| v.as_str()).unwrap_or("");

            let price_precision = s
                .get("pricePrecision")
                .and_then(util::json_f64)
                .unwrap_or(2.0);

            out.push(Instrument {
                exchange: self.id(),
                native_symbol: native.to_string(),
                canonical: canonicalize(&base.to_uppercase()),
                base_asset: base.to_string(),
                quote_asset: s
                    .get("currency")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                kind: InstrumentKind::Perpetual,
                contract_size: s.get("size").and_then(util::json_f64).unwrap_or(1.0),
                tick_size: 10f64.powf(-price_precision),
                lot_size: s
                    .get("tradeMinLimit")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                min_notional: 0.0,
                maker_fee: s
                    .get("feeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0002),
                taker_fee: s
                    .get("feeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0005),
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let limit = Self::depth_bucket(depth);
        let body = self
            .rest
            .get_json_checked(
                &format!(
                    "{REST_BASE}/openApi/swap/v2/quote/depth?symbol={native_symbol}&limit={limit}"
                ),
                "code",
                "0",
            )
            .await?;

        let data = body
            .get("data")
            .ok_or_else(|| IngestError::protocol(self.id(), "depth missing data"))?;

        let ts = data
            .get("T")
            .and_then(util::json_ts_ms)
            .unwrap_or_else(util::now_ms);

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
        // premiumIndex without a symbol covers the venue
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/openApi/swap/v2/quote/premiumIndex"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "premiumIndex missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("symbol")?.as_str()?.to_string(),
                    rate: r.get("lastFundingRate").and_then(util::json_f64)?,
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
                &format!("{REST_BASE}/openApi/swap/v2/quote/ticker"),
                "code",
                "0",
            )
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
                    native_symbol: t.get("symbol")?.as_str()?.to_string(),
                    bid: t.get("bidPrice").and_then(util::json_f64),
                    ask: t.get("askPrice").and_then(util::json_f64),
                    last: t.get("lastPrice").and_then(util::json_f64),
                    volume_24h: t.get("quoteVolume").and_then(util::json_f64),
                    timestamp: t
                        .get("time")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        let bucket = Self::depth_bucket(depth);
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "id": format!("{}-{s}-depth", util::now_ms()),
                        "reqType": "sub",
                        "dataType": format!("{s}@depth{bucket}@100ms")
                    })
                    .to_string(),
                    json!({
                        "id": format!("{}-{s}-trade", util::now_ms()),
                        "reqType": "sub",
                        "dataType": format!("{s}@trade")
                    })
                    .to_string(),
                ]
            })
            .collect()
    }

    fn unsubscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        let bucket = Self::depth_bucket(depth);
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({
                        "id": format!("{}-{s}-depth", util::now_ms()),
                        "reqType": "unsub",
                        "dataType": format!("{s}@depth{bucket}@100ms")
                    })
                    .to_string(),
                    json!({
                        "id": format!("{}-{s}-trade", util::now_ms()),
                        "reqType": "unsub",
                        "dataType": format!("{s}@trade")
                    })
                    .to_string(),
                ]
            })
            .collect()
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        // Keepalive is a bare text token, not JSON
        if raw == "Ping" {
            return vec![ParsedFrame::Ping(None)];
        }
        if raw == "Pong" {
            return vec![ParsedFrame::Pong];
        }

        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        // Subscription ack: {"id":"...","code":0,"msg":""}
        if v.get("id").is_some() && v.get("dataType").is_none() {
            let ok = v.get("code").and_then(|c| c.as_i64()) == Some(0);
            return vec![ParsedFrame::SubAck {
                ok,
                detail: v.get("msg").and_then(|m| m.as_str()).map(String::from),
            }];
        }

        let data_type = v.get("dataType").and_then(|d| d.as_str()).unwrap_or("");
        let Some((symbol, kind)) = data_type.split_once('@') else {
            return vec![ParsedFrame::Control];
        };

        if kind.starts_with("depth") {
            let Some(data) = v.get("data") else {
                return vec![ParsedFrame::Malformed("depth push without data".into())];
            };
            let ts = v
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms);

            // Full top-N book on every push
            return vec![ParsedFrame::Snapshot(BookFrame {
                native_symbol: symbol.to_string(),
                bids: Self::levels(data.get("bids")),
                asks: Self::levels(data.get("asks")),
                first_seq: None,
                last_seq: ts as u64,
                prev_seq: None,
                timestamp: ts,
            })];
        }

        if kind == "trade" {
            let Some(rows) = v.get("data").and_then(|d| d.as_array()) else {
                return vec![ParsedFrame::Malformed("trade push without data".into())];
            };
            return rows
                .iter()
                .filter_map(|t| {
                    let maker = t.get("m").and_then(|m| m.as_bool()).unwrap_or(false);
                    Some(ParsedFrame::Trade(TradeFrame {
                        native_symbol: symbol.to_string(),
                        price: t.get("p").and_then(util::json_f64)?,
                        quantity: t.get("q").and_then(util::json_f64)?,
                        side: if maker { "sell" } else { "buy" }.to_string(),
                        timestamp: t
                            .get("T")
                            .and_then(util::json_ts_ms)
                            .unwrap_or_else(util::now_ms),
                    }))
                })
                .collect();
        }

        vec![ParsedFrame::Control]
    }

    fn pong_frame(&self, _payload: Option<&str>) -> Option<String> {
        Some("Pong".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_push_is_a_snapshot() {
        let c = BingxConnector::new();
        let raw = r#"{
            "code":0,"dataType":"BTC-USDT@depth20@100ms","ts":1700000000000,
            "data":{"bids":[["60000.0","1.2"]],"asks":[["60000.5","0.9"]]}
        }"#;
        let ParsedFrame::Snapshot(s) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(s.native_symbol, "BTC-USDT");
        assert_eq!(s.last_seq, 1700000000000);
        assert_eq!(s.bids[0].price, 60000.0);
    }

    #[test]
    fn text_ping_is_echoed_as_pong() {
        let c = BingxConnector::new();
        assert!(matches!(c.parse_frame("Ping")[0], ParsedFrame::Ping(None)));
        assert_eq!(c.pong_frame(None), Some("Pong".to_string()));
    }

    #[test]
    fn trade_push() {
        let c = BingxConnector::new();
        let raw = r#"{
            "code":0,"dataType":"ETH-USDT@trade","ts":1700000000000,
            "data":[{"q":"0.21","p":"3000.31","T":1700000000001,"m":true,"s":"ETH-USDT"}]
        }"#;
        let ParsedFrame::Trade(t) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(t.side, "sell");
        assert_eq!(t.price, 3000.31);
    }

    #[test]
    fn sub_ack() {
        let c = BingxConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"id":"123-BTC-USDT-depth","code":0,"msg":""}"#)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));
    }
}
