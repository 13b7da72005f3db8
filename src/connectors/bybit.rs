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

const REST_BASE: &str = "https://api.bybit.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://stream.bybit.com/v5/public/linear",
    ping_interval: Duration::from_secs(20),
    compression: Compression::None,
    max_subs_per_frame: 10,
    rest_seed: false,
};

/// Bybit v5 linear-perpetual connector
///
/// The `orderbook.{depth}` topic pushes an initial snapshot followed by
/// deltas with a consecutive update id; a gap means resubscribe, which
/// yields a fresh snapshot.
pub struct BybitConnector {
    rest: RestClient,
}

impl BybitConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Bybit),
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

    /// Depth bucket accepted by the orderbook topic.
    fn depth_bucket(depth: usize) -> usize {
        [1usize, 50, 200, 500]
            .into_iter()
            .find(|d| *d >= depth)
            .unwrap_or(500)
    }

    async fn tickers(&self) -> Result<Vec<Value>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/v5/market/tickers?category=linear"),
                "retCode",
                "0",
            )
            .await?;
        body.pointer("/result/list")
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| IngestError::protocol(self.id(), "tickers missing result.list"))
    }
}

impl Default for BybitConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for BybitConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/v5/market/instruments-info?category=linear&limit=1000"),
                "retCode",
                "0",
            )
            .await?;

        let list = body
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "instruments missing result.list"))?;

        let mut out = Vec::new();
        for s in list {
            let status = s.get("status").and_then(|v| v.as_str()).unwrap_or("");
            let contract = s.get("contractType").and_then(|v| v.as_str()).unwrap_or("");
            if status != "Trading" || contract != "LinearPerpetual" {
                continue;
            }
            let Some(native) = s.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let base = s.get("baseCoin").and_then(|v| v.as_str()).unwrap_or("");

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
                contract_size: 1.0,
                tick_size: s
                    .pointer("/priceFilter/tickSize")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                lot_size: s
                    .pointer("/lotSizeFilter/qtyStep")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                min_notional: s
                    .pointer("/lotSizeFilter/minNotionalValue")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                maker_fee: 0.0002,
                taker_fee: 0.00055,
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
                    "{REST_BASE}/v5/market/orderbook?category=linear&symbol={native_symbol}&limit={limit}"
                ),
                "retCode",
                "0",
            )
            .await?;

        let result = body
            .get("result")
            .ok_or_else(|| IngestError::protocol(self.id(), "orderbook missing result"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(result.get("b")),
            asks: Self::levels(result.get("a")),
            first_seq: None,
            last_seq: result.get("u").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: result
                .get("ts")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // The venue-wide ticker list already carries funding; one call
        // instead of one per symbol.
        Ok(self
            .tickers()
            .await?
            .iter()
            .filter_map(|t| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: t.get("symbol")?.as_str()?.to_string(),
                    rate: t.get("fundingRate").and_then(util::json_f64)?,
                    next_funding_time: t.get("nextFundingTime").and_then(util::json_ts_ms),
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
                    bid: t.get("bid1Price").and_then(util::json_f64),
                    ask: t.get("ask1Price").and_then(util::json_f64),
                    last: t.get("lastPrice").and_then(util::json_f64),
                    volume_24h: t.get("turnover24h").and_then(util::json_f64),
                    timestamp: util::now_ms(),
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        let bucket = Self::depth_bucket(depth);
        let args: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                [
                    format!("orderbook.{bucket}.{s}"),
                    format!("publicTrade.{s}"),
                ]
            })
            .collect();
        vec![json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn unsubscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String> {
        let bucket = Self::depth_bucket(depth);
        let args: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                [
                    format!("orderbook.{bucket}.{s}"),
                    format!("publicTrade.{s}"),
                ]
            })
            .collect();
        vec![json!({"op": "unsubscribe", "args": args}).to_string()]
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        // Op replies: pong / subscribe ack
        if let Some(op) = v.get("op").and_then(|o| o.as_str()) {
            return match op {
                "pong" | "ping" => vec![ParsedFrame::Pong],
                "subscribe" | "unsubscribe" => vec![ParsedFrame::SubAck {
                    ok: v.get("success").and_then(|s| s.as_bool()).unwrap_or(false),
                    detail: v.get("ret_msg").and_then(|m| m.as_str()).map(String::from),
                }],
                _ => vec![ParsedFrame::Control],
            };
        }
        if v.get("ret_msg").and_then(|m| m.as_str()) == Some("pong") {
            return vec![ParsedFrame::Pong];
        }

        let Some(topic) = v.get("topic").and_then(|t| t.as_str()) else {
            return vec![ParsedFrame::Control];
        };

        if topic.starts_with("orderbook.") {
            let Some(data) = v.get("data") else {
                return vec![ParsedFrame::Malformed("orderbook without data".into())];
            };
            let Some(symbol) = data.get("s").and_then(|s| s.as_str()) else {
                return vec![ParsedFrame::Malformed("orderbook without s".into())];
            };
            let seq = data.get("u").and_then(util::json_u64).unwrap_or(0);
            let frame = BookFrame {
                native_symbol: symbol.to_string(),
                bids: Self::levels(data.get("b")),
                asks: Self::levels(data.get("a")),
                first_seq: Some(seq),
                last_seq: seq,
                prev_seq: None,
                timestamp: v
                    .get("ts")
                    .and_then(util::json_ts_ms)
                    .unwrap_or_else(util::now_ms),
            };

            // u == 1 marks a service-restart snapshot regardless of type
            let is_snapshot =
                v.get("type").and_then(|t| t.as_str()) == Some("snapshot") || seq == 1;
            return if is_snapshot {
                vec![ParsedFrame::Snapshot(frame)]
            } else {
                vec![ParsedFrame::Delta(frame)]
            };
        }

        if topic.starts_with("publicTrade.") {
            let Some(rows) = v.get("data").and_then(|d| d.as_array()) else {
                return vec![ParsedFrame::Malformed("publicTrade without data".into())];
            };
            return rows
                .iter()
                .filter_map(|t| {
                    Some(ParsedFrame::Trade(TradeFrame {
                        native_symbol: t.get("s")?.as_str()?.to_string(),
                        price: t.get("p").and_then(util::json_f64)?,
                        quantity: t.get("v").and_then(util::json_f64)?,
                        side: t
                            .get("S")
                            .and_then(|s| s.as_str())
                            .unwrap_or("")
                            .to_lowercase(),
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

    fn app_ping_frame(&self) -> Option<String> {
        Some(json!({"op": "ping"}).to_string())
    }
}
