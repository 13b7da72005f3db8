use std::time::Duration;

use serde_json::{Value, json};

use crate::config::Credentials;
use crate::connectors::connector::{
    BookFrame, Compression, ExchangeConnector, ParsedFrame, TradeFrame, WireProfile,
};
use crate::connectors::rest::RestClient;
use crate::error::{IngestError, Result};
use crate::normalizer::canonicalize;
use crate::schema::{ExchangeId, FundingRate, Instrument, InstrumentKind, PriceTicker};
use crate::util;

const REST_BASE: &str = "https://fapi.binance.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://fstream.binance.com/ws",
    // Binance sends protocol pings itself; ours just keep middleboxes
    // from idling the connection out.
    ping_interval: Duration::from_secs(30),
    compression: Compression::None,
    max_subs_per_frame: 50,
    rest_seed: true,
};

/// Binance USDⓈ-M futures connector
///
/// REST: https://developers.binance.com/docs/derivatives/usds-margined-futures
/// WS:   diff. book depth with `U`/`u`/`pu` continuity; streams must be
///       seeded from the REST depth endpoint.
pub struct BinanceConnector {
    rest: RestClient,
}

impl BinanceConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Binance),
        }
    }

    fn parse_levels(raw: Option<&Value>) -> Vec<crate::schema::PriceLevel> {
        raw.and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(util::json_level)
                    .map(|(p, q)| crate::schema::PriceLevel::new(p, q))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for BinanceConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for BinanceConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/fapi/v1/exchangeInfo"))
            .await?;

        let symbols = body
            .get("symbols")
            .and_then(|s| s.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "exchangeInfo missing symbols"))?;

        let mut out = Vec::new();
        for s in symbols {
            let status = s.get("status").and_then(|v| v.as_str()).unwrap_or("");
            let contract_type = s
                .get("contractType")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if status != "TRADING" || contract_type != "PERPETUAL" {
                continue;
            }

            let native = match s.get("symbol").and_then(|v| v.as_str()) {
                Some(sym) => sym.to_string(),
                None => continue,
            };
            let base = s
                .get("baseAsset")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let quote = s
                .get("quoteAsset")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            // Tick / lot / notional live in the filter list
            let mut tick_size = 0.0;
            let mut lot_size = 0.0;
            let mut min_notional = 0.0;
            if let Some(filters) = s.get("filters").and_then(|v| v.as_array()) {
                for f in filters {
                    match f.get("filterType").and_then(|v| v.as_str()) {
                        Some("PRICE_FILTER") => {
                            tick_size = f.get("tickSize").and_then(util::json_f64).unwrap_or(0.0);
                        }
                        Some("LOT_SIZE") => {
                            lot_size = f.get("stepSize").and_then(util::json_f64).unwrap_or(0.0);
                        }
                        Some("MIN_NOTIONAL") => {
                            min_notional =
                                f.get("notional").and_then(util::json_f64).unwrap_or(0.0);
                        }
                        _ => {}
                    }
                }
            }

            out.push(Instrument {
                exchange: self.id(),
                canonical: canonicalize(&base.to_uppercase()),
                native_symbol: native,
                base_asset: base,
                quote_asset: quote,
                kind: InstrumentKind::Perpetual,
                // Quantities are in coins on binance futures
                contract_size: 1.0,
                tick_size,
                lot_size,
                min_notional,
                // Fee schedule is account-scoped; VIP0 defaults
                maker_fee: 0.0002,
                taker_fee: 0.0005,
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        // Depth limit must be one of the documented buckets
        let limit = [5usize, 10, 20, 50, 100, 500, 1000]
            .into_iter()
            .find(|l| *l >= depth)
            .unwrap_or(1000);

        let body = self
            .rest
            .get_json(&format!(
                "{REST_BASE}/fapi/v1/depth?symbol={native_symbol}&limit={limit}"
            ))
            .await?;

        let last_update_id = body
            .get("lastUpdateId")
            .and_then(util::json_u64)
            .ok_or_else(|| IngestError::protocol(self.id(), "depth missing lastUpdateId"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::parse_levels(body.get("bids")),
            asks: Self::parse_levels(body.get("asks")),
            first_seq: None,
            last_seq: last_update_id,
            prev_seq: None,
            timestamp: body
                .get("T")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        // premiumIndex without a symbol returns the whole venue
        let body = self
            .rest
            .get_json(&format!("{REST_BASE}/fapi/v1/premiumIndex"))
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| IngestError::protocol(self.id(), "premiumIndex not an array"))?;

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
        let book = self
            .rest
            .get_json(&format!("{REST_BASE}/fapi/v1/ticker/bookTicker"))
            .await?;
        let daily = self
            .rest
            .get_json(&format!("{REST_BASE}/fapi/v1/ticker/24hr"))
            .await?;

        // 24h quote volume joined onto the book ticker by symbol
        let mut volumes = std::collections::HashMap::new();
        if let Some(rows) = daily.as_array() {
            for r in rows {
                if let (Some(sym), Some(vol)) = (
                    r.get("symbol").and_then(|v| v.as_str()),
                    r.get("quoteVolume").and_then(util::json_f64),
                ) {
                    volumes.insert(sym.to_string(), vol);
                }
            }
        }

        let rows = book
            .as_array()
            .ok_or_else(|| IngestError::protocol(self.id(), "bookTicker not an array"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let symbol = r.get("symbol")?.as_str()?.to_string();
                Some(PriceTicker {
                    exchange: self.id(),
                    bid: r.get("bidPrice").and_then(util::json_f64),
                    ask: r.get("askPrice").and_then(util::json_f64),
                    last: None,
                    volume_24h: volumes.get(&symbol).copied(),
                    timestamp: r
                        .get("time")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                    native_symbol: symbol,
                })
            })
            .collect())
    }

    fn subscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        let params: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                [format!("{lower}@depth@100ms"), format!("{lower}@aggTrade")]
            })
            .collect();

        vec![
            json!({
                "method": "SUBSCRIBE",
                "params": params,
                "id": util::now_ms()
            })
            .to_string(),
        ]
    }

    fn unsubscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        let params: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                [format!("{lower}@depth@100ms"), format!("{lower}@aggTrade")]
            })
            .collect();

        vec![
            json!({
                "method": "UNSUBSCRIBE",
                "params": params,
                "id": util::now_ms()
            })
            .to_string(),
        ]
    }

    fn login_frame(&self, _creds: &Credentials) -> Option<String> {
        // Public market data needs no auth; the user-data stream uses a
        // REST listenKey flow outside this process.
        None
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        // Method acks: { "result": null, "id": 123 }
        if v.get("result").is_some() || v.get("id").is_some() {
            return vec![ParsedFrame::SubAck {
                ok: v.get("error").is_none(),
                detail: v.get("error").map(|e| e.to_string()),
            }];
        }

        // Combined-stream wrapper
        let data = v.get("data").unwrap_or(&v);

        match data.get("e").and_then(|e| e.as_str()) {
            Some("depthUpdate") => {
                let Some(symbol) = data.get("s").and_then(|s| s.as_str()) else {
                    return vec![ParsedFrame::Malformed("depthUpdate without s".into())];
                };
                let (Some(first), Some(last)) = (
                    data.get("U").and_then(util::json_u64),
                    data.get("u").and_then(util::json_u64),
                ) else {
                    return vec![ParsedFrame::Malformed("depthUpdate without U/u".into())];
                };

                vec![ParsedFrame::Delta(BookFrame {
                    native_symbol: symbol.to_string(),
                    bids: Self::parse_levels(data.get("b")),
                    asks: Self::parse_levels(data.get("a")),
                    first_seq: Some(first),
                    last_seq: last,
                    // Futures continuity: pu must equal the previous u
                    prev_seq: data.get("pu").and_then(util::json_u64),
                    timestamp: data
                        .get("T")
                        .or_else(|| data.get("E"))
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            Some("aggTrade") => {
                let Some(symbol) = data.get("s").and_then(|s| s.as_str()) else {
                    return vec![ParsedFrame::Malformed("aggTrade without s".into())];
                };
                let price = data.get("p").and_then(util::json_f64).unwrap_or(0.0);
                let quantity = data.get("q").and_then(util::json_f64).unwrap_or(0.0);
                // m == true: buyer is maker, i.e. the taker sold
                let maker = data.get("m").and_then(|m| m.as_bool()).unwrap_or(false);

                vec![ParsedFrame::Trade(TradeFrame {
                    native_symbol: symbol.to_string(),
                    price,
                    quantity,
                    side: if maker { "sell" } else { "buy" }.to_string(),
                    timestamp: data
                        .get("T")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            Some(_) => vec![ParsedFrame::Control],
            None => vec![ParsedFrame::Control],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_depth_update() {
        let raw = r#"{
            "e":"depthUpdate","E":1700000001000,"T":1700000000995,
            "s":"BTCUSDT","U":100,"u":104,"pu":99,
            "b":[["60000.10","1.5"],["59999.90","0"]],
            "a":[["60000.20","2.0"]]
        }"#;

        let frames = BinanceConnector::new().parse_frame(raw);
        assert_eq!(frames.len(), 1);
        let ParsedFrame::Delta(frame) = &frames[0] else {
            panic!("expected delta, got {frames:?}");
        };
        assert_eq!(frame.native_symbol, "BTCUSDT");
        assert_eq!(frame.first_seq, Some(100));
        assert_eq!(frame.last_seq, 104);
        assert_eq!(frame.prev_seq, Some(99));
        assert_eq!(frame.bids.len(), 2);
        assert_eq!(frame.bids[1].quantity, 0.0); // deletion level kept as-is
        assert_eq!(frame.timestamp, 1700000000995);
    }

    #[test]
    fn parses_agg_trade_sides() {
        let buy = r#"{"e":"aggTrade","s":"ETHUSDT","p":"3000.5","q":"0.2","T":1700000000000,"m":false}"#;
        let sell = r#"{"e":"aggTrade","s":"ETHUSDT","p":"3000.4","q":"0.1","T":1700000000001,"m":true}"#;

        let c = BinanceConnector::new();
        let ParsedFrame::Trade(t) = &c.parse_frame(buy)[0] else {
            panic!()
        };
        assert_eq!(t.side, "buy");
        assert_eq!(t.price, 3000.5);

        let ParsedFrame::Trade(t) = &c.parse_frame(sell)[0] else {
            panic!()
        };
        assert_eq!(t.side, "sell");
    }

    #[test]
    fn ack_and_unknown_frames_are_not_market_data() {
        let c = BinanceConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"result":null,"id":314}"#)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));
        assert!(matches!(
            c.parse_frame(r#"{"e":"markPriceUpdate","s":"BTCUSDT"}"#)[0],
            ParsedFrame::Control
        ));
        assert!(matches!(
            c.parse_frame("not json")[0],
            ParsedFrame::Malformed(_)
        ));
    }

    #[test]
    fn subscribe_frame_shape() {
        let frames = BinanceConnector::new()
            .subscribe_frames(&["BTCUSDT".to_string(), "ETHUSDT".to_string()], 20);
        assert_eq!(frames.len(), 1);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        let params: Vec<&str> = v["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap())
            .collect();
        assert!(params.contains(&"btcusdt@depth@100ms"));
        assert!(params.contains(&"ethusdt@aggTrade"));
    }
}
