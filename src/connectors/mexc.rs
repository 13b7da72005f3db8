use std::time::Duration;

use serde_json::{Value, json};

use crate::auth;
use crate::config::Credentials;
use crate::connectors::connector::{
    BookFrame, Compression, ExchangeConnector, ParsedFrame, TradeFrame, WireProfile,
};
use crate::connectors::rest::RestClient;
use crate::error::{IngestError, Result};
use crate::normalizer::canonicalize;
use crate::schema::{ExchangeId, FundingRate, Instrument, InstrumentKind, PriceLevel, PriceTicker};
use crate::util;

const REST_BASE: &str = "https://contract.mexc.com";

static WIRE: WireProfile = WireProfile {
    ws_url: "wss://contract.mexc.com/edge",
    ping_interval: Duration::from_secs(20),
    compression: Compression::None,
    max_subs_per_frame: 1,
    rest_seed: true,
};

/// MEXC contract (perpetual) connector
///
/// Depth levels arrive as [price, volume, order_count] triplets with a
/// monotone version; increments are seeded from the REST depth
/// endpoint.
pub struct MexcConnector {
    rest: RestClient,
}

impl MexcConnector {
    pub fn new() -> Self {
        Self {
            rest: RestClient::new(ExchangeId::Mexc),
        }
    }

    /// [price, volume, count] rows; count is ignored.
    fn levels(raw: Option<&Value>) -> Vec<PriceLevel> {
        raw.and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|row| {
                        let cells = row.as_array()?;
                        let price = util::json_f64(cells.first()?)?;
                        let qty = util::json_f64(cells.get(1)?)?;
                        Some(PriceLevel::new(price, qty))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MexcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExchangeConnector for MexcConnector {
    fn id(&self) -> ExchangeId {
        ExchangeId::Mexc
    }

    fn wire(&self) -> &WireProfile {
        &WIRE
    }

    async fn fetch_instruments(&self) -> Result<Vec<Instrument>> {
        let body = self
            .rest
            .get_json_checked(&format!("{REST_BASE}/api/v1/contract/detail"), "code", "0")
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "contract detail missing data"))?;

        let mut out = Vec::new();
        for s in rows {
            // state 0 = live trading
            if s.get("state").and_then(|v| v.as_i64()) != Some(0) {
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
                contract_size: s
                    .get("contractSize")
                    .and_then(util::json_f64)
                    .unwrap_or(1.0),
                tick_size: s.get("priceUnit").and_then(util::json_f64).unwrap_or(0.0),
                lot_size: s.get("volUnit").and_then(util::json_f64).unwrap_or(1.0),
                min_notional: 0.0,
                maker_fee: s
                    .get("makerFeeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0),
                taker_fee: s
                    .get("takerFeeRate")
                    .and_then(util::json_f64)
                    .unwrap_or(0.0002),
                active: true,
            });
        }
        Ok(out)
    }

    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize) -> Result<BookFrame> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/contract/depth/{native_symbol}?limit={depth}"),
                "code",
                "0",
            )
            .await?;

        let data = body
            .get("data")
            .ok_or_else(|| IngestError::protocol(self.id(), "depth missing data"))?;

        Ok(BookFrame {
            native_symbol: native_symbol.to_string(),
            bids: Self::levels(data.get("bids")),
            asks: Self::levels(data.get("asks")),
            first_seq: None,
            last_seq: data.get("version").and_then(util::json_u64).unwrap_or(0),
            prev_seq: None,
            timestamp: data
                .get("timestamp")
                .and_then(util::json_ts_ms)
                .unwrap_or_else(util::now_ms),
        })
    }

    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        let body = self
            .rest
            .get_json_checked(
                &format!("{REST_BASE}/api/v1/contract/funding_rate"),
                "code",
                "0",
            )
            .await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IngestError::protocol(self.id(), "funding_rate missing data"))?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(FundingRate {
                    exchange: self.id(),
                    native_symbol: r.get("symbol")?.as_str()?.to_string(),
                    rate: r.get("fundingRate").and_then(util::json_f64)?,
                    next_funding_time: r.get("nextSettleTime").and_then(util::json_ts_ms),
                    interval_hours: r
                        .get("collectCycle")
                        .and_then(util::json_f64)
                        .unwrap_or(8.0),
                })
            })
            .collect())
    }

    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>> {
        let body = self
            .rest
            .get_json_checked(&format!("{REST_BASE}/api/v1/contract/ticker"), "code", "0")
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
                    bid: t.get("bid1").and_then(util::json_f64),
                    ask: t.get("ask1").and_then(util::json_f64),
                    last: t.get("lastPrice").and_then(util::json_f64),
                    volume_24h: t.get("amount24").and_then(util::json_f64),
                    timestamp: t
                        .get("timestamp")
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
                    json!({"method": "sub.depth", "param": {"symbol": s}}).to_string(),
                    json!({"method": "sub.deal", "param": {"symbol": s}}).to_string(),
                ]
            })
            .collect()
    }

    fn unsubscribe_frames(&self, symbols: &[String], _depth: usize) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                [
                    json!({"method": "unsub.depth", "param": {"symbol": s}}).to_string(),
                    json!({"method": "unsub.deal", "param": {"symbol": s}}).to_string(),
                ]
            })
            .collect()
    }

    /// User-data login rides the same connection: HMAC-SHA256 over
    /// `apiKey + reqTime`, hex-encoded.
    fn login_frame(&self, creds: &Credentials) -> Option<String> {
        let req_time = util::now_ms().to_string();
        let signature = auth::sign_hex(
            &creds.api_secret,
            &format!("{}{}", creds.api_key, req_time),
        );
        Some(
            json!({
                "method": "login",
                "param": {
                    "apiKey": creds.api_key,
                    "reqTime": req_time,
                    "signature": signature
                }
            })
            .to_string(),
        )
    }

    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame> {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return vec![ParsedFrame::Malformed(e.to_string())],
        };

        let Some(channel) = v.get("channel").and_then(|c| c.as_str()) else {
            return vec![ParsedFrame::Control];
        };

        match channel {
            "pong" => vec![ParsedFrame::Pong],

            "rs.login" => vec![ParsedFrame::AuthAck {
                ok: v.get("data").and_then(|d| d.as_str()) == Some("success"),
                detail: v.get("data").map(|d| d.to_string()),
            }],

            c if c.starts_with("rs.sub") => vec![ParsedFrame::SubAck {
                ok: v.get("data").and_then(|d| d.as_str()) == Some("success"),
                detail: v.get("data").map(|d| d.to_string()),
            }],

            "rs.error" => vec![ParsedFrame::SubAck {
                ok: false,
                detail: v.get("data").map(|d| d.to_string()),
            }],

            "push.depth" => {
                let Some(symbol) = v.get("symbol").and_then(|s| s.as_str()) else {
                    return vec![ParsedFrame::Malformed("push.depth without symbol".into())];
                };
                let Some(data) = v.get("data") else {
                    return vec![ParsedFrame::Malformed("push.depth without data".into())];
                };
                let version = data.get("version").and_then(util::json_u64).unwrap_or(0);

                vec![ParsedFrame::Delta(BookFrame {
                    native_symbol: symbol.to_string(),
                    bids: Self::levels(data.get("bids")),
                    asks: Self::levels(data.get("asks")),
                    first_seq: Some(version),
                    last_seq: version,
                    prev_seq: None,
                    timestamp: v
                        .get("ts")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            "push.deal" => {
                let Some(symbol) = v.get("symbol").and_then(|s| s.as_str()) else {
                    return vec![ParsedFrame::Malformed("push.deal without symbol".into())];
                };
                let Some(data) = v.get("data") else {
                    return vec![ParsedFrame::Malformed("push.deal without data".into())];
                };
                // T: 1 = taker buy, 2 = taker sell
                let side = match data.get("T").and_then(|t| t.as_i64()) {
                    Some(1) => "buy",
                    Some(2) => "sell",
                    _ => "",
                };

                vec![ParsedFrame::Trade(TradeFrame {
                    native_symbol: symbol.to_string(),
                    price: data.get("p").and_then(util::json_f64).unwrap_or(0.0),
                    quantity: data.get("v").and_then(util::json_f64).unwrap_or(0.0),
                    side: side.to_string(),
                    timestamp: data
                        .get("t")
                        .and_then(util::json_ts_ms)
                        .unwrap_or_else(util::now_ms),
                })]
            }

            _ => vec![ParsedFrame::Control],
        }
    }

    fn app_ping_frame(&self) -> Option<String> {
        Some(json!({"method": "ping"}).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_depth_with_triplet_levels() {
        let c = MexcConnector::new();
        let raw = r#"{
            "channel":"push.depth","symbol":"BTC_USDT","ts":1700000000000,
            "data":{"bids":[[59999.5,1203,2]],"asks":[[60000.5,0,0]],"version":987654}
        }"#;
        let ParsedFrame::Delta(d) = &c.parse_frame(raw)[0] else {
            panic!()
        };
        assert_eq!(d.native_symbol, "BTC_USDT");
        assert_eq!(d.bids[0].price, 59999.5);
        assert_eq!(d.bids[0].quantity, 1203.0);
        assert_eq!(d.asks[0].quantity, 0.0);
        assert_eq!(d.first_seq, Some(987654));
    }

    #[test]
    fn deal_sides() {
        let c = MexcConnector::new();
        let buy = r#"{"channel":"push.deal","symbol":"BTC_USDT","data":{"p":60000.1,"v":12,"T":1,"t":1700000000000}}"#;
        let sell = r#"{"channel":"push.deal","symbol":"BTC_USDT","data":{"p":60000.0,"v":3,"T":2,"t":1700000000001}}"#;

        let ParsedFrame::Trade(t) = &c.parse_frame(buy)[0] else {
            panic!()
        };
        assert_eq!(t.side, "buy");
        let ParsedFrame::Trade(t) = &c.parse_frame(sell)[0] else {
            panic!()
        };
        assert_eq!(t.side, "sell");
    }

    #[test]
    fn login_frame_is_signed() {
        let c = MexcConnector::new();
        let creds = Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            passphrase: None,
        };
        let frame = c.login_frame(&creds).unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "login");
        assert_eq!(v["param"]["apiKey"], "key");
        let sig = v["param"]["signature"].as_str().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn login_rejection_is_an_auth_failure() {
        let c = MexcConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"channel":"rs.login","data":"signature invalid","ts":1}"#)[0],
            ParsedFrame::AuthAck { ok: false, .. }
        ));
    }

    #[test]
    fn sub_ack_and_pong() {
        let c = MexcConnector::new();
        assert!(matches!(
            c.parse_frame(r#"{"channel":"rs.sub.depth","data":"success","ts":1}"#)[0],
            ParsedFrame::SubAck { ok: true, .. }
        ));
        assert!(matches!(
            c.parse_frame(r#"{"channel":"pong","data":1700000000000,"ts":1700000000000}"#)[0],
            ParsedFrame::Pong
        ));
    }
}
