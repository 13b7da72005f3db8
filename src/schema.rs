use serde::{Deserialize, Serialize};

// ------------------------------------------------------------
// Exchange identifiers
// ------------------------------------------------------------
//
// Closed set of supported venues. Adding a venue requires:
// - A connector implementation under src/connectors/
// - A registry entry in connectors::get_connector
// - A native-symbol convention in the normalizer
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
    Kucoin,
    Mexc,
    Bitget,
    Gateio,
    Bingx,
    Coinex,
    Lbank,
    Htx,
}

impl ExchangeId {
    /// Every supported venue, in registry order.
    pub const ALL: [ExchangeId; 11] = [
        ExchangeId::Binance,
        ExchangeId::Bybit,
        ExchangeId::Okx,
        ExchangeId::Kucoin,
        ExchangeId::Mexc,
        ExchangeId::Bitget,
        ExchangeId::Gateio,
        ExchangeId::Bingx,
        ExchangeId::Coinex,
        ExchangeId::Lbank,
        ExchangeId::Htx,
    ];

    /// Lowercase stable name, used in config, logging and bus channel keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
            ExchangeId::Kucoin => "kucoin",
            ExchangeId::Mexc => "mexc",
            ExchangeId::Bitget => "bitget",
            ExchangeId::Gateio => "gateio",
            ExchangeId::Bingx => "bingx",
            ExchangeId::Coinex => "coinex",
            ExchangeId::Lbank => "lbank",
            ExchangeId::Htx => "htx",
        }
    }

    /// Resolves a config-file name into an exchange id.
    pub fn from_name(name: &str) -> Option<ExchangeId> {
        ExchangeId::ALL
            .into_iter()
            .find(|e| e.as_str() == name.trim().to_lowercase())
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------
// Price level
// ------------------------------------------------------------
//
// A single (price, quantity) entry of one book side.
//
// IMPORTANT:
// - In incremental updates a quantity of 0 means "delete this price".
// - Books never store zero-quantity levels after apply.
//
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

// ------------------------------------------------------------
// Instruments
// ------------------------------------------------------------

/// Contract kind of a listed instrument.
///
/// Only `Perpetual` instruments quoted in a stable quote participate
/// in the cross-venue spread matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Perpetual,
    DatedFuture,
    Spot,
}

/// One tradable instrument on one venue.
///
/// Uniqueness:
/// - (exchange, native_symbol) is unique
/// - (exchange, canonical) is unique within the active set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: ExchangeId,

    /// Venue-native symbol, e.g. "BTCUSDT", "BTC-USDT-SWAP", "BTC_USDT"
    pub native_symbol: String,

    /// Venue-agnostic asset key after synonym folding, e.g. "BTC"
    pub canonical: String,

    pub base_asset: String,
    pub quote_asset: String,
    pub kind: InstrumentKind,

    /// Quote value of one contract unit; 1.0 for coin-sized venues.
    pub contract_size: f64,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_notional: f64,

    pub maker_fee: f64,
    pub taker_fee: f64,

    /// False once the venue delists or suspends the instrument.
    pub active: bool,
}

impl Instrument {
    /// True when the instrument may enter the spread matrix.
    pub fn spread_eligible(&self) -> bool {
        self.active
            && self.kind == InstrumentKind::Perpetual
            && matches!(self.quote_asset.as_str(), "USDT" | "USDC" | "USD")
    }
}

/// Current funding state of a perpetual instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: ExchangeId,
    pub native_symbol: String,

    /// Rate per funding interval, as a fraction (0.0001 = 1 bps).
    pub rate: f64,

    /// Unix ms of the next funding settlement, if the venue reports it.
    pub next_funding_time: Option<i64>,

    /// Funding interval in hours (8 for most venues).
    pub interval_hours: f64,
}

impl FundingRate {
    /// Funding expressed in basis points per day, used by spread scoring.
    pub fn bps_per_day(&self) -> f64 {
        if self.interval_hours <= 0.0 {
            return 0.0;
        }
        self.rate * 10_000.0 * (24.0 / self.interval_hours)
    }
}

/// REST top-of-book + 24h volume, used for bootstrap ranking and for
/// venues without a streaming ticker channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTicker {
    pub exchange: ExchangeId,
    pub native_symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    /// 24h turnover in quote units.
    pub volume_24h: Option<f64>,
    pub timestamp: i64,
}

// ------------------------------------------------------------
// Bus messages
// ------------------------------------------------------------
//
// Central message enum published on the redis bus. The `type` tag is
// added by serde and used for routing on the consumer side
// ("book", "trade", "spread", "summary", "error").
//
// DESIGN NOTES:
// - This enum is intentionally stable; any change here affects every
//   downstream consumer (UI gateway, execution service).
//
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusMessage {
    Book(BookUpdate),
    Trade(TradePrint),
    Spread(SpreadTick),
    Summary(SpreadSummary),
    Error(BusError),
}

/// Order book state for one (exchange, native symbol), published on
/// `orderbook:{exchange}:{native_symbol}`.
///
/// Carries the top-K depth prefix plus the derived top-of-book fields
/// so that consumers never recompute them.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BookUpdate {
    pub exchange_id: ExchangeId,

    /// Venue-native symbol
    pub symbol: String,

    /// Canonical asset key
    pub canonical: String,

    /// Bid levels, descending by price (best first)
    pub bids: Vec<PriceLevel>,

    /// Ask levels, ascending by price (best first)
    pub asks: Vec<PriceLevel>,

    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,

    /// (best_ask - best_bid) / best_bid * 1e4, when both sides present
    pub spread_bps: Option<f64>,

    /// Microsecond Unix timestamp of the update
    pub timestamp: i64,

    pub sequence_id: u64,

    /// True when this update fully replaced prior state
    pub is_snapshot: bool,
}

/// A single executed trade, published on `trades:{exchange}:{symbol}`.
///
/// Auxiliary output: nothing in the spread path depends on trades.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TradePrint {
    pub exchange: ExchangeId,
    pub symbol: String,
    pub canonical: String,
    pub price: f64,
    pub quantity: f64,
    /// "buy" or "sell", taker side
    pub side: String,
    pub timestamp: i64,
}

/// One row of the cross-venue spread matrix, published on
/// `spread:{canonical}` and `spread:{canonical}:{long}:{short}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpreadTick {
    /// "{canonical}:{long}:{short}"
    pub id: String,

    pub canonical: String,
    pub long_exchange: ExchangeId,
    pub short_exchange: ExchangeId,
    pub long_symbol: String,
    pub short_symbol: String,

    /// Best ask on the long venue (entry cost to go long)
    pub long_price: f64,

    /// Best bid on the short venue (entry proceeds to go short)
    pub short_price: f64,

    pub spread_percent: f64,
    pub spread_bps: f64,

    pub long_funding: f64,
    pub short_funding: f64,
    /// short_funding - long_funding
    pub net_funding: f64,

    pub long_depth_usd: f64,
    pub short_depth_usd: f64,
    pub min_depth_usd: f64,

    pub volume_24h: f64,

    /// Composite ranking score, see spread::score
    pub score: f64,

    /// Microsecond Unix timestamp
    pub updated_at: i64,
}

/// Periodic top-N digest published on `spreads:summary`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpreadSummary {
    pub generated_at: i64,
    pub top: Vec<SpreadTick>,
}

/// Machine-readable error surfaced to bus consumers.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusError {
    /// Stable code, see error::IngestError::code
    pub code: String,
    pub message: String,
    pub exchange: Option<ExchangeId>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_id_round_trip() {
        for e in ExchangeId::ALL {
            assert_eq!(ExchangeId::from_name(e.as_str()), Some(e));
            let json = serde_json::to_string(&e).unwrap();
            assert_eq!(json, format!("\"{}\"", e.as_str()));
        }
        assert_eq!(ExchangeId::from_name("ftx"), None);
    }

    #[test]
    fn bus_message_tagging() {
        let msg = BusMessage::Trade(TradePrint {
            exchange: ExchangeId::Gateio,
            symbol: "BTC_USDT".into(),
            canonical: "BTC".into(),
            price: 60000.0,
            quantity: 0.5,
            side: "buy".into(),
            timestamp: 1_700_000_000_000_000,
        });
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "trade");
        assert_eq!(v["exchange"], "gateio");
    }

    #[test]
    fn funding_bps_per_day() {
        let f = FundingRate {
            exchange: ExchangeId::Binance,
            native_symbol: "BTCUSDT".into(),
            rate: 0.0001,
            next_funding_time: None,
            interval_hours: 8.0,
        };
        // 1 bps per 8h interval => 3 bps per day
        assert!((f.bps_per_day() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn spread_eligibility() {
        let mut i = Instrument {
            exchange: ExchangeId::Okx,
            native_symbol: "BTC-USDT-SWAP".into(),
            canonical: "BTC".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            kind: InstrumentKind::Perpetual,
            contract_size: 0.01,
            tick_size: 0.1,
            lot_size: 1.0,
            min_notional: 5.0,
            maker_fee: 0.0002,
            taker_fee: 0.0005,
            active: true,
        };
        assert!(i.spread_eligible());
        i.quote_asset = "BTC".into();
        assert!(!i.spread_eligible());
    }
}
