use std::time::Duration;

use crate::config::Credentials;
use crate::error::Result;
use crate::schema::{
    BookUpdate, ExchangeId, FundingRate, Instrument, PriceLevel, PriceTicker, TradePrint,
};

/// Frame compression negotiated by the venue.
///
/// Applied to binary WebSocket frames before JSON parsing; text frames
/// are always passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    /// zlib-wrapped deflate
    Deflate,
}

/// Static wire parameters of one venue.
///
/// Per-venue timing constants belong here, not in global tables: a
/// session owns exactly one profile for its whole lifetime.
#[derive(Debug, Clone)]
pub struct WireProfile {
    pub ws_url: &'static str,

    /// Application-level ping cadence. A session with no inbound
    /// traffic for 2x this interval is considered dead.
    pub ping_interval: Duration,

    pub compression: Compression,

    /// Maximum (channel, symbol) tuples per subscribe frame.
    pub max_subs_per_frame: usize,

    /// True when the venue's delta stream must be seeded with a REST
    /// depth snapshot (binance, gateio). Venues that push their own
    /// snapshot on subscribe leave this false.
    pub rest_seed: bool,
}

/// One parsed order-book event.
///
/// Continuity fields carry whichever scheme the venue uses; the book
/// checks the one that is present (see book::BookDelta).
#[derive(Debug, Clone, Default)]
pub struct BookFrame {
    pub native_symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub first_seq: Option<u64>,
    pub last_seq: u64,
    pub prev_seq: Option<u64>,
    /// Milliseconds
    pub timestamp: i64,
}

/// One parsed trade print (pre-normalization).
#[derive(Debug, Clone)]
pub struct TradeFrame {
    pub native_symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// "buy" or "sell", taker side
    pub side: String,
    /// Milliseconds
    pub timestamp: i64,
}

/// Tagged result of parsing one raw frame.
///
/// IMPORTANT:
/// - Parsing must NEVER panic; unparseable input becomes `Malformed`
///   and is counted + dropped by the session.
/// - Heartbeats, acks and unknown control messages are not errors.
#[derive(Debug, Clone)]
pub enum ParsedFrame {
    /// Full book replacement
    Snapshot(BookFrame),

    /// Incremental book update
    Delta(BookFrame),

    Trade(TradeFrame),

    Ticker(PriceTicker),

    /// Venue-originated ping; `Some` payload must be echoed back
    Ping(Option<String>),

    /// Venue answered our application ping
    Pong,

    SubAck { ok: bool, detail: Option<String> },

    AuthAck { ok: bool, detail: Option<String> },

    /// Anything recognized but uninteresting (info banners, acks of
    /// acks, empty keepalives)
    Control,

    /// Invalid JSON or a missing required field
    Malformed(String),
}

/// ExchangeConnector is the abstraction layer between:
/// - The generic session runtime (connect / ping / resubscribe / books)
/// - Exchange-specific REST and WebSocket APIs
///
/// Each venue implementation must:
/// - Expose the venue's REST bootstrap endpoints in the common shapes
/// - Build subscribe / unsubscribe / login frames
/// - Parse raw frames into the tagged `ParsedFrame` vocabulary
///
/// DESIGN GOALS:
/// - Zero exchange-specific logic outside connector modules
/// - One connector per venue, stateless where the venue allows it
/// - Uniform output vocabulary across all venues
///
/// THREAD SAFETY:
/// - Must be Send + Sync; one instance is shared by the session task
///   and the supervisor's periodic REST tasks.
#[async_trait::async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Canonical venue id. Must match the configuration name.
    fn id(&self) -> ExchangeId;

    /// Static wire parameters.
    fn wire(&self) -> &WireProfile;

    /// Resolves the WebSocket endpoint for a new session.
    ///
    /// Default: the static profile URL. Venues that hand out
    /// session-scoped endpoints (kucoin bullet token) override this
    /// with a REST call.
    async fn ws_endpoint(&self) -> Result<String> {
        Ok(self.wire().ws_url.to_string())
    }

    /// REST list of tradable perpetuals in a live trading state, with
    /// contract / tick / lot / fee metadata.
    async fn fetch_instruments(&self) -> Result<Vec<Instrument>>;

    /// REST depth snapshot used to seed or resynchronize a streaming
    /// book.
    async fn fetch_orderbook_snapshot(&self, native_symbol: &str, depth: usize)
    -> Result<BookFrame>;

    /// Venue-wide current funding. Implementations fetch without
    /// explicit symbol lists (URL-length limits).
    async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>>;

    /// Current top-of-book + 24h volume for all perpetuals.
    async fn fetch_price_tickers(&self) -> Result<Vec<PriceTicker>>;

    /// Subscribe frames for `symbols`, already chunked to the wire
    /// profile's `max_subs_per_frame` by the caller.
    fn subscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String>;

    fn unsubscribe_frames(&self, symbols: &[String], depth: usize) -> Vec<String>;

    /// Login frame for the user-data stream; `None` when the venue
    /// needs no auth for the subscribed channels.
    fn login_frame(&self, _creds: &Credentials) -> Option<String> {
        None
    }

    /// Parses one raw (already decompressed) frame. A single frame may
    /// carry several events (batched trades), hence the Vec.
    fn parse_frame(&self, raw: &str) -> Vec<ParsedFrame>;

    /// Application-level ping frame, sent on the profile's interval.
    /// `None` means the session sends protocol-level WebSocket pings.
    fn app_ping_frame(&self) -> Option<String> {
        None
    }

    /// Reply to a venue-originated `ParsedFrame::Ping`.
    fn pong_frame(&self, _payload: Option<&str>) -> Option<String> {
        None
    }
}

/// Observable session lifecycle, aggregated by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
    Reconnecting,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Subscribed => "subscribed",
            SessionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Event sink wired by the supervisor.
///
/// Sessions push normalized events here; the pipeline behind it writes
/// the book store, wakes the spread engine and feeds the publisher.
///
/// CONTRACT:
/// - Implementations must be non-blocking; sessions call these on the
///   hot read path.
pub trait MarketSink: Send + Sync {
    fn on_book(&self, update: BookUpdate);
    fn on_trade(&self, print: TradePrint);
    fn on_status(&self, exchange: ExchangeId, status: SessionStatus);
    fn on_error(&self, error: crate::error::IngestError);
}
