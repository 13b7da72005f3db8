//! End-to-end spread scenarios over the store + engine, with the
//! publisher in dry-run mode.

use std::sync::Arc;

use md_ingest::config::{BusConfig, ScoreWeights};
use md_ingest::normalizer::Normalizer;
use md_ingest::publisher::Publisher;
use md_ingest::schema::{ExchangeId, Instrument, InstrumentKind, PriceLevel};
use md_ingest::spread::{EngineConfig, SpreadEngine};
use md_ingest::store::{BookStore, BookTop};
use md_ingest::util;

fn engine_config() -> EngineConfig {
    EngineConfig {
        staleness_ms: 2_000,
        depth_quote_levels: 5,
        depth_cap_usd: 1_000_000.0,
        min_depth_usd: 100.0,
        throttle_ms: 100,
        summary_interval_ms: 500,
        summary_top: 20,
        weights: ScoreWeights::default(),
    }
}

fn dry_publisher() -> Publisher {
    Publisher::spawn(BusConfig {
        url: "redis://127.0.0.1:6379/0".into(),
        dry_run: true,
        stream_maxlen: 1_000,
        list_ttl_secs: 10,
        outbound_queue: 64,
    })
}

fn perp(exchange: ExchangeId, native: &str, canonical: &str) -> Instrument {
    Instrument {
        exchange,
        native_symbol: native.to_string(),
        canonical: canonical.to_string(),
        base_asset: canonical.to_string(),
        quote_asset: "USDT".to_string(),
        kind: InstrumentKind::Perpetual,
        contract_size: 1.0,
        tick_size: 0.1,
        lot_size: 0.001,
        min_notional: 5.0,
        maker_fee: 0.0002,
        taker_fee: 0.0005,
        active: true,
    }
}

fn quote(
    exchange: ExchangeId,
    canonical: &str,
    native: &str,
    bid: f64,
    ask: f64,
    size: f64,
    ts_us: i64,
) -> BookTop {
    BookTop {
        exchange,
        canonical: canonical.to_string(),
        native_symbol: native.to_string(),
        bids: vec![PriceLevel::new(bid, size)],
        asks: vec![PriceLevel::new(ask, size)],
        best_bid: Some(PriceLevel::new(bid, size)),
        best_ask: Some(PriceLevel::new(ask, size)),
        spread_bps: Some((ask - bid) / bid * 10_000.0),
        timestamp: ts_us,
        sequence: 1,
        is_snapshot: true,
    }
}

fn setup() -> (Arc<BookStore>, Arc<Normalizer>, Arc<SpreadEngine>) {
    let store = Arc::new(BookStore::new());
    let normalizer = Arc::new(Normalizer::new());
    let engine = SpreadEngine::new(
        engine_config(),
        store.clone(),
        normalizer.clone(),
        dry_publisher(),
    );
    (store, normalizer, engine)
}

#[test]
fn cross_venue_spread_values() {
    // Exchange X (binance) quotes BTC ask 60000.0 / bid 59995.0,
    // exchange Y (okx) ask 60010.0 / bid 60005.0.
    let (store, normalizer, engine) = setup();
    normalizer.register_instruments(vec![
        perp(ExchangeId::Binance, "BTCUSDT", "BTC"),
        perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC"),
    ]);

    let now = util::now_us();
    store.update(quote(
        ExchangeId::Binance,
        "BTC",
        "BTCUSDT",
        59995.0,
        60000.0,
        1.0,
        now,
    ));
    store.update(quote(
        ExchangeId::Okx,
        "BTC",
        "BTC-USDT-SWAP",
        60005.0,
        60010.0,
        1.0,
        now,
    ));

    let ticks = engine.compute_pairs("BTC");
    assert_eq!(ticks.len(), 2);

    let long_x = ticks
        .iter()
        .find(|t| t.long_exchange == ExchangeId::Binance)
        .unwrap();
    // (60005 - 60000) / 60000 * 1e4 = 0.8333 bps
    assert!((long_x.spread_bps - 0.8333).abs() < 0.001);
    assert_eq!(long_x.long_price, 60000.0);
    assert_eq!(long_x.short_price, 60005.0);

    let long_y = ticks
        .iter()
        .find(|t| t.long_exchange == ExchangeId::Okx)
        .unwrap();
    // (59995 - 60010) / 60010 * 1e4 = -2.4996 bps
    assert!((long_y.spread_bps - (-2.4996)).abs() < 0.001);

    // Ranked output: the positive spread first
    assert_eq!(ticks[0].long_exchange, ExchangeId::Binance);
}

#[test]
fn spread_antisymmetry_on_tight_books() {
    // With negligible within-venue spreads the two directions of a
    // pair are mirror images up to the books' own width.
    let (store, normalizer, engine) = setup();
    normalizer.register_instruments(vec![
        perp(ExchangeId::Bybit, "ETHUSDT", "ETH"),
        perp(ExchangeId::Gateio, "ETH_USDT", "ETH"),
    ]);

    let now = util::now_us();
    store.update(quote(
        ExchangeId::Bybit,
        "ETH",
        "ETHUSDT",
        2999.99,
        3000.01,
        10.0,
        now,
    ));
    store.update(quote(
        ExchangeId::Gateio,
        "ETH",
        "ETH_USDT",
        3001.49,
        3001.51,
        10.0,
        now,
    ));

    let ticks = engine.compute_pairs("ETH");
    let ab = ticks
        .iter()
        .find(|t| t.long_exchange == ExchangeId::Bybit)
        .unwrap();
    let ba = ticks
        .iter()
        .find(|t| t.long_exchange == ExchangeId::Gateio)
        .unwrap();

    // Tolerance: the sum of both venues' internal spreads (~0.13 bps)
    // plus slack for the differing denominators
    let tolerance = 0.15;
    assert!(
        (ab.spread_bps + ba.spread_bps).abs() < tolerance,
        "ab={} ba={}",
        ab.spread_bps,
        ba.spread_bps
    );
}

#[test]
fn stale_leg_suppresses_the_pair() {
    // Long leg timestamped 10s ago with a 2s staleness threshold:
    // nothing may be emitted for the pair.
    let (store, normalizer, engine) = setup();
    normalizer.register_instruments(vec![
        perp(ExchangeId::Binance, "SOLUSDT", "SOL"),
        perp(ExchangeId::Bybit, "SOLUSDT", "SOL"),
    ]);

    let now = util::now_us();
    store.update(quote(
        ExchangeId::Binance,
        "SOL",
        "SOLUSDT",
        150.0,
        150.1,
        100.0,
        now - 10_000_000, // 10 s old
    ));
    store.update(quote(
        ExchangeId::Bybit,
        "SOL",
        "SOLUSDT",
        150.2,
        150.3,
        100.0,
        now,
    ));

    assert!(engine.compute_pairs("SOL").is_empty());
}

#[test]
fn single_venue_canonical_yields_nothing() {
    let (store, normalizer, engine) = setup();
    normalizer.register_instruments(vec![perp(ExchangeId::Binance, "FOOUSDT", "FOO")]);
    store.update(quote(
        ExchangeId::Binance,
        "FOO",
        "FOOUSDT",
        1.0,
        1.01,
        1000.0,
        util::now_us(),
    ));
    assert!(engine.compute_pairs("FOO").is_empty());
}

#[test]
fn min_depth_filter_drops_thin_pairs() {
    let (store, normalizer, engine) = setup();
    normalizer.register_instruments(vec![
        perp(ExchangeId::Binance, "BTCUSDT", "BTC"),
        perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC"),
    ]);

    let now = util::now_us();
    // 0.00001 BTC at 60k ≈ $0.60 per level: below the $100 floor
    store.update(quote(
        ExchangeId::Binance,
        "BTC",
        "BTCUSDT",
        59995.0,
        60000.0,
        0.00001,
        now,
    ));
    store.update(quote(
        ExchangeId::Okx,
        "BTC",
        "BTC-USDT-SWAP",
        60005.0,
        60010.0,
        1.0,
        now,
    ));

    assert!(engine.compute_pairs("BTC").is_empty());
}

#[test]
fn inactive_instrument_drops_its_venue() {
    let (store, normalizer, engine) = setup();
    let mut delisted = perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC");
    delisted.active = false;
    normalizer.register_instruments(vec![
        perp(ExchangeId::Binance, "BTCUSDT", "BTC"),
        perp(ExchangeId::Bybit, "BTCUSDT", "BTC"),
        delisted,
    ]);

    let now = util::now_us();
    for (ex, native) in [
        (ExchangeId::Binance, "BTCUSDT"),
        (ExchangeId::Bybit, "BTCUSDT"),
        (ExchangeId::Okx, "BTC-USDT-SWAP"),
    ] {
        store.update(quote(ex, "BTC", native, 59995.0, 60000.0, 1.0, now));
    }

    let ticks = engine.compute_pairs("BTC");
    // Only binance<->bybit remains: 2 ordered pairs
    assert_eq!(ticks.len(), 2);
    assert!(
        ticks
            .iter()
            .all(|t| t.long_exchange != ExchangeId::Okx && t.short_exchange != ExchangeId::Okx)
    );
}

#[test]
fn common_symbol_filter() {
    // Canonicals {BTC: [X, Y, Z], FOO: [X]} → common(2) = [BTC]
    let normalizer = Normalizer::new();
    normalizer.register_instruments(vec![
        perp(ExchangeId::Binance, "BTCUSDT", "BTC"),
        perp(ExchangeId::Bybit, "BTCUSDT", "BTC"),
        perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC"),
        perp(ExchangeId::Binance, "FOOUSDT", "FOO"),
    ]);
    assert_eq!(normalizer.common_symbols(2), vec!["BTC".to_string()]);
}

#[test]
fn depth_estimate_respects_contract_size_and_cap() {
    let (store, normalizer, engine) = setup();

    // okx BTC swap contracts are 0.01 BTC each
    let mut okx = perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC");
    okx.contract_size = 0.01;
    normalizer.register_instruments(vec![perp(ExchangeId::Binance, "BTCUSDT", "BTC"), okx]);

    let now = util::now_us();
    store.update(quote(
        ExchangeId::Binance,
        "BTC",
        "BTCUSDT",
        59995.0,
        60000.0,
        2.0,
        now,
    ));
    // 100 contracts x 0.01 BTC x ~60k = ~$60k per level
    store.update(quote(
        ExchangeId::Okx,
        "BTC",
        "BTC-USDT-SWAP",
        60005.0,
        60010.0,
        100.0,
        now,
    ));

    let ticks = engine.compute_pairs("BTC");
    let long_binance = ticks
        .iter()
        .find(|t| t.long_exchange == ExchangeId::Binance)
        .unwrap();

    // binance leg: 60000 * 2 = $120k
    assert!((long_binance.long_depth_usd - 120_000.0).abs() < 1.0);
    // okx leg: 60005 * 100 * 0.01 = $60k
    assert!((long_binance.short_depth_usd - 60_005.0).abs() < 1.0);
    assert!((long_binance.min_depth_usd - 60_005.0).abs() < 1.0);
}
