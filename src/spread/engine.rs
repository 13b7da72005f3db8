use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};

use crate::config::{Config, ScoreWeights};
use crate::metrics::METRICS;
use crate::normalizer::Normalizer;
use crate::publisher::Publisher;
use crate::schema::{ExchangeId, FundingRate, PriceTicker, SpreadSummary, SpreadTick};
use crate::spread::score;
use crate::store::BookStore;
use crate::util;

/// Engine tuning, extracted from the process configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub staleness_ms: u64,
    pub depth_quote_levels: usize,
    pub depth_cap_usd: f64,
    pub min_depth_usd: f64,
    pub throttle_ms: u64,
    pub summary_interval_ms: u64,
    pub summary_top: usize,
    pub weights: ScoreWeights,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            staleness_ms: cfg.staleness_ms,
            depth_quote_levels: cfg.depth_quote_levels,
            depth_cap_usd: cfg.depth_cap_usd,
            min_depth_usd: cfg.min_depth_usd,
            throttle_ms: cfg.spread_throttle_ms,
            summary_interval_ms: cfg.summary_interval_ms,
            summary_top: cfg.summary_top,
            weights: cfg.score,
        }
    }
}

/// Pair key inside the engine: (canonical, long, short).
type PairKey = (String, ExchangeId, ExchangeId);

/// Write-side handle given to connector sessions and the supervisor.
///
/// Sessions call `mark_dirty` on every accepted book update; the call
/// is non-blocking and coalesces by canonical — the engine reads the
/// newest store state, so intermediate updates collapse naturally.
#[derive(Clone)]
pub struct EngineHandle {
    dirty: Arc<DirtySet>,
    funding: Arc<RwLock<HashMap<(ExchangeId, String), FundingRate>>>,
    volumes: Arc<RwLock<HashMap<(ExchangeId, String), f64>>>,
    normalizer: Arc<Normalizer>,
}

impl EngineHandle {
    pub fn mark_dirty(&self, canonical: &str) {
        self.dirty.insert(canonical);
    }

    /// Periodic funding snapshot from the supervisor. Keys resolve to
    /// canonicals here so the hot compute path does no lookups.
    pub fn update_funding(&self, rates: Vec<FundingRate>) {
        let mut map = self.funding.write();
        for rate in rates {
            let canonical = self
                .normalizer
                .to_canonical(rate.exchange, &rate.native_symbol);
            map.insert((rate.exchange, canonical), rate);
        }
    }

    /// Bootstrap / periodic 24h volumes used for tick enrichment.
    pub fn update_volumes(&self, tickers: &[PriceTicker]) {
        let mut map = self.volumes.write();
        for t in tickers {
            if let Some(vol) = t.volume_24h {
                let canonical = self.normalizer.to_canonical(t.exchange, &t.native_symbol);
                map.insert((t.exchange, canonical), vol);
            }
        }
    }
}

/// Coalescing dirty-key set with a wakeup.
///
/// Bounded by construction: one entry per canonical, newest state
/// always wins because the engine re-reads the store on drain.
struct DirtySet {
    keys: Mutex<HashSet<String>>,
    notify: Notify,
}

impl DirtySet {
    fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    fn insert(&self, canonical: &str) {
        let mut keys = self.keys.lock();
        if keys.insert(canonical.to_string()) && keys.len() == 1 {
            self.notify.notify_one();
        }
    }

    fn drain(&self) -> Vec<String> {
        let mut keys = self.keys.lock();
        keys.drain().collect()
    }
}

/// Cross-venue spread engine.
///
/// Runs as a single consumer task: book updates mark canonicals dirty,
/// the engine recomputes every ordered venue pair for each dirty
/// canonical, pushes per-pair ticks through the throttle gate and
/// maintains the rolling ranked list behind the summary stream.
pub struct SpreadEngine {
    cfg: EngineConfig,
    store: Arc<BookStore>,
    normalizer: Arc<Normalizer>,
    publisher: Publisher,

    dirty: Arc<DirtySet>,
    funding: Arc<RwLock<HashMap<(ExchangeId, String), FundingRate>>>,
    volumes: Arc<RwLock<HashMap<(ExchangeId, String), f64>>>,

    /// Per-pair throttle + trailing emission state
    gate: Mutex<ThrottleGate>,

    /// Latest tick per pair, source of the ranked summary
    latest: Mutex<HashMap<PairKey, SpreadTick>>,
}

impl SpreadEngine {
    pub fn new(
        cfg: EngineConfig,
        store: Arc<BookStore>,
        normalizer: Arc<Normalizer>,
        publisher: Publisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(ThrottleGate::new(Duration::from_millis(cfg.throttle_ms))),
            cfg,
            store,
            normalizer: normalizer.clone(),
            publisher,
            dirty: Arc::new(DirtySet::new()),
            funding: Arc::new(RwLock::new(HashMap::new())),
            volumes: Arc::new(RwLock::new(HashMap::new())),
            latest: Mutex::new(HashMap::new()),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            dirty: self.dirty.clone(),
            funding: self.funding.clone(),
            volumes: self.volumes.clone(),
            normalizer: self.normalizer.clone(),
        }
    }

    /// Main consumer loop. Exits when `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut flush = tokio::time::interval(Duration::from_millis(self.cfg.throttle_ms.max(10)));
        let mut summary =
            tokio::time::interval(Duration::from_millis(self.cfg.summary_interval_ms.max(50)));
        log::info!("spread engine started");

        loop {
            tokio::select! {
                _ = self.dirty.notify.notified() => {
                    for canonical in self.dirty.drain() {
                        self.recompute(&canonical, Instant::now());
                    }
                }
                _ = flush.tick() => {
                    let due = self.gate.lock().drain_due(Instant::now());
                    for tick in due {
                        self.emit(tick);
                    }
                }
                _ = summary.tick() => {
                    self.publish_summary();
                }
                _ = shutdown.changed() => {
                    log::info!("spread engine stopping");
                    return;
                }
            }
        }
    }

    /// Recomputes all pairs of one canonical and routes the results
    /// through the throttle gate.
    pub fn recompute(&self, canonical: &str, now: Instant) {
        let ticks = self.compute_pairs(canonical);

        {
            // Pairs that fell out (stale leg, delisting) leave the
            // summary silently; absence is not an error.
            let mut latest = self.latest.lock();
            latest.retain(|(c, _, _), _| c != canonical);
            for tick in &ticks {
                latest.insert(
                    (
                        tick.canonical.clone(),
                        tick.long_exchange,
                        tick.short_exchange,
                    ),
                    tick.clone(),
                );
            }
        }

        let mut gate = self.gate.lock();
        let mut admitted = Vec::new();
        for tick in ticks {
            let key = (
                tick.canonical.clone(),
                tick.long_exchange,
                tick.short_exchange,
            );
            if let Some(tick) = gate.admit(key, tick, now) {
                admitted.push(tick);
            }
        }
        drop(gate);

        for tick in admitted {
            self.emit(tick);
        }
    }

    /// Computes the ranked tick list for every ordered venue pair of a
    /// canonical whose both legs pass freshness, depth and active
    /// checks. Pure read of the store; no emission.
    pub fn compute_pairs(&self, canonical: &str) -> Vec<SpreadTick> {
        let venues = self.store.venues_for(canonical);
        if venues.len() < 2 {
            return Vec::new();
        }

        let funding = self.funding.read();
        let volumes = self.volumes.read();

        // Collect live legs once
        struct Leg {
            exchange: ExchangeId,
            top: crate::store::BookTop,
            contract_size: f64,
        }

        let mut legs = Vec::with_capacity(venues.len());
        for exchange in venues {
            let Some(inst) = self.normalizer.instrument(canonical, exchange) else {
                continue;
            };
            if !inst.active {
                continue;
            }
            let Some(top) = self
                .store
                .get_fresh(exchange, canonical, self.cfg.staleness_ms)
            else {
                continue;
            };
            if top.best_bid.is_none() || top.best_ask.is_none() {
                continue;
            }
            legs.push(Leg {
                exchange,
                top,
                contract_size: inst.contract_size,
            });
        }

        let mut ticks = Vec::new();
        let now_us = util::now_us();

        for long in &legs {
            for short in &legs {
                if long.exchange == short.exchange {
                    continue;
                }

                let long_ask = long.top.best_ask.unwrap().price;
                let short_bid = short.top.best_bid.unwrap().price;
                if long_ask <= 0.0 {
                    continue;
                }

                let spread_bps = (short_bid - long_ask) / long_ask * 10_000.0;
                if !spread_bps.is_finite() {
                    log::warn!(
                        "non-finite spread for {canonical} {}/{}, skipped",
                        long.exchange,
                        short.exchange
                    );
                    continue;
                }

                let long_depth = long.top.depth_quote(
                    true,
                    self.cfg.depth_quote_levels,
                    long.contract_size,
                    self.cfg.depth_cap_usd,
                );
                let short_depth = short.top.depth_quote(
                    false,
                    self.cfg.depth_quote_levels,
                    short.contract_size,
                    self.cfg.depth_cap_usd,
                );
                let min_depth = long_depth.min(short_depth);
                if min_depth < self.cfg.min_depth_usd {
                    continue;
                }

                let key_long = (long.exchange, canonical.to_string());
                let key_short = (short.exchange, canonical.to_string());
                let (long_rate, long_bpd) = funding
                    .get(&key_long)
                    .map(|f| (f.rate, f.bps_per_day()))
                    .unwrap_or((0.0, 0.0));
                let (short_rate, short_bpd) = funding
                    .get(&key_short)
                    .map(|f| (f.rate, f.bps_per_day()))
                    .unwrap_or((0.0, 0.0));

                let volume_24h = volumes
                    .get(&key_long)
                    .copied()
                    .unwrap_or(0.0)
                    .max(volumes.get(&key_short).copied().unwrap_or(0.0));

                let score = score::composite_score(
                    spread_bps,
                    short_bpd - long_bpd,
                    min_depth,
                    self.cfg.weights,
                );

                ticks.push(SpreadTick {
                    id: format!("{canonical}:{}:{}", long.exchange, short.exchange),
                    canonical: canonical.to_string(),
                    long_exchange: long.exchange,
                    short_exchange: short.exchange,
                    long_symbol: long.top.native_symbol.clone(),
                    short_symbol: short.top.native_symbol.clone(),
                    long_price: long_ask,
                    short_price: short_bid,
                    spread_percent: spread_bps / 100.0,
                    spread_bps,
                    long_funding: long_rate,
                    short_funding: short_rate,
                    net_funding: short_rate - long_rate,
                    long_depth_usd: long_depth,
                    short_depth_usd: short_depth,
                    min_depth_usd: min_depth,
                    volume_24h,
                    score,
                    updated_at: now_us,
                });
            }
        }

        score::rank(&mut ticks);
        ticks
    }

    fn emit(&self, tick: SpreadTick) {
        METRICS
            .spread_ticks_emitted
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.publisher.publish_spread(&tick);
    }

    /// Publishes the top-N digest plus the full ranked list key.
    ///
    /// Rows whose legs went stale since their last recompute are
    /// dropped here; the summary never carries a quote older than the
    /// staleness threshold.
    fn publish_summary(&self) {
        let now_us = util::now_us();
        let max_age_us = (self.cfg.staleness_ms as i64) * 1_000;

        let mut ranked: Vec<SpreadTick> = {
            let mut latest = self.latest.lock();
            latest.retain(|_, t| now_us - t.updated_at <= max_age_us);
            latest.values().cloned().collect()
        };
        if ranked.is_empty() {
            return;
        }

        score::rank(&mut ranked);

        let summary = SpreadSummary {
            generated_at: util::now_ms(),
            top: ranked.iter().take(self.cfg.summary_top).cloned().collect(),
        };
        METRICS
            .summaries_emitted
            .fetch_add(1, AtomicOrdering::Relaxed);
        self.publisher.publish_summary(&summary, &ranked);
    }
}

/// Per-pair emission throttle.
///
/// Contract (verified by tests):
/// - at most one emission per key per `min_interval`
/// - the latest state is never lost: a suppressed tick is held and
///   released by `drain_due` once its key's interval has passed
pub struct ThrottleGate {
    min_interval: Duration,
    last_emit: HashMap<PairKey, Instant>,
    pending: HashMap<PairKey, SpreadTick>,
}

impl ThrottleGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Offers a tick. Returns it when it may be emitted immediately;
    /// otherwise the tick replaces the key's pending state and `None`
    /// is returned.
    pub fn admit(&mut self, key: PairKey, tick: SpreadTick, now: Instant) -> Option<SpreadTick> {
        match self.last_emit.get(&key) {
            Some(last) if now.duration_since(*last) < self.min_interval => {
                METRICS
                    .spread_ticks_throttled
                    .fetch_add(1, AtomicOrdering::Relaxed);
                self.pending.insert(key, tick);
                None
            }
            _ => {
                self.last_emit.insert(key.clone(), now);
                self.pending.remove(&key);
                Some(tick)
            }
        }
    }

    /// Releases every pending tick whose interval has elapsed. Called
    /// on the engine's flush timer so a quiescent pair still emits its
    /// final state.
    pub fn drain_due(&mut self, now: Instant) -> Vec<SpreadTick> {
        let min_interval = self.min_interval;
        let last_emit = &mut self.last_emit;
        let mut due = Vec::new();

        self.pending.retain(|key, tick| {
            let ready = last_emit
                .get(key)
                .map(|last| now.duration_since(*last) >= min_interval)
                .unwrap_or(true);
            if ready {
                last_emit.insert(key.clone(), now);
                due.push(tick.clone());
                false
            } else {
                true
            }
        });

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExchangeId;

    fn tick(n: f64) -> SpreadTick {
        SpreadTick {
            id: "BTC:binance:okx".into(),
            canonical: "BTC".into(),
            long_exchange: ExchangeId::Binance,
            short_exchange: ExchangeId::Okx,
            long_symbol: "BTCUSDT".into(),
            short_symbol: "BTC-USDT-SWAP".into(),
            long_price: 60_000.0,
            short_price: 60_000.0 + n,
            spread_percent: 0.0,
            spread_bps: n,
            long_funding: 0.0,
            short_funding: 0.0,
            net_funding: 0.0,
            long_depth_usd: 1_000.0,
            short_depth_usd: 1_000.0,
            min_depth_usd: 1_000.0,
            volume_24h: 0.0,
            score: n,
            updated_at: 0,
        }
    }

    fn key() -> PairKey {
        ("BTC".into(), ExchangeId::Binance, ExchangeId::Okx)
    }

    #[test]
    fn first_tick_passes_immediately() {
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        assert!(gate.admit(key(), tick(1.0), Instant::now()).is_some());
    }

    #[test]
    fn rate_is_bounded_and_latest_state_wins() {
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(gate.admit(key(), tick(1.0), t0).is_some());

        // Burst inside the window: all suppressed
        for i in 0..5 {
            let t = t0 + Duration::from_millis(10 * (i + 1));
            assert!(gate.admit(key(), tick(2.0 + i as f64), t).is_none());
        }

        // Nothing due inside the window
        assert!(gate.drain_due(t0 + Duration::from_millis(90)).is_empty());

        // After the window the newest suppressed state is released
        let due = gate.drain_due(t0 + Duration::from_millis(110));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].spread_bps, 6.0);

        // And the drain itself counts as an emission
        assert!(gate
            .admit(key(), tick(9.0), t0 + Duration::from_millis(120))
            .is_none());
    }

    #[test]
    fn emission_count_over_rolling_window() {
        // 50 offers over 500ms with a 100ms throttle must emit at most
        // 6 times for one key (initial + one per elapsed window).
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let mut emitted = 0;

        for i in 0..50 {
            let now = t0 + Duration::from_millis(i * 10);
            if gate.admit(key(), tick(i as f64), now).is_some() {
                emitted += 1;
            }
            emitted += gate.drain_due(now).len();
        }
        assert!(emitted <= 6, "emitted {emitted} times");
        assert!(emitted >= 5);
    }

    #[test]
    fn independent_keys_do_not_throttle_each_other() {
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        let other: PairKey = ("ETH".into(), ExchangeId::Bybit, ExchangeId::Gateio);
        let now = Instant::now();

        assert!(gate.admit(key(), tick(1.0), now).is_some());
        assert!(gate.admit(other, tick(2.0), now).is_some());
    }
}
