use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::schema::{ExchangeId, PriceLevel};
use crate::util;

const SHARD_COUNT: usize = 16;

/// Latest top-of-book + bounded depth prefix for one (exchange, canonical).
///
/// This is the read-side unit handed to the spread engine; it is a
/// value snapshot, never a live reference into the store.
#[derive(Debug, Clone)]
pub struct BookTop {
    pub exchange: ExchangeId,
    pub canonical: String,
    pub native_symbol: String,

    /// Descending by price, capped at the configured depth
    pub bids: Vec<PriceLevel>,

    /// Ascending by price, capped at the configured depth
    pub asks: Vec<PriceLevel>,

    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    pub spread_bps: Option<f64>,

    /// Microsecond Unix timestamp of the update
    pub timestamp: i64,

    pub sequence: u64,
    pub is_snapshot: bool,
}

impl BookTop {
    /// Quote-value sum over the top `levels` of one side, capped.
    ///
    /// `contract_size` converts contract-sized venues into quote units;
    /// coin-sized venues pass 1.0.
    pub fn depth_quote(&self, ask_side: bool, levels: usize, contract_size: f64, cap: f64) -> f64 {
        let side = if ask_side { &self.asks } else { &self.bids };
        let sum: f64 = side
            .iter()
            .take(levels)
            .map(|l| l.price * l.quantity * contract_size)
            .sum();
        sum.min(cap)
    }

    /// Age of the quote in milliseconds relative to `now_us`.
    pub fn age_ms(&self, now_us: i64) -> i64 {
        (now_us - self.timestamp) / 1_000
    }
}

/// Concurrent map of (exchange, canonical) → latest book view.
///
/// Sharded to avoid a global hotspot: shard = hash(canonical) mod N,
/// so all venues of one canonical land in one shard and a spread
/// recomputation touches exactly one lock.
///
/// CONTRACT:
/// - Writes come only from the owning connector session.
/// - Reads are concurrent and never block writers on other shards.
pub struct BookStore {
    shards: Vec<RwLock<HashMap<(ExchangeId, String), BookTop>>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, canonical: &str) -> &RwLock<HashMap<(ExchangeId, String), BookTop>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Inserts or replaces the view for (exchange, canonical).
    pub fn update(&self, top: BookTop) {
        let mut shard = self.shard(&top.canonical).write();
        shard.insert((top.exchange, top.canonical.clone()), top);
    }

    /// Latest view regardless of age.
    pub fn get(&self, exchange: ExchangeId, canonical: &str) -> Option<BookTop> {
        self.shard(canonical)
            .read()
            .get(&(exchange, canonical.to_string()))
            .cloned()
    }

    /// Latest view if younger than `staleness_ms`, else None.
    ///
    /// Readers must treat a stale quote as missing; this is the
    /// freshness gate for every derived output.
    pub fn get_fresh(
        &self,
        exchange: ExchangeId,
        canonical: &str,
        staleness_ms: u64,
    ) -> Option<BookTop> {
        let top = self.get(exchange, canonical)?;
        if top.age_ms(util::now_us()) > staleness_ms as i64 {
            return None;
        }
        Some(top)
    }

    /// All venues currently holding a view for `canonical`, sorted.
    pub fn venues_for(&self, canonical: &str) -> Vec<ExchangeId> {
        let shard = self.shard(canonical).read();
        let mut venues: Vec<ExchangeId> = shard
            .keys()
            .filter(|(_, c)| c == canonical)
            .map(|(e, _)| *e)
            .collect();
        venues.sort();
        venues
    }

    /// Drops the view, e.g. on unsubscribe or session shutdown.
    pub fn remove(&self, exchange: ExchangeId, canonical: &str) {
        self.shard(canonical)
            .write()
            .remove(&(exchange, canonical.to_string()));
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top(exchange: ExchangeId, canonical: &str, bid: f64, ask: f64, ts_us: i64) -> BookTop {
        BookTop {
            exchange,
            canonical: canonical.to_string(),
            native_symbol: format!("{canonical}USDT"),
            bids: vec![PriceLevel::new(bid, 1.0), PriceLevel::new(bid - 1.0, 2.0)],
            asks: vec![PriceLevel::new(ask, 1.0), PriceLevel::new(ask + 1.0, 2.0)],
            best_bid: Some(PriceLevel::new(bid, 1.0)),
            best_ask: Some(PriceLevel::new(ask, 1.0)),
            spread_bps: Some((ask - bid) / bid * 10_000.0),
            timestamp: ts_us,
            sequence: 1,
            is_snapshot: true,
        }
    }

    #[test]
    fn update_and_read_back() {
        let store = BookStore::new();
        store.update(top(ExchangeId::Binance, "BTC", 59995.0, 60000.0, util::now_us()));
        store.update(top(ExchangeId::Okx, "BTC", 60005.0, 60010.0, util::now_us()));

        let b = store.get(ExchangeId::Binance, "BTC").unwrap();
        assert_eq!(b.best_ask.unwrap().price, 60000.0);
        assert_eq!(
            store.venues_for("BTC"),
            vec![ExchangeId::Binance, ExchangeId::Okx]
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn staleness_gate() {
        let store = BookStore::new();
        let old = util::now_us() - 10_000_000; // 10 s ago
        store.update(top(ExchangeId::Bybit, "ETH", 3000.0, 3001.0, old));

        assert!(store.get(ExchangeId::Bybit, "ETH").is_some());
        assert!(store.get_fresh(ExchangeId::Bybit, "ETH", 2_000).is_none());
        assert!(store.get_fresh(ExchangeId::Bybit, "ETH", 60_000).is_some());
    }

    #[test]
    fn depth_quote_cap_and_contract_size() {
        let t = top(ExchangeId::Gateio, "BTC", 100.0, 101.0, 0);
        // bids: 100*1 + 99*2 = 298 quote units
        assert!((t.depth_quote(false, 5, 1.0, 1e9) - 298.0).abs() < 1e-9);
        // contract size scales the estimate
        assert!((t.depth_quote(false, 5, 0.5, 1e9) - 149.0).abs() < 1e-9);
        // cap applies
        assert_eq!(t.depth_quote(false, 5, 1.0, 200.0), 200.0);
        // level limit applies
        assert!((t.depth_quote(false, 1, 1.0, 1e9) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn remove_drops_view() {
        let store = BookStore::new();
        store.update(top(ExchangeId::Mexc, "SOL", 150.0, 150.1, util::now_us()));
        store.remove(ExchangeId::Mexc, "SOL");
        assert!(store.get(ExchangeId::Mexc, "SOL").is_none());
        assert!(store.is_empty());
    }
}
