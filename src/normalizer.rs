use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::schema::{ExchangeId, Instrument};

/// Synonym table folding wrapped / staked / multiplier variants onto
/// their underlying asset.
///
/// CONTRACT:
/// - Keys and values are uppercase
/// - Applied after delimiter and quote stripping
const SYNONYMS: &[(&str, &str)] = &[
    ("XBT", "BTC"),
    ("WBTC", "BTC"),
    ("WETH", "ETH"),
    ("STETH", "ETH"),
    ("WSTETH", "ETH"),
    ("WBETH", "ETH"),
    ("WSOL", "SOL"),
    ("WBNB", "BNB"),
];

/// Quote assets recognized when stripping suffixes off an unregistered
/// native symbol. Longest match wins ("USDT" before "USD").
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD"];

/// Venue-specific instrument-name decorations dropped during
/// canonicalization ("BTC-USDT-SWAP", "BTCUSDT_UMCBL", ...).
const DECOR_TOKENS: &[&str] = &["SWAP", "PERP", "UMCBL", "CMCBL", "FUTURES"];

/// Bidirectional symbol registry.
///
/// Holds the instrument metadata for every (exchange, native symbol)
/// and two mirrored indices:
/// - (exchange, native)  → canonical
/// - canonical           → { exchange → native }
///
/// THREAD SAFETY:
/// - Reads vastly dominate writes; a single RwLock is sufficient.
/// - Registration takes the write lock; lookups take read locks.
pub struct Normalizer {
    inner: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    /// (exchange, native) → instrument
    instruments: HashMap<(ExchangeId, String), Instrument>,

    /// (exchange, UPPERCASE native) → canonical
    to_canonical: HashMap<(ExchangeId, String), String>,

    /// canonical → exchange → native
    ///
    /// BTreeMap keeps venue iteration deterministic for emission
    /// ordering and tests.
    by_canonical: HashMap<String, BTreeMap<ExchangeId, String>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    /// Idempotent bulk insert/update.
    ///
    /// Re-registration replaces the stored instrument and refreshes both
    /// indices. Instruments that fail the spread-eligibility check are
    /// stored (metadata lookups still work) but do not join the
    /// canonical fan-out index.
    pub fn register_instruments(&self, instruments: Vec<Instrument>) {
        let mut reg = self.inner.write();
        for inst in instruments {
            let key = (inst.exchange, inst.native_symbol.clone());
            let upper = (inst.exchange, inst.native_symbol.to_uppercase());

            reg.to_canonical.insert(upper, inst.canonical.clone());

            if inst.spread_eligible() {
                reg.by_canonical
                    .entry(inst.canonical.clone())
                    .or_default()
                    .insert(inst.exchange, inst.native_symbol.clone());
            } else if let Some(m) = reg.by_canonical.get_mut(&inst.canonical) {
                // Delisted or ineligible: drop from the fan-out index
                if m.get(&inst.exchange) == Some(&inst.native_symbol) {
                    m.remove(&inst.exchange);
                }
            }

            reg.instruments.insert(key, inst);
        }
    }

    /// Primary lookup: native symbol → canonical.
    ///
    /// Registered symbols resolve through the index; unregistered ones
    /// fall back to the deterministic canonicalization rule.
    pub fn to_canonical(&self, exchange: ExchangeId, native: &str) -> String {
        let upper = native.trim().to_uppercase();
        if let Some(c) = self
            .inner
            .read()
            .to_canonical
            .get(&(exchange, upper.clone()))
        {
            return c.clone();
        }
        canonicalize(&upper)
    }

    /// Reverse lookup: canonical → venue-native symbol.
    ///
    /// Uses the registered mapping when present, otherwise constructs
    /// the symbol from the venue's naming convention.
    pub fn to_exchange_symbol(&self, canonical: &str, exchange: ExchangeId) -> String {
        let canonical = canonical.trim().to_uppercase();
        if let Some(native) = self
            .inner
            .read()
            .by_canonical
            .get(&canonical)
            .and_then(|m| m.get(&exchange))
        {
            return native.clone();
        }
        default_native_symbol(exchange, &canonical)
    }

    /// Instrument metadata for (canonical, exchange), if registered.
    pub fn instrument(&self, canonical: &str, exchange: ExchangeId) -> Option<Instrument> {
        let reg = self.inner.read();
        let native = reg.by_canonical.get(canonical)?.get(&exchange)?;
        reg.instruments.get(&(exchange, native.clone())).cloned()
    }

    /// All venues listing a canonical, in deterministic order.
    pub fn exchanges_for(&self, canonical: &str) -> Vec<ExchangeId> {
        self.inner
            .read()
            .by_canonical
            .get(canonical)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Canonicals listed on at least `min_exchanges` venues, sorted.
    pub fn common_symbols(&self, min_exchanges: usize) -> Vec<String> {
        let reg = self.inner.read();
        let mut out: Vec<String> = reg
            .by_canonical
            .iter()
            .filter(|(_, venues)| venues.len() >= min_exchanges)
            .map(|(c, _)| c.clone())
            .collect();
        out.sort();
        out
    }

    /// Native symbols of one venue whose canonical is in `canonicals`.
    pub fn native_symbols_for(
        &self,
        exchange: ExchangeId,
        canonicals: &[String],
    ) -> Vec<String> {
        let reg = self.inner.read();
        canonicals
            .iter()
            .filter_map(|c| reg.by_canonical.get(c)?.get(&exchange).cloned())
            .collect()
    }

    /// Total registered instrument count, for bootstrap logging.
    pub fn instrument_count(&self) -> usize {
        self.inner.read().instruments.len()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic canonicalization of a native symbol with no registry
/// entry. Input is already trimmed and uppercased.
///
/// Rule, in order:
/// 1. Split on `- _ /` delimiters
/// 2. Drop venue decoration and quote tokens ("SWAP", "USDT", ...)
/// 3. On the remaining base, strip a trailing quote suffix
///    (covers delimiter-free names like "1000PEPEUSDT")
/// 4. Strip a leading "1000" multiplier prefix
/// 5. Apply the synonym table
pub fn canonicalize(upper: &str) -> String {
    let mut base: Option<&str> = None;
    for part in upper.split(['-', '_', '/']) {
        if part.is_empty() {
            continue;
        }
        if DECOR_TOKENS.contains(&part) || QUOTE_SUFFIXES.contains(&part) {
            continue;
        }
        if base.is_none() {
            base = Some(part);
        }
    }

    let mut base = base.unwrap_or(upper).to_string();

    for quote in QUOTE_SUFFIXES {
        if base.len() > quote.len() && base.ends_with(quote) {
            base.truncate(base.len() - quote.len());
            break;
        }
    }

    if base.len() > 4 {
        if let Some(stripped) = base.strip_prefix("1000") {
            base = stripped.to_string();
        }
    }

    for (from, to) in SYNONYMS {
        if base == *from {
            return (*to).to_string();
        }
    }
    base
}

/// Per-venue naming convention for constructing a native perpetual
/// symbol when the canonical was never registered for that venue.
pub fn default_native_symbol(exchange: ExchangeId, canonical: &str) -> String {
    match exchange {
        ExchangeId::Binance | ExchangeId::Bybit | ExchangeId::Lbank => {
            format!("{canonical}USDT")
        }
        ExchangeId::Okx => format!("{canonical}-USDT-SWAP"),
        ExchangeId::Kucoin => format!("{canonical}USDTM"),
        ExchangeId::Mexc | ExchangeId::Gateio | ExchangeId::Coinex => {
            format!("{canonical}_USDT")
        }
        ExchangeId::Bitget => format!("{canonical}USDT"),
        ExchangeId::Bingx => format!("{canonical}-USDT"),
        ExchangeId::Htx => format!("{canonical}-USDT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::InstrumentKind;

    fn perp(exchange: ExchangeId, native: &str, canonical: &str, base: &str) -> Instrument {
        Instrument {
            exchange,
            native_symbol: native.to_string(),
            canonical: canonical.to_string(),
            base_asset: base.to_string(),
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

    #[test]
    fn synonym_and_multiplier_normalization() {
        // Unregistered fallback path
        assert_eq!(canonicalize("1000PEPEUSDT"), "PEPE");
        assert_eq!(canonicalize("WBTC-USDT-SWAP"), "BTC");
        assert_eq!(canonicalize("STETH_USDT"), "ETH");
        assert_eq!(canonicalize("BTCUSDT"), "BTC");
        assert_eq!(canonicalize("BTC-USDT"), "BTC");
        assert_eq!(canonicalize("1000SHIB_USDT"), "SHIB");
    }

    #[test]
    fn registered_lookup_wins_over_rule() {
        let n = Normalizer::new();
        // Registers with base BTC even though the raw rule would yield WBTC
        let mut inst = perp(ExchangeId::Okx, "WBTC-USDT-SWAP", "BTC", "BTC");
        inst.canonical = "BTC".into();
        n.register_instruments(vec![inst]);
        assert_eq!(n.to_canonical(ExchangeId::Okx, "WBTC-USDT-SWAP"), "BTC");
        // Case-insensitive
        assert_eq!(n.to_canonical(ExchangeId::Okx, "wbtc-usdt-swap"), "BTC");
    }

    #[test]
    fn round_trip_for_registered_instruments() {
        let n = Normalizer::new();
        let fixtures = vec![
            perp(ExchangeId::Binance, "1000PEPEUSDT", "PEPE", "1000PEPE"),
            perp(ExchangeId::Okx, "PEPE-USDT-SWAP", "PEPE", "PEPE"),
            perp(ExchangeId::Gateio, "PEPE_USDT", "PEPE", "PEPE"),
        ];
        n.register_instruments(fixtures.clone());

        for inst in &fixtures {
            let canonical = n.to_canonical(inst.exchange, &inst.native_symbol);
            assert_eq!(
                n.to_exchange_symbol(&canonical, inst.exchange),
                inst.native_symbol
            );
            // Canonical idempotence
            let native = n.to_exchange_symbol(&canonical, inst.exchange);
            assert_eq!(n.to_canonical(inst.exchange, &native), canonical);
        }
    }

    #[test]
    fn common_symbols_filter() {
        let n = Normalizer::new();
        n.register_instruments(vec![
            perp(ExchangeId::Binance, "BTCUSDT", "BTC", "BTC"),
            perp(ExchangeId::Okx, "BTC-USDT-SWAP", "BTC", "BTC"),
            perp(ExchangeId::Bybit, "BTCUSDT", "BTC", "BTC"),
            perp(ExchangeId::Binance, "FOOUSDT", "FOO", "FOO"),
        ]);
        assert_eq!(n.common_symbols(2), vec!["BTC".to_string()]);
        assert_eq!(
            n.exchanges_for("BTC"),
            vec![ExchangeId::Binance, ExchangeId::Bybit, ExchangeId::Okx]
        );
    }

    #[test]
    fn deregistration_on_inactive() {
        let n = Normalizer::new();
        let mut inst = perp(ExchangeId::Binance, "BTCUSDT", "BTC", "BTC");
        n.register_instruments(vec![inst.clone()]);
        assert_eq!(n.exchanges_for("BTC"), vec![ExchangeId::Binance]);

        inst.active = false;
        n.register_instruments(vec![inst]);
        assert!(n.exchanges_for("BTC").is_empty());
    }

    #[test]
    fn constructed_convention_per_venue() {
        let n = Normalizer::new();
        assert_eq!(n.to_exchange_symbol("BTC", ExchangeId::Binance), "BTCUSDT");
        assert_eq!(
            n.to_exchange_symbol("BTC", ExchangeId::Okx),
            "BTC-USDT-SWAP"
        );
        assert_eq!(n.to_exchange_symbol("BTC", ExchangeId::Gateio), "BTC_USDT");
        assert_eq!(n.to_exchange_symbol("BTC", ExchangeId::Kucoin), "BTCUSDTM");
    }
}
