use serde::Deserialize;

use crate::error::{IngestError, Result};
use crate::schema::ExchangeId;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level configuration structure loaded from `config.json`.
//
// It defines:
// - Bus (redis) connection settings
// - Enabled exchanges and their optional credentials
// - Book depth / staleness / throttle parameters
// - Spread scoring weights
//
// Environment overrides (applied after file load):
// - MD_INGEST_REDIS_URL       → bus.url
// - MD_INGEST_CREDENTIALS_DIR → per-exchange credential file directory
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Bus connection settings
    pub bus: BusConfig,

    /// List of exchange configurations
    pub exchanges: Vec<ExchangeSettings>,

    /// Book depth retained per (exchange, canonical)
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,

    /// A canonical must be listed on at least this many venues to be
    /// subscribed and enter the spread matrix.
    #[serde(default = "default_min_exchanges")]
    pub min_exchanges: usize,

    /// Reconnect backoff (initial / cap)
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Periodic refresh intervals
    #[serde(default = "default_funding_refresh_secs")]
    pub funding_refresh_secs: u64,
    #[serde(default = "default_instrument_refresh_secs")]
    pub instrument_refresh_secs: u64,
    #[serde(default = "default_ticker_refresh_secs")]
    pub ticker_refresh_secs: u64,

    /// Per-pair spread emission throttle
    #[serde(default = "default_spread_throttle_ms")]
    pub spread_throttle_ms: u64,

    /// Top-N summary cadence and size
    #[serde(default = "default_summary_interval_ms")]
    pub summary_interval_ms: u64,
    #[serde(default = "default_summary_top")]
    pub summary_top: usize,

    /// Quotes older than this are treated as missing
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,

    /// Levels summed into the per-leg depth-in-quote estimate
    #[serde(default = "default_depth_quote_levels")]
    pub depth_quote_levels: usize,

    /// Display cap for the depth-in-quote estimate
    #[serde(default = "default_depth_cap_usd")]
    pub depth_cap_usd: f64,

    /// Minimum per-leg depth for a pair to be emitted
    #[serde(default = "default_min_depth_usd")]
    pub min_depth_usd: f64,

    /// Spread ranking weights, see spread::score
    #[serde(default)]
    pub score: ScoreWeights,
}

// ------------------------------------------------------------
// Bus configuration
// ------------------------------------------------------------
//
// Defines how the publisher reaches the redis bus.
//
// Notes:
// - `dry_run` disables network publishing (messages are logged only).
// - `stream_maxlen` bounds the per-orderbook replay stream.
//
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Redis URL, e.g. "redis://127.0.0.1:6379/0"
    pub url: String,

    /// Dry-run mode: log instead of publishing (local testing)
    #[serde(default)]
    pub dry_run: bool,

    /// Approximate cap for each orderbook replay stream (XADD MAXLEN ~)
    #[serde(default = "default_stream_maxlen")]
    pub stream_maxlen: usize,

    /// TTL of the `spreads:list` key in seconds
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,

    /// Bounded outbound queue size
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

// ------------------------------------------------------------
// Exchange configuration
// ------------------------------------------------------------

/// Configuration for a single venue.
///
/// Credentials are optional and only required for user-data streams;
/// all market-data paths are public.
#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeSettings {
    /// Exchange identifier (e.g. "binance", "okx")
    pub name: String,

    /// Enables or disables this exchange at runtime
    pub enabled: bool,

    /// Optional API credentials for private streams
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Override for venues whose streaming ticker is not subscribed;
    /// such venues are polled on `ticker_refresh_secs`.
    #[serde(default)]
    pub poll_tickers: bool,
}

/// API credentials for authenticated (user-data) streams.
#[derive(Debug, Deserialize, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,

    /// Passphrase, required by okx/kucoin/bitget style venues
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Weights of the composite spread ranking score:
///
///   score = spread_bps
///         + funding_weight * net_funding_bps_per_day
///         - depth_weight / min_depth_usd
///
/// Both weights are domain-tunable; the defaults favour raw spread.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ScoreWeights {
    #[serde(default = "default_funding_weight")]
    pub funding_weight: f64,
    #[serde(default = "default_depth_weight")]
    pub depth_weight: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            funding_weight: default_funding_weight(),
            depth_weight: default_depth_weight(),
        }
    }
}

fn default_depth_levels() -> usize {
    20
}
fn default_min_exchanges() -> usize {
    2
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_funding_refresh_secs() -> u64 {
    300
}
fn default_instrument_refresh_secs() -> u64 {
    6 * 3600
}
fn default_ticker_refresh_secs() -> u64 {
    60
}
fn default_spread_throttle_ms() -> u64 {
    100
}
fn default_summary_interval_ms() -> u64 {
    500
}
fn default_summary_top() -> usize {
    20
}
fn default_staleness_ms() -> u64 {
    2_000
}
fn default_depth_quote_levels() -> usize {
    5
}
fn default_depth_cap_usd() -> f64 {
    1_000_000.0
}
fn default_min_depth_usd() -> f64 {
    100.0
}
fn default_funding_weight() -> f64 {
    1.0
}
fn default_depth_weight() -> f64 {
    10_000.0
}
fn default_stream_maxlen() -> usize {
    1_000
}
fn default_list_ttl_secs() -> u64 {
    10
}
fn default_outbound_queue() -> usize {
    8_192
}

impl Config {
    /// Loads the configuration file and applies environment overrides.
    ///
    /// Unknown exchange names are a startup failure, not a warning:
    /// a typo must never silently disable a venue.
    pub fn load(path: &str) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("cannot read {path}: {e}")))?;
        let mut cfg: Config = serde_json::from_str(&data)
            .map_err(|e| IngestError::Config(format!("cannot parse {path}: {e}")))?;

        if let Ok(url) = std::env::var("MD_INGEST_REDIS_URL") {
            cfg.bus.url = url;
        }

        // Credentials may be kept out of the config file entirely and
        // supplied as one JSON file per venue under this directory.
        if let Ok(dir) = std::env::var("MD_INGEST_CREDENTIALS_DIR") {
            for ex in &mut cfg.exchanges {
                if ex.credentials.is_some() {
                    continue;
                }
                let path = std::path::Path::new(&dir).join(format!("{}.json", ex.name));
                if let Ok(data) = std::fs::read_to_string(&path) {
                    let creds: Credentials = serde_json::from_str(&data).map_err(|e| {
                        IngestError::Config(format!("bad credential file {path:?}: {e}"))
                    })?;
                    ex.credentials = Some(creds);
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        for ex in &self.exchanges {
            if ExchangeId::from_name(&ex.name).is_none() {
                return Err(IngestError::Config(format!(
                    "unknown exchange '{}'",
                    ex.name
                )));
            }
            if let Some(c) = &ex.credentials {
                if c.api_key.is_empty() || c.api_secret.is_empty() {
                    return Err(IngestError::Config(format!(
                        "empty credentials for '{}'",
                        ex.name
                    )));
                }
            }
        }
        if self.min_exchanges < 2 {
            return Err(IngestError::Config(
                "min_exchanges must be at least 2".into(),
            ));
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(IngestError::Config("invalid reconnect delays".into()));
        }
        Ok(())
    }

    /// Enabled exchanges resolved to ids, in config order.
    pub fn enabled_exchanges(&self) -> Vec<(ExchangeId, &ExchangeSettings)> {
        self.exchanges
            .iter()
            .filter(|e| e.enabled)
            .filter_map(|e| ExchangeId::from_name(&e.name).map(|id| (id, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "bus": { "url": "redis://127.0.0.1:6379/0" },
            "exchanges": [
                { "name": "binance", "enabled": true },
                { "name": "okx", "enabled": false }
            ]
        }"#
        .to_string()
    }

    #[test]
    fn defaults_applied() {
        let cfg: Config = serde_json::from_str(&minimal_json()).unwrap();
        assert_eq!(cfg.depth_levels, 20);
        assert_eq!(cfg.min_exchanges, 2);
        assert_eq!(cfg.spread_throttle_ms, 100);
        assert_eq!(cfg.summary_interval_ms, 500);
        assert_eq!(cfg.summary_top, 20);
        assert_eq!(cfg.bus.stream_maxlen, 1_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_exchange_fails_validation() {
        let cfg: Config = serde_json::from_str(
            &minimal_json().replace("binance", "hyperliquid"),
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn enabled_exchanges_filters_disabled() {
        let cfg: Config = serde_json::from_str(&minimal_json()).unwrap();
        let enabled = cfg.enabled_exchanges();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, ExchangeId::Binance);
    }
}
