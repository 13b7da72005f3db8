use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, sleep};

use crate::config::Config;
use crate::connectors::connector::{MarketSink, SessionStatus};
use crate::connectors::session::{Session, SessionConfig, SessionHandle};
use crate::connectors::{self, connector::ExchangeConnector};
use crate::error::IngestError;
use crate::metrics::METRICS;
use crate::normalizer::Normalizer;
use crate::publisher::Publisher;
use crate::schema::{BookUpdate, ExchangeId, TradePrint};
use crate::spread::{EngineConfig, EngineHandle, SpreadEngine};
use crate::store::{BookStore, BookTop};
use crate::util;

/// Per-exchange health, updated by the sink and read by the watchdog.
#[derive(Default)]
pub struct ExchangeHealth {
    pub connected: AtomicBool,
    pub last_message_ms: AtomicI64,
    pub error_count: AtomicUsize,
}

/// The event pipeline behind every connector session:
/// book store write → spread engine wakeup → publisher fan-out.
///
/// All three steps are non-blocking; this runs on session read paths.
struct IngestPipeline {
    store: Arc<BookStore>,
    engine: EngineHandle,
    publisher: Publisher,
    health: HashMap<ExchangeId, Arc<ExchangeHealth>>,
}

impl IngestPipeline {
    fn touch(&self, exchange: ExchangeId) {
        if let Some(h) = self.health.get(&exchange) {
            h.last_message_ms.store(util::now_ms(), Ordering::Relaxed);
        }
    }
}

impl MarketSink for IngestPipeline {
    fn on_book(&self, update: BookUpdate) {
        self.touch(update.exchange_id);

        self.store.update(BookTop {
            exchange: update.exchange_id,
            canonical: update.canonical.clone(),
            native_symbol: update.symbol.clone(),
            bids: update.bids.clone(),
            asks: update.asks.clone(),
            best_bid: update.bids.first().copied(),
            best_ask: update.asks.first().copied(),
            spread_bps: update.spread_bps,
            timestamp: update.timestamp,
            sequence: update.sequence_id,
            is_snapshot: update.is_snapshot,
        });

        self.engine.mark_dirty(&update.canonical);
        self.publisher.publish_book(&update);
    }

    fn on_trade(&self, print: TradePrint) {
        self.touch(print.exchange);
        self.publisher.publish_trade(&print);
    }

    fn on_status(&self, exchange: ExchangeId, status: SessionStatus) {
        log::info!("[{exchange}] session {status}");
        if let Some(h) = self.health.get(&exchange) {
            h.connected.store(
                matches!(
                    status,
                    SessionStatus::Connected
                        | SessionStatus::Authenticated
                        | SessionStatus::Subscribed
                ),
                Ordering::Relaxed,
            );
        }
    }

    fn on_error(&self, error: IngestError) {
        if let Some(h) = match &error {
            IngestError::Transport { exchange, .. }
            | IngestError::Protocol { exchange, .. }
            | IngestError::Auth { exchange, .. } => self.health.get(exchange),
            IngestError::BookContinuity { exchange, .. }
            | IngestError::Invariant { exchange, .. } => self.health.get(exchange),
            IngestError::RateLimited { exchange, .. } => self.health.get(exchange),
            IngestError::Config(_) => None,
        } {
            h.error_count.fetch_add(1, Ordering::Relaxed);
        }

        if !error.is_recoverable() {
            self.publisher.publish_error(&error);
        }
    }
}

/// One managed venue: its connector, session handle and current
/// streaming subscription set.
struct ManagedExchange {
    connector: Arc<dyn ExchangeConnector>,
    session: SessionHandle,
    subscribed: BTreeSet<String>,
    poll_tickers: bool,
    health: Arc<ExchangeHealth>,
}

/// Owns every component and runs the process lifecycle:
/// bootstrap → sessions → periodic refresh → health watchdog.
///
/// A venue that fails bootstrap or dies at runtime never takes the
/// others down; it is retried on the instrument-refresh cadence.
pub struct Supervisor {
    cfg: Config,
    normalizer: Arc<Normalizer>,
    store: Arc<BookStore>,
    publisher: Publisher,
    engine: Arc<SpreadEngine>,
    exchanges: HashMap<ExchangeId, ManagedExchange>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(cfg: Config) -> Self {
        let normalizer = Arc::new(Normalizer::new());
        let store = Arc::new(BookStore::new());
        let publisher = Publisher::spawn(cfg.bus.clone());
        let engine = SpreadEngine::new(
            EngineConfig::from_config(&cfg),
            store.clone(),
            normalizer.clone(),
            publisher.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            cfg,
            normalizer,
            store,
            publisher,
            engine,
            exchanges: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Runs until ctrl-c, then drains within the shutdown budget.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.bootstrap().await?;

        tokio::spawn(self.engine.clone().run(self.shutdown_tx.subscribe()));

        if !self.cfg.bus.dry_run {
            tokio::spawn(observe_trade_requests(
                self.cfg.bus.url.clone(),
                self.normalizer.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }

        self.periodic_loop().await;

        // Cooperative drain: stop sessions and the engine, give the
        // publisher queue a bounded window to flush.
        log::info!("shutting down, draining sessions");
        for managed in self.exchanges.values() {
            managed.session.shutdown();
        }
        let _ = self.shutdown_tx.send(true);
        sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    /// Startup sequence:
    /// 1. Fetch instruments from every enabled venue in parallel
    /// 2. Register with the normalizer
    /// 3. Compute canonicals listed on >= min_exchanges venues
    /// 4. Start one session per venue over its native subset
    /// 5. Seed funding and volumes
    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        let enabled = self.cfg.enabled_exchanges();
        if enabled.is_empty() {
            anyhow::bail!("no exchanges enabled");
        }

        let fetches = enabled.iter().map(|(id, _)| {
            let id = *id;
            let connector = connectors::get_connector(id);
            async move {
                let result = connector.fetch_instruments().await;
                (id, connector, result)
            }
        });
        let results = futures_util::future::join_all(fetches).await;

        let mut connectors_by_id = HashMap::new();
        for (id, connector, result) in results {
            match result {
                Ok(instruments) => {
                    log::info!("[{id}] {} live perpetuals", instruments.len());
                    self.normalizer.register_instruments(instruments);
                    connectors_by_id.insert(id, connector);
                }
                Err(e) => {
                    // Bootstrap failure of one venue is not fatal; the
                    // instrument refresh will retry it.
                    log::error!("[{id}] instrument bootstrap failed: {e}");
                }
            }
        }
        if connectors_by_id.is_empty() {
            anyhow::bail!("every exchange failed instrument bootstrap");
        }

        let common = self.normalizer.common_symbols(self.cfg.min_exchanges);
        log::info!(
            "{} instruments registered, {} canonicals on >= {} venues",
            self.normalizer.instrument_count(),
            common.len(),
            self.cfg.min_exchanges
        );

        let session_cfg = SessionConfig {
            depth_levels: self.cfg.depth_levels,
            reconnect_initial: Duration::from_millis(self.cfg.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.cfg.reconnect_max_ms),
        };

        for (id, settings) in &enabled {
            let Some(connector) = connectors_by_id.remove(id) else {
                continue;
            };
            let natives = self.normalizer.native_symbols_for(*id, &common);
            if natives.is_empty() {
                log::warn!("[{id}] no common symbols, session not started");
                continue;
            }

            let health = Arc::new(ExchangeHealth::default());
            let mut health_map = HashMap::new();
            health_map.insert(*id, health.clone());

            let sink = Arc::new(IngestPipeline {
                store: self.store.clone(),
                engine: self.engine.handle(),
                publisher: self.publisher.clone(),
                health: health_map,
            });

            log::info!("[{id}] starting session for {} symbols", natives.len());
            let session = Session::spawn(
                connector.clone(),
                self.normalizer.clone(),
                sink,
                session_cfg.clone(),
                settings.credentials.clone(),
                natives.clone(),
            );

            self.exchanges.insert(
                *id,
                ManagedExchange {
                    connector,
                    session,
                    subscribed: natives.into_iter().collect(),
                    poll_tickers: settings.poll_tickers,
                    health,
                },
            );
        }
        METRICS
            .exchanges_active
            .store(self.exchanges.len(), Ordering::Relaxed);

        self.refresh_funding().await;
        self.refresh_tickers(true).await;
        Ok(())
    }

    /// Periodic control plane. Market data never flows through here.
    async fn periodic_loop(&mut self) {
        let mut funding = interval(Duration::from_secs(self.cfg.funding_refresh_secs.max(30)));
        let mut instruments =
            interval(Duration::from_secs(self.cfg.instrument_refresh_secs.max(300)));
        let mut tickers = interval(Duration::from_secs(self.cfg.ticker_refresh_secs.max(15)));
        let mut watchdog = interval(Duration::from_secs(10));

        // All intervals fire immediately once; the bootstrap already
        // covered that round.
        funding.tick().await;
        instruments.tick().await;
        tickers.tick().await;
        watchdog.tick().await;

        loop {
            tokio::select! {
                _ = funding.tick() => self.refresh_funding().await,
                _ = instruments.tick() => self.refresh_instruments().await,
                _ = tickers.tick() => self.refresh_tickers(false).await,
                _ = watchdog.tick() => self.check_health(),
                r = tokio::signal::ctrl_c() => {
                    if let Err(e) = r {
                        log::error!("signal handler failed: {e}");
                    }
                    return;
                }
            }
        }
    }

    async fn refresh_funding(&self) {
        let handle = self.engine.handle();
        for (id, managed) in &self.exchanges {
            match managed.connector.fetch_funding_rates().await {
                Ok(rates) => {
                    log::debug!("[{id}] {} funding rates", rates.len());
                    handle.update_funding(rates);
                }
                Err(e) => log::warn!("[{id}] funding refresh failed: {e}"),
            }
        }
    }

    /// Ticker polling: on bootstrap every venue is polled once for
    /// volume ranking; afterwards only venues flagged for polling.
    async fn refresh_tickers(&self, bootstrap: bool) {
        let handle = self.engine.handle();
        for (id, managed) in &self.exchanges {
            if !bootstrap && !managed.poll_tickers {
                continue;
            }
            match managed.connector.fetch_price_tickers().await {
                Ok(tickers) => handle.update_volumes(&tickers),
                Err(e) => log::warn!("[{id}] ticker refresh failed: {e}"),
            }
        }
    }

    /// Instrument hot-reload: re-registers metadata, recomputes the
    /// common set and diffs each venue's streaming subscriptions.
    async fn refresh_instruments(&mut self) {
        for (id, managed) in &self.exchanges {
            match managed.connector.fetch_instruments().await {
                Ok(instruments) => self.normalizer.register_instruments(instruments),
                Err(e) => log::warn!("[{id}] instrument refresh failed: {e}"),
            }
        }

        let common = self.normalizer.common_symbols(self.cfg.min_exchanges);
        for (id, managed) in &mut self.exchanges {
            let desired: BTreeSet<String> = self
                .normalizer
                .native_symbols_for(*id, &common)
                .into_iter()
                .collect();

            let added: Vec<String> = desired.difference(&managed.subscribed).cloned().collect();
            let removed: Vec<String> = managed.subscribed.difference(&desired).cloned().collect();

            if !added.is_empty() {
                log::info!("[{id}] subscribing {} new symbols", added.len());
                managed.session.subscribe(added);
            }
            if !removed.is_empty() {
                log::info!("[{id}] unsubscribing {} delisted symbols", removed.len());
                for symbol in &removed {
                    let canonical = self.normalizer.to_canonical(*id, symbol);
                    self.store.remove(*id, &canonical);
                }
                managed.session.unsubscribe(removed);
            }
            managed.subscribed = desired;
        }
    }

    /// Force-reconnects venues that claim to be connected but have
    /// been silent for longer than twice their ping interval.
    fn check_health(&self) {
        let now = util::now_ms();
        for (id, managed) in &self.exchanges {
            if !managed.health.connected.load(Ordering::Relaxed) {
                continue;
            }
            let last = managed.health.last_message_ms.load(Ordering::Relaxed);
            if last == 0 {
                continue;
            }
            let silent_for = now - last;
            let limit = 2 * managed.connector.wire().ping_interval.as_millis() as i64;
            if silent_for > limit {
                log::warn!("[{id}] silent for {silent_for}ms, forcing reconnect");
                managed.session.force_reconnect();
            }
        }
    }
}

/// Observes the `trade:requests` stream from the external trading
/// service and answers symbol-resolution envelopes on
/// `trade:requests:resolved`. The core never executes orders; this is
/// the only inbound control surface.
async fn observe_trade_requests(
    bus_url: String,
    normalizer: Arc<Normalizer>,
    shutdown: watch::Receiver<bool>,
) {
    let client = match redis::Client::open(bus_url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("trade-request observer cannot open bus: {e}");
            return;
        }
    };
    let mut conn = loop {
        match client.get_connection_manager().await {
            Ok(c) => break c,
            Err(e) => {
                log::warn!("trade-request observer connect failed: {e}");
                sleep(Duration::from_secs(5)).await;
            }
        }
    };

    let mut last_id = "$".to_string();
    loop {
        if *shutdown.borrow() {
            return;
        }

        let reply: redis::RedisResult<redis::Value> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(100)
            .arg("BLOCK")
            .arg(2_000)
            .arg("STREAMS")
            .arg("trade:requests")
            .arg(&last_id)
            .query_async(&mut conn)
            .await;

        let entries = match reply {
            Ok(value) => parse_stream_entries(value),
            Err(e) => {
                log::warn!("trade-request read failed: {e}");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        for (id, payload) in entries {
            last_id = id;
            let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&payload) else {
                continue;
            };

            let request_id = envelope
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let Some(exchange) = envelope
                .get("exchange")
                .and_then(|v| v.as_str())
                .and_then(ExchangeId::from_name)
            else {
                continue;
            };

            // Either direction may be asked for
            let resolved = if let Some(canonical) = envelope.get("canonical").and_then(|v| v.as_str())
            {
                serde_json::json!({
                    "id": request_id,
                    "exchange": exchange,
                    "canonical": canonical,
                    "native_symbol": normalizer.to_exchange_symbol(canonical, exchange),
                })
            } else if let Some(native) = envelope.get("native_symbol").and_then(|v| v.as_str()) {
                serde_json::json!({
                    "id": request_id,
                    "exchange": exchange,
                    "canonical": normalizer.to_canonical(exchange, native),
                    "native_symbol": native,
                })
            } else {
                continue;
            };

            let publish: redis::RedisResult<()> = redis::cmd("PUBLISH")
                .arg("trade:requests:resolved")
                .arg(resolved.to_string())
                .query_async(&mut conn)
                .await;
            if let Err(e) = publish {
                log::warn!("trade-request reply failed: {e}");
            }
        }
    }
}

/// Unpacks an XREAD reply into (entry id, `data` field) pairs.
fn parse_stream_entries(value: redis::Value) -> Vec<(String, String)> {
    let mut out = Vec::new();

    // XREAD → [[stream, [[id, [k, v, ...]], ...]]]
    let redis::Value::Array(streams) = value else {
        return out;
    };
    for stream in streams {
        let redis::Value::Array(pair) = stream else {
            continue;
        };
        let Some(redis::Value::Array(entries)) = pair.into_iter().nth(1) else {
            continue;
        };
        for entry in entries {
            let redis::Value::Array(mut entry) = entry else {
                continue;
            };
            if entry.len() != 2 {
                continue;
            }
            let fields = entry.pop();
            let id = entry.pop();

            let id = match id {
                Some(redis::Value::BulkString(b)) => String::from_utf8_lossy(&b).into_owned(),
                Some(redis::Value::SimpleString(s)) => s,
                _ => continue,
            };

            let Some(redis::Value::Array(fields)) = fields else {
                continue;
            };
            let mut iter = fields.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                let key = match k {
                    redis::Value::BulkString(b) => String::from_utf8_lossy(&b).into_owned(),
                    redis::Value::SimpleString(s) => s,
                    _ => continue,
                };
                if key == "data" {
                    let value = match v {
                        redis::Value::BulkString(b) => String::from_utf8_lossy(&b).into_owned(),
                        redis::Value::SimpleString(s) => s,
                        _ => continue,
                    };
                    out.push((id.clone(), value));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_entry_parsing() {
        use redis::Value;

        let reply = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"trade:requests".to_vec()),
            Value::Array(vec![Value::Array(vec![
                Value::BulkString(b"1700000000000-0".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"data".to_vec()),
                    Value::BulkString(br#"{"id":"r1","exchange":"okx","canonical":"BTC"}"#.to_vec()),
                ]),
            ])]),
        ])]);

        let entries = parse_stream_entries(reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "1700000000000-0");
        assert!(entries[0].1.contains("\"canonical\":\"BTC\""));
    }
}
