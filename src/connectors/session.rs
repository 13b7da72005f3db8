use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, tungstenite::Utf8Bytes};

use crate::book::{ApplyResult, BookFault, OrderBook};
use crate::config::Credentials;
use crate::connectors::connector::{
    BookFrame, Compression, ExchangeConnector, MarketSink, ParsedFrame, SessionStatus, TradeFrame,
};
use crate::error::IngestError;
use crate::metrics::METRICS;
use crate::normalizer::Normalizer;
use crate::schema::{BookUpdate, TradePrint};

/// Session tuning, shared by every venue.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub depth_levels: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Control messages accepted by a live session.
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Force a reconnect (supervisor health action); subscriptions are
    /// preserved and replayed.
    Reconnect,
    Shutdown,
}

/// Handle held by the supervisor for one venue session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn subscribe(&self, symbols: Vec<String>) {
        let _ = self.tx.try_send(SessionCommand::Subscribe(symbols));
    }

    pub fn unsubscribe(&self, symbols: Vec<String>) {
        let _ = self.tx.try_send(SessionCommand::Unsubscribe(symbols));
    }

    pub fn force_reconnect(&self) {
        let _ = self.tx.try_send(SessionCommand::Reconnect);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(SessionCommand::Shutdown);
    }
}

/// Desired-vs-confirmed subscription bookkeeping.
///
/// Invariant (reconnect durability): after any disconnect every desired
/// symbol is pending again, and the session is not reported healthy
/// until the full set has been re-issued.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    desired: BTreeSet<String>,
    issued: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, symbols: &[String]) {
        for s in symbols {
            self.desired.insert(s.clone());
        }
    }

    pub fn remove(&mut self, symbols: &[String]) {
        for s in symbols {
            self.desired.remove(s);
            self.issued.remove(s);
        }
    }

    /// Symbols still waiting for a subscribe frame on this connection.
    pub fn pending(&self) -> Vec<String> {
        self.desired.difference(&self.issued).cloned().collect()
    }

    pub fn mark_issued(&mut self, symbols: &[String]) {
        for s in symbols {
            if self.desired.contains(s) {
                self.issued.insert(s.clone());
            }
        }
    }

    /// Connection dropped: everything must be re-issued.
    pub fn reset(&mut self) {
        self.issued.clear();
    }

    /// True once every desired symbol was issued on the live connection.
    pub fn replayed(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn desired(&self) -> Vec<String> {
        self.desired.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

/// Exponential reconnect backoff with jitter.
///
/// 1s initial, 30s cap by default; +-20% jitter keeps a fleet of
/// sessions from reconnecting in lockstep after a shared outage.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Next delay, doubling up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = 0.8 + 0.4 * rand::random::<f64>();
        base.mul_f64(jitter)
    }

    /// Deterministic upper bound of the next delay, for tests.
    pub fn current_base(&self) -> Duration {
        self.current
    }
}

/// One live streaming session with one venue.
///
/// Owns every mutable piece of per-venue state: the native books, the
/// subscription set and the socket. Nothing outside this task touches
/// them; results leave exclusively through the sink.
pub struct Session {
    connector: Arc<dyn ExchangeConnector>,
    normalizer: Arc<Normalizer>,
    sink: Arc<dyn MarketSink>,
    cfg: SessionConfig,
    credentials: Option<Credentials>,

    subs: SubscriptionSet,
    books: HashMap<String, OrderBook>,

    /// Taken out for the lifetime of each connection so the select
    /// loop can poll it while the session mutates its own state.
    rx: Option<mpsc::Receiver<SessionCommand>>,
}

impl Session {
    /// Spawns the session task for `symbols` and returns its handle.
    pub fn spawn(
        connector: Arc<dyn ExchangeConnector>,
        normalizer: Arc<Normalizer>,
        sink: Arc<dyn MarketSink>,
        cfg: SessionConfig,
        credentials: Option<Credentials>,
        symbols: Vec<String>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(64);

        let mut subs = SubscriptionSet::new();
        subs.add(&symbols);

        let session = Session {
            connector,
            normalizer,
            sink,
            cfg,
            credentials,
            subs,
            books: HashMap::new(),
            rx: Some(rx),
        };

        tokio::spawn(session.run());
        SessionHandle { tx }
    }

    /// Persistent reconnect loop.
    ///
    /// GUARANTEES:
    /// - Exits only on an explicit Shutdown command
    /// - Failures reconnect with exponential backoff
    /// - The full subscription set is replayed after every reconnect
    async fn run(mut self) {
        let exchange = self.connector.id();
        let mut backoff = Backoff::new(self.cfg.reconnect_initial, self.cfg.reconnect_max);

        METRICS.sessions_active.fetch_add(1, Ordering::Relaxed);

        loop {
            self.sink.on_status(exchange, SessionStatus::Connecting);

            match self.run_connection().await {
                ConnectionExit::Shutdown => {
                    self.sink.on_status(exchange, SessionStatus::Disconnected);
                    METRICS.sessions_active.fetch_sub(1, Ordering::Relaxed);
                    log::info!("[{exchange}] session shut down");
                    return;
                }
                ConnectionExit::Healthy => {
                    // Orderly venue-side close after a long uptime;
                    // restart promptly.
                    backoff.reset();
                }
                ConnectionExit::Failed(e) => {
                    log::warn!("[{exchange}] connection lost: {e}");
                }
            }

            METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
            self.sink.on_status(exchange, SessionStatus::Reconnecting);

            // Books are venue state; a new connection starts clean and
            // resynchronizes from snapshots.
            self.books.clear();
            self.subs.reset();

            sleep(backoff.next_delay()).await;
        }
    }

    /// Runs a single connection to completion.
    async fn run_connection(&mut self) -> ConnectionExit {
        let exchange = self.connector.id();

        let endpoint = match self.connector.ws_endpoint().await {
            Ok(url) => url,
            Err(e) => return ConnectionExit::Failed(e),
        };

        let (ws, _) = match connect_async(&endpoint).await {
            Ok(ok) => ok,
            Err(e) => return ConnectionExit::Failed(IngestError::transport(exchange, e)),
        };
        let (mut ws_write, mut ws_read) = ws.split();

        self.sink.on_status(exchange, SessionStatus::Connected);

        // Dedicated write serializer: the read loop, the ping timer and
        // control handling all enqueue; exactly one task owns the sink.
        let (write_tx, mut write_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                if ws_write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut rx = self.rx.take().expect("command receiver is held between connections");
        let exit = self
            .drive_connection(&mut ws_read, &write_tx, &mut rx)
            .await;
        self.rx = Some(rx);

        drop(write_tx);
        writer.abort();
        exit
    }

    async fn drive_connection(
        &mut self,
        ws_read: &mut (impl Stream<
            Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
        write_tx: &mpsc::Sender<Message>,
        rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> ConnectionExit {
        let exchange = self.connector.id();
        let ping_interval = self.connector.wire().ping_interval;

        // Optional login (user-data); public flow proceeds regardless.
        if let Some(creds) = self.credentials.clone() {
            if let Some(frame) = self.connector.login_frame(&creds) {
                if send_text(write_tx, frame).await.is_err() {
                    return ConnectionExit::Failed(IngestError::transport(
                        exchange,
                        "write failed during login",
                    ));
                }
            }
        }

        if let Err(e) = self.issue_subscriptions(write_tx).await {
            return ConnectionExit::Failed(e);
        }
        if let Err(e) = self.seed_books(write_tx).await {
            return ConnectionExit::Failed(e);
        }
        self.sink.on_status(exchange, SessionStatus::Subscribed);

        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();

        // Dead-peer detection: no inbound traffic for 2x ping interval.
        let stale_window = ping_interval * 2;
        let mut last_inbound = tokio::time::Instant::now();
        let mut stale_timer = tokio::time::interval(ping_interval);
        stale_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            last_inbound = tokio::time::Instant::now();
                            if let Err(exit) = self.handle_ws_message(msg, write_tx).await {
                                return exit;
                            }
                        }
                        Some(Err(e)) => {
                            return ConnectionExit::Failed(
                                IngestError::transport(exchange, e),
                            );
                        }
                        None => return ConnectionExit::Healthy,
                    }
                }

                _ = ping_timer.tick() => {
                    let msg = match self.connector.app_ping_frame() {
                        Some(text) => Message::Text(Utf8Bytes::from(text)),
                        None => Message::Ping(Vec::new().into()),
                    };
                    if write_tx.send(msg).await.is_err() {
                        return ConnectionExit::Failed(
                            IngestError::transport(exchange, "ping write failed"),
                        );
                    }
                }

                _ = stale_timer.tick() => {
                    if last_inbound.elapsed() > stale_window {
                        return ConnectionExit::Failed(IngestError::transport(
                            exchange,
                            format!("no inbound traffic for {stale_window:?}"),
                        ));
                    }
                }

                cmd = rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Subscribe(symbols)) => {
                            self.subs.add(&symbols);
                            if let Err(e) = self.issue_subscriptions(write_tx).await {
                                return ConnectionExit::Failed(e);
                            }
                            if let Err(e) = self.seed_books(write_tx).await {
                                return ConnectionExit::Failed(e);
                            }
                        }
                        Some(SessionCommand::Unsubscribe(symbols)) => {
                            let frames = self
                                .connector
                                .unsubscribe_frames(&symbols, self.cfg.depth_levels);
                            for f in frames {
                                let _ = send_text(write_tx, f).await;
                            }
                            self.subs.remove(&symbols);
                            for s in &symbols {
                                self.books.remove(s);
                            }
                        }
                        Some(SessionCommand::Reconnect) => {
                            return ConnectionExit::Failed(IngestError::transport(
                                exchange,
                                "reconnect forced by supervisor",
                            ));
                        }
                        Some(SessionCommand::Shutdown) | None => {
                            return ConnectionExit::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Sends subscribe frames for every pending symbol, chunked to the
    /// venue's frame limit.
    async fn issue_subscriptions(
        &mut self,
        write_tx: &mpsc::Sender<Message>,
    ) -> crate::error::Result<()> {
        let pending = self.subs.pending();
        if pending.is_empty() {
            return Ok(());
        }

        let chunk_size = self.connector.wire().max_subs_per_frame.max(1);
        for chunk in pending.chunks(chunk_size) {
            for frame in self
                .connector
                .subscribe_frames(chunk, self.cfg.depth_levels)
            {
                send_text(write_tx, frame).await.map_err(|_| {
                    IngestError::transport(self.connector.id(), "subscribe write failed")
                })?;
                METRICS.subscriptions_sent.fetch_add(1, Ordering::Relaxed);
            }
            self.subs.mark_issued(chunk);
        }

        METRICS
            .symbols_subscribed
            .store(self.subs.len(), Ordering::Relaxed);
        Ok(())
    }

    /// REST-seeds streaming books for venues that require it.
    ///
    /// Only unsynced symbols are fetched; a reconnect therefore seeds
    /// everything once, later subscribe commands only their additions.
    async fn seed_books(&mut self, _write_tx: &mpsc::Sender<Message>) -> crate::error::Result<()> {
        if !self.connector.wire().rest_seed {
            return Ok(());
        }

        for symbol in self.subs.desired() {
            let synced = self.books.get(&symbol).map(|b| b.synced()).unwrap_or(false);
            if synced {
                continue;
            }
            self.resync_symbol(&symbol).await;
        }
        Ok(())
    }

    async fn handle_ws_message(
        &mut self,
        msg: Message,
        write_tx: &mpsc::Sender<Message>,
    ) -> std::result::Result<(), ConnectionExit> {
        let exchange = self.connector.id();

        let text: Option<String> = match msg {
            Message::Text(t) => Some(t.to_string()),
            Message::Binary(data) => {
                METRICS.frames_decompressed.fetch_add(1, Ordering::Relaxed);
                match decompress(self.connector.wire().compression, &data) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[{exchange}] undecodable binary frame: {e}");
                        None
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = write_tx.send(Message::Pong(payload)).await;
                None
            }
            Message::Close(_) => return Err(ConnectionExit::Healthy),
            _ => None,
        };

        let Some(text) = text else { return Ok(()) };
        METRICS.frames_received.fetch_add(1, Ordering::Relaxed);

        for event in self.connector.parse_frame(&text) {
            match event {
                ParsedFrame::Snapshot(frame) => self.apply_snapshot(frame),
                ParsedFrame::Delta(frame) => self.apply_delta(frame, write_tx).await,
                ParsedFrame::Trade(trade) => self.emit_trade(trade),
                ParsedFrame::Ticker(_) => {
                    // Streaming tickers are not subscribed; REST polling
                    // covers bootstrap ranking. Ignored if a venue
                    // bundles them anyway.
                }
                ParsedFrame::Ping(payload) => {
                    if let Some(reply) = self.connector.pong_frame(payload.as_deref()) {
                        let _ = send_text(write_tx, reply).await;
                    }
                }
                ParsedFrame::Pong => {}
                ParsedFrame::SubAck { ok, detail } => {
                    if !ok {
                        METRICS.subscription_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "[{exchange}] subscription rejected: {}",
                            detail.unwrap_or_default()
                        );
                    }
                }
                ParsedFrame::AuthAck { ok, detail } => {
                    if ok {
                        self.sink.on_status(exchange, SessionStatus::Authenticated);
                    } else {
                        METRICS.auth_failures.fetch_add(1, Ordering::Relaxed);
                        self.sink.on_error(IngestError::Auth {
                            exchange,
                            message: detail.unwrap_or_default(),
                        });
                        // Public data continues; only user-data is lost.
                    }
                }
                ParsedFrame::Control => {}
                ParsedFrame::Malformed(reason) => {
                    METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[{exchange}] dropped frame: {reason}");
                }
            }
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, frame: BookFrame) {
        let book = self.books.entry(frame.native_symbol.clone()).or_default();
        match book.apply_snapshot(
            frame.bids,
            frame.asks,
            frame.last_seq,
            frame.timestamp * 1_000,
        ) {
            Ok(()) => {
                METRICS.book_snapshots.fetch_add(1, Ordering::Relaxed);
                self.emit_book(&frame.native_symbol, true);
            }
            Err(fault) => {
                // A crossed venue snapshot cannot be repaired locally.
                METRICS.crossed_books.fetch_add(1, Ordering::Relaxed);
                self.books.remove(&frame.native_symbol);
                self.report_fault(&frame.native_symbol, fault);
            }
        }
    }

    async fn apply_delta(&mut self, frame: BookFrame, write_tx: &mpsc::Sender<Message>) {
        let symbol = frame.native_symbol.clone();

        let Some(book) = self.books.get_mut(&symbol) else {
            // Delta before any snapshot. Venues that push snapshots
            // will deliver one; REST-seeded venues fetch one now.
            if self.connector.wire().rest_seed {
                self.resync_symbol(&symbol).await;
            }
            return;
        };
        if !book.synced() {
            return;
        }

        let delta = crate::book::BookDelta {
            bids: frame.bids,
            asks: frame.asks,
            first_seq: frame.first_seq,
            last_seq: frame.last_seq,
            prev_seq: frame.prev_seq,
            timestamp: frame.timestamp * 1_000,
        };

        match book.apply_delta(&delta) {
            Ok(ApplyResult::Applied) => {
                METRICS.book_updates.fetch_add(1, Ordering::Relaxed);
                self.emit_book(&symbol, false);
            }
            Ok(ApplyResult::Stale) => {}
            Err(fault) => {
                match fault {
                    BookFault::SequenceGap { .. } => {
                        METRICS.sequence_gaps.fetch_add(1, Ordering::Relaxed)
                    }
                    BookFault::Crossed { .. } => {
                        METRICS.crossed_books.fetch_add(1, Ordering::Relaxed)
                    }
                };
                self.report_fault(&symbol, fault);
                self.books.remove(&symbol);

                // Targeted recovery, not a full disconnect.
                if self.connector.wire().rest_seed {
                    self.resync_symbol(&symbol).await;
                } else {
                    // Venue re-sends a snapshot on resubscription.
                    let symbols = vec![symbol.clone()];
                    for f in self
                        .connector
                        .unsubscribe_frames(&symbols, self.cfg.depth_levels)
                    {
                        let _ = send_text(write_tx, f).await;
                    }
                    for f in self
                        .connector
                        .subscribe_frames(&symbols, self.cfg.depth_levels)
                    {
                        let _ = send_text(write_tx, f).await;
                    }
                }
            }
        }
    }

    /// Fetches a REST snapshot and replaces the symbol's book.
    ///
    /// Streaming deltas older than the snapshot are discarded by the
    /// book's sequence check once the session resumes applying.
    async fn resync_symbol(&mut self, symbol: &str) {
        let exchange = self.connector.id();
        METRICS.book_resyncs.fetch_add(1, Ordering::Relaxed);

        match self
            .connector
            .fetch_orderbook_snapshot(symbol, self.cfg.depth_levels)
            .await
        {
            Ok(frame) => self.apply_snapshot(frame),
            Err(e) => {
                log::warn!("[{exchange}] snapshot refetch failed for {symbol}: {e}");
                self.sink.on_error(e);
            }
        }
    }

    fn report_fault(&self, symbol: &str, fault: BookFault) {
        let exchange = self.connector.id();
        let error = match fault {
            BookFault::SequenceGap { expected, got } => IngestError::BookContinuity {
                exchange,
                symbol: symbol.to_string(),
                expected,
                got,
            },
            BookFault::Crossed { bid, ask } => IngestError::Invariant {
                exchange,
                symbol: symbol.to_string(),
                message: format!("crossed book after apply: bid {bid} >= ask {ask}"),
            },
        };
        log::warn!("[{exchange}] {error}");
        self.sink.on_error(error);
    }

    fn emit_book(&self, symbol: &str, is_snapshot: bool) {
        let Some(book) = self.books.get(symbol) else {
            return;
        };
        let exchange = self.connector.id();
        let canonical = self.normalizer.to_canonical(exchange, symbol);
        let (bids, asks) = book.top(self.cfg.depth_levels);

        let update = BookUpdate {
            exchange_id: exchange,
            symbol: symbol.to_string(),
            canonical,
            best_bid: book.best_bid().map(|l| l.price),
            best_ask: book.best_ask().map(|l| l.price),
            spread_bps: book.spread_bps(),
            bids,
            asks,
            timestamp: book.timestamp(),
            sequence_id: book.sequence(),
            is_snapshot,
        };
        self.sink.on_book(update);
    }

    fn emit_trade(&self, trade: TradeFrame) {
        let exchange = self.connector.id();
        let print = TradePrint {
            exchange,
            canonical: self.normalizer.to_canonical(exchange, &trade.native_symbol),
            symbol: trade.native_symbol,
            price: trade.price,
            quantity: trade.quantity,
            side: trade.side,
            timestamp: trade.timestamp,
        };
        self.sink.on_trade(print);
    }
}

enum ConnectionExit {
    /// Orderly close; reconnect without penalty
    Healthy,
    /// Error; reconnect with backoff
    Failed(IngestError),
    /// Supervisor asked us to stop
    Shutdown,
}

async fn send_text(
    write_tx: &mpsc::Sender<Message>,
    text: String,
) -> std::result::Result<(), ()> {
    write_tx
        .send(Message::Text(Utf8Bytes::from(text)))
        .await
        .map_err(|_| ())
}

/// Inflates a binary frame according to the venue's compression.
fn decompress(compression: Compression, data: &[u8]) -> std::io::Result<String> {
    let mut out = String::new();
    match compression {
        Compression::None => {
            out = String::from_utf8_lossy(data).into_owned();
        }
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_string(&mut out)?;
        }
        Compression::Deflate => {
            flate2::read::ZlibDecoder::new(data).read_to_string(&mut out)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_subscriptions_replayed_after_disconnect() {
        let mut subs = SubscriptionSet::new();
        subs.add(&syms(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]));

        // Initial connection issues everything
        let pending = subs.pending();
        assert_eq!(pending.len(), 3);
        subs.mark_issued(&pending);
        assert!(subs.replayed());

        // Disconnect: the full set is pending again and the session is
        // unhealthy until every prior subscription is re-issued
        subs.reset();
        assert!(!subs.replayed());
        assert_eq!(subs.pending(), syms(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]));

        let pending = subs.pending();
        subs.mark_issued(&pending);
        assert!(subs.replayed());
    }

    #[test]
    fn unsubscribe_shrinks_desired_set() {
        let mut subs = SubscriptionSet::new();
        subs.add(&syms(&["BTCUSDT", "ETHUSDT"]));
        let pending = subs.pending();
        subs.mark_issued(&pending);

        subs.remove(&syms(&["ETHUSDT"]));
        assert_eq!(subs.desired(), syms(&["BTCUSDT"]));
        assert!(subs.replayed());

        // Re-adding a removed symbol makes it pending again
        subs.add(&syms(&["ETHUSDT"]));
        assert_eq!(subs.pending(), syms(&["ETHUSDT"]));
    }

    #[test]
    fn issuing_unknown_symbol_is_ignored() {
        let mut subs = SubscriptionSet::new();
        subs.add(&syms(&["BTCUSDT"]));
        subs.mark_issued(&syms(&["ETHUSDT"]));
        assert_eq!(subs.pending(), syms(&["BTCUSDT"]));
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut bases = Vec::new();
        for _ in 0..7 {
            bases.push(b.current_base());
            let delay = b.next_delay();
            // Jitter stays within +-20%
            let base = *bases.last().unwrap();
            assert!(delay >= base.mul_f64(0.79) && delay <= base.mul_f64(1.21));
        }
        assert_eq!(
            bases,
            [1, 2, 4, 8, 16, 30, 30].map(Duration::from_secs).to_vec()
        );

        b.reset();
        assert_eq!(b.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn gzip_round_trip() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"{\"ping\":123}").unwrap();
        let compressed = enc.finish().unwrap();

        let text = decompress(Compression::Gzip, &compressed).unwrap();
        assert_eq!(text, "{\"ping\":123}");
    }
}
