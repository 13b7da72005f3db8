use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use crate::config::BusConfig;
use crate::error::IngestError;
use crate::metrics::METRICS;
use crate::schema::{BookUpdate, BusError, BusMessage, SpreadSummary, SpreadTick, TradePrint};
use crate::util;

/// ============================================================
/// Publisher
/// ============================================================
///
/// Fans updates out to the redis bus.
///
/// Channel keys:
/// - `orderbook:{exchange}:{native_symbol}`          book updates
/// - `trades:{exchange}:{native_symbol}`             trade prints
/// - `spread:{canonical}`                            every pair touching the canonical
/// - `spread:{canonical}:{long}:{short}`             specific pair stream
/// - `spreads:summary`                               periodic top-N digest
/// - `spreads:list` (key-value, TTL)                 last full ranked list
///
/// Each `orderbook:*` key additionally carries an append-only stream
/// (XADD, MAXLEN-trimmed) so late consumers can replay recent entries
/// with an after-id cursor.
///
/// Design constraints (shared with the rest of the pipeline):
/// - Must never block collectors: enqueue is non-blocking `try_send`
/// - Must tolerate bus restarts: the worker reconnects indefinitely
/// - Must drop data gracefully under backpressure (counted in metrics)
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Command>,
    dry_run: bool,
}

enum Command {
    /// PUBLISH only
    Publish { channel: String, payload: String },

    /// PUBLISH + XADD to the bounded replay stream of the same key
    PublishLogged { channel: String, payload: String },

    /// SET key payload EX <configured list TTL>
    SetKeyed { key: String, payload: String },
}

impl Publisher {
    /// Spawns the background worker and returns the shared handle.
    ///
    /// In dry-run mode no connection is opened; every message is
    /// logged and dropped (local testing).
    pub fn spawn(cfg: BusConfig) -> Publisher {
        let (tx, rx) = mpsc::channel::<Command>(cfg.outbound_queue);
        let publisher = Publisher {
            tx,
            dry_run: cfg.dry_run,
        };

        if cfg.dry_run {
            log::warn!("publisher running in dry-run mode, nothing reaches the bus");
        } else {
            tokio::spawn(worker_loop(cfg, rx));
        }

        publisher
    }

    pub fn publish_book(&self, update: &BookUpdate) {
        let channel = format!(
            "orderbook:{}:{}",
            update.exchange_id, update.symbol
        );
        self.enqueue_logged(channel, &BusMessage::Book(update.clone()));
    }

    pub fn publish_trade(&self, print: &TradePrint) {
        let channel = format!("trades:{}:{}", print.exchange, print.symbol);
        self.enqueue(channel, &BusMessage::Trade(print.clone()));
    }

    /// One tick goes to both the canonical broadcast and the pair stream.
    pub fn publish_spread(&self, tick: &SpreadTick) {
        self.enqueue(
            format!("spread:{}", tick.canonical),
            &BusMessage::Spread(tick.clone()),
        );
        self.enqueue(
            format!(
                "spread:{}:{}:{}",
                tick.canonical, tick.long_exchange, tick.short_exchange
            ),
            &BusMessage::Spread(tick.clone()),
        );
    }

    /// Publishes the top-N digest and refreshes the `spreads:list` key
    /// with the full ranked list.
    pub fn publish_summary(&self, summary: &SpreadSummary, ranked: &[SpreadTick]) {
        self.enqueue(
            "spreads:summary".to_string(),
            &BusMessage::Summary(summary.clone()),
        );

        if let Ok(payload) = serde_json::to_string(ranked) {
            self.send(Command::SetKeyed {
                key: "spreads:list".to_string(),
                payload,
            });
        }
    }

    /// Surfaces an unrecoverable error to bus consumers with its
    /// stable machine code.
    pub fn publish_error(&self, err: &IngestError) {
        let body = BusError {
            code: err.code().to_string(),
            message: err.to_string(),
            exchange: None,
            timestamp: util::now_ms(),
        };
        self.enqueue("errors".to_string(), &BusMessage::Error(body));
    }

    fn enqueue(&self, channel: String, msg: &BusMessage) {
        if let Ok(payload) = serde_json::to_string(msg) {
            self.send(Command::Publish { channel, payload });
        }
    }

    fn enqueue_logged(&self, channel: String, msg: &BusMessage) {
        if let Ok(payload) = serde_json::to_string(msg) {
            self.send(Command::PublishLogged { channel, payload });
        }
    }

    /// Non-blocking enqueue. A full queue drops the message and counts
    /// it; market-data consumers recover from the next update or the
    /// keyed snapshot.
    fn send(&self, cmd: Command) {
        if self.dry_run {
            match &cmd {
                Command::Publish { channel, .. } | Command::PublishLogged { channel, .. } => {
                    log::debug!("dry-run publish -> {channel}");
                }
                Command::SetKeyed { key, .. } => log::debug!("dry-run set -> {key}"),
            }
            return;
        }
        match self.tx.try_send(cmd) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                METRICS.dropped_messages.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                METRICS.publish_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Background worker: owns the redis connection and drains the queue.
///
/// The connection manager reconnects internally; command failures are
/// counted and logged, never propagated to collectors.
async fn worker_loop(cfg: BusConfig, mut rx: mpsc::Receiver<Command>) {
    let mut conn = loop {
        match connect(&cfg.url).await {
            Ok(c) => break c,
            Err(e) => {
                log::error!("bus connection failed: {e}, retrying in 5s");
                sleep(Duration::from_secs(5)).await;
            }
        }
    };
    log::info!("publisher connected to bus at {}", cfg.url);

    while let Some(cmd) = rx.recv().await {
        let result = match cmd {
            Command::Publish { channel, payload } => publish(&mut conn, &channel, &payload).await,
            Command::PublishLogged { channel, payload } => {
                let r = publish(&mut conn, &channel, &payload).await;
                if r.is_ok() {
                    xadd(&mut conn, &channel, &payload, cfg.stream_maxlen).await
                } else {
                    r
                }
            }
            Command::SetKeyed { key, payload } => {
                set_keyed(&mut conn, &key, &payload, cfg.list_ttl_secs).await
            }
        };

        match result {
            Ok(_) => {
                METRICS.published_messages.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                METRICS.publish_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("bus command failed: {e}");
            }
        }
    }
}

async fn connect(url: &str) -> redis::RedisResult<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

async fn publish(
    conn: &mut redis::aio::ConnectionManager,
    channel: &str,
    payload: &str,
) -> redis::RedisResult<()> {
    let _: () = redis::cmd("PUBLISH")
        .arg(channel)
        .arg(payload)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Appends to the bounded replay stream of an orderbook key.
///
/// MAXLEN ~ trims approximately, which is what the replay contract
/// needs: "recent entries", not an exact count.
async fn xadd(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
    payload: &str,
    maxlen: usize,
) -> redis::RedisResult<()> {
    let _: String = redis::cmd("XADD")
        .arg(key)
        .arg("MAXLEN")
        .arg("~")
        .arg(maxlen)
        .arg("*")
        .arg("data")
        .arg(payload)
        .query_async(conn)
        .await?;
    Ok(())
}

async fn set_keyed(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
    payload: &str,
    ttl_secs: u64,
) -> redis::RedisResult<()> {
    let _: () = redis::cmd("SET")
        .arg(key)
        .arg(payload)
        .arg("EX")
        .arg(ttl_secs.max(1))
        .query_async(conn)
        .await?;
    Ok(())
}
