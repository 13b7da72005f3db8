use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use once_cell::sync::Lazy;

/// Global runtime metrics for the ingestion pipeline.
///
/// Purpose:
/// - Track active sessions and subscriptions
/// - Track throughput (frames, book updates, spread ticks)
/// - Track failure counters (parse errors, resyncs, reconnects, drops)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // High-level
    pub exchanges_active: AtomicUsize,
    pub sessions_active: AtomicUsize,
    pub symbols_subscribed: AtomicUsize,

    // Frame level
    pub frames_received: AtomicUsize,
    pub frames_decompressed: AtomicUsize,
    pub parse_errors: AtomicUsize,

    // Book maintenance
    pub book_updates: AtomicUsize,
    pub book_snapshots: AtomicUsize,
    pub book_resyncs: AtomicUsize,
    pub sequence_gaps: AtomicUsize,
    pub crossed_books: AtomicUsize,

    // Spread engine
    pub spread_ticks_emitted: AtomicUsize,
    pub spread_ticks_throttled: AtomicUsize,
    pub summaries_emitted: AtomicUsize,

    // Publisher
    pub published_messages: AtomicUsize,
    pub dropped_messages: AtomicUsize,
    pub publish_errors: AtomicUsize,

    // Sessions
    pub ws_reconnects: AtomicUsize,
    pub subscriptions_sent: AtomicUsize,
    pub subscription_errors: AtomicUsize,
    pub auth_failures: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
