use crate::schema::PriceLevel;

/// Outcome of applying an incremental update to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// Levels merged, top of book refreshed.
    Applied,

    /// Update predates the current snapshot (seq <= book seq); dropped.
    ///
    /// This is the normal case right after a snapshot resync and is
    /// not an error.
    Stale,
}

/// Why a book must be discarded and resynchronized from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BookFault {
    /// Continuity check failed: a delta was skipped.
    SequenceGap { expected: u64, got: u64 },

    /// best_bid >= best_ask after a clean apply. Impossible state;
    /// the session must resync this symbol.
    Crossed { bid: f64, ask: f64 },
}

/// Incremental update as produced by a connector's frame parser.
///
/// Venues express continuity differently; both schemes are carried and
/// the book checks whichever is present:
/// - `prev_seq`:  previous final seq must equal the book seq (binance `pu`)
/// - `first_seq`: first seq must be <= book seq + 1 (bybit/gateio `U`)
#[derive(Debug, Clone, Default)]
pub struct BookDelta {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub first_seq: Option<u64>,
    pub last_seq: u64,
    pub prev_seq: Option<u64>,
    pub timestamp: i64,
}

/// One venue-native order book.
///
/// Invariants after every successful apply:
/// - bids sorted descending, asks ascending, deduped by price
/// - all quantities strictly positive
/// - not crossed (best_bid < best_ask when both sides present)
/// - sequence never decreases while the session is live
///
/// Ownership: exactly one connector session mutates a book; readers see
/// state only through the BookStore.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// Descending by price
    bids: Vec<PriceLevel>,

    /// Ascending by price
    asks: Vec<PriceLevel>,

    sequence: u64,

    /// Microsecond Unix timestamp of the last apply
    timestamp: i64,

    /// True until the first delta lands on top of a snapshot
    is_snapshot: bool,

    /// False until the first snapshot arrives; deltas before that are
    /// buffered or dropped by the session, never applied here.
    synced: bool,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// (best_ask - best_bid) / best_bid * 1e4
    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        if bid <= 0.0 {
            return None;
        }
        Some((ask - bid) / bid * 10_000.0)
    }

    /// Top-K prefix of each side.
    pub fn top(&self, depth: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        (
            self.bids.iter().take(depth).copied().collect(),
            self.asks.iter().take(depth).copied().collect(),
        )
    }

    /// Replaces the full book with a snapshot.
    ///
    /// Input levels may be unsorted and may contain zero quantities;
    /// both are repaired here. A crossed snapshot is reported as a
    /// fault — a venue snapshot must never be crossed.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        sequence: u64,
        timestamp: i64,
    ) -> Result<(), BookFault> {
        self.bids = normalize_side(bids, true);
        self.asks = normalize_side(asks, false);
        self.sequence = sequence;
        self.timestamp = timestamp;
        self.is_snapshot = true;
        self.synced = true;
        self.check_crossed()
    }

    /// Applies an incremental update.
    ///
    /// - `Ok(Stale)`    : update predates the snapshot; dropped
    /// - `Err(fault)`   : gap or crossed book; caller must resync
    pub fn apply_delta(&mut self, delta: &BookDelta) -> Result<ApplyResult, BookFault> {
        debug_assert!(self.synced, "delta applied before snapshot");

        if delta.last_seq <= self.sequence {
            return Ok(ApplyResult::Stale);
        }

        // The first delta bridging a snapshot cannot be chained on
        // prev_seq (a REST snapshot id is not a stream update id); it
        // must cover or immediately follow the snapshot instead.
        if self.is_snapshot || delta.prev_seq.is_none() {
            if let Some(first) = delta.first_seq {
                if first > self.sequence + 1 {
                    return Err(BookFault::SequenceGap {
                        expected: self.sequence + 1,
                        got: first,
                    });
                }
            }
        } else if let Some(prev) = delta.prev_seq {
            if prev != self.sequence {
                return Err(BookFault::SequenceGap {
                    expected: self.sequence,
                    got: prev,
                });
            }
        }

        for level in &delta.bids {
            merge_level(&mut self.bids, *level, true);
        }
        for level in &delta.asks {
            merge_level(&mut self.asks, *level, false);
        }

        self.sequence = delta.last_seq;
        self.timestamp = delta.timestamp;
        self.is_snapshot = false;

        self.check_crossed()?;
        Ok(ApplyResult::Applied)
    }

    fn check_crossed(&self) -> Result<(), BookFault> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(BookFault::Crossed {
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        Ok(())
    }
}

/// Sorts one side, drops non-positive quantities, dedupes by price
/// keeping the last occurrence (exchange snapshots occasionally repeat
/// a price; the later entry is authoritative).
fn normalize_side(mut levels: Vec<PriceLevel>, descending: bool) -> Vec<PriceLevel> {
    levels.retain(|l| l.quantity > 0.0 && l.price > 0.0);
    if descending {
        levels.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    levels.reverse();
    levels.dedup_by(|a, b| a.price == b.price);
    levels.reverse();
    levels
}

/// Inserts, replaces or deletes a single level in a sorted side.
fn merge_level(side: &mut Vec<PriceLevel>, level: PriceLevel, descending: bool) {
    let pos = side.binary_search_by(|probe| {
        if descending {
            level.price.total_cmp(&probe.price)
        } else {
            probe.price.total_cmp(&level.price)
        }
    });

    match pos {
        Ok(i) => {
            if level.quantity > 0.0 {
                side[i] = level;
            } else {
                side.remove(i);
            }
        }
        Err(i) => {
            if level.quantity > 0.0 {
                side.insert(i, level);
            }
            // Deleting an absent price is a no-op, not an error.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv(price: f64, qty: f64) -> PriceLevel {
        PriceLevel::new(price, qty)
    }

    fn snapshot_book() -> OrderBook {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            vec![lv(100.0, 2.0), lv(99.5, 1.0)],
            vec![lv(101.0, 3.0)],
            10,
            1_000,
        )
        .unwrap();
        book
    }

    #[test]
    fn snapshot_then_delete_and_insert() {
        // Snapshot bids [(100.0, 2.0), (99.5, 1.0)], asks [(101.0, 3.0)], seq=10.
        // Delta seq=11 deletes 99.5, inserts (99.0, 4.0).
        let mut book = snapshot_book();
        let r = book
            .apply_delta(&BookDelta {
                bids: vec![lv(99.5, 0.0), lv(99.0, 4.0)],
                asks: vec![],
                first_seq: Some(11),
                last_seq: 11,
                prev_seq: None,
                timestamp: 1_001,
            })
            .unwrap();
        assert_eq!(r, ApplyResult::Applied);

        let (bids, asks) = book.top(10);
        assert_eq!(bids, vec![lv(100.0, 2.0), lv(99.0, 4.0)]);
        assert_eq!(asks, vec![lv(101.0, 3.0)]);
        assert_eq!(book.best_bid().unwrap().price, 100.0);
        assert_eq!(book.best_ask().unwrap().price, 101.0);
        assert!((book.spread_bps().unwrap() - 100.0).abs() < 1e-9);
        assert!(!book.is_snapshot());
    }

    #[test]
    fn stale_delta_after_snapshot_is_dropped() {
        let mut book = snapshot_book();
        let r = book
            .apply_delta(&BookDelta {
                bids: vec![lv(100.5, 9.0)],
                asks: vec![],
                first_seq: Some(9),
                last_seq: 10,
                prev_seq: None,
                timestamp: 999,
            })
            .unwrap();
        assert_eq!(r, ApplyResult::Stale);
        assert_eq!(book.best_bid().unwrap().price, 100.0);
        assert_eq!(book.sequence(), 10);
    }

    #[test]
    fn gap_detected_via_first_seq() {
        // seq 100 snapshot, deltas 101, 102, then 104 → gap.
        let mut book = OrderBook::new();
        book.apply_snapshot(vec![lv(100.0, 1.0)], vec![lv(101.0, 1.0)], 100, 0)
            .unwrap();

        for seq in [101u64, 102] {
            let r = book.apply_delta(&BookDelta {
                bids: vec![lv(100.0, 2.0)],
                asks: vec![],
                first_seq: Some(seq),
                last_seq: seq,
                prev_seq: None,
                timestamp: 0,
            });
            assert!(matches!(r, Ok(ApplyResult::Applied)));
        }

        let r = book.apply_delta(&BookDelta {
            bids: vec![lv(100.0, 3.0)],
            asks: vec![],
            first_seq: Some(104),
            last_seq: 104,
            prev_seq: None,
            timestamp: 0,
        });
        assert_eq!(
            r,
            Err(BookFault::SequenceGap {
                expected: 103,
                got: 104
            })
        );
    }

    #[test]
    fn gap_detected_via_prev_seq() {
        let mut book = snapshot_book();

        // First delta bridges the snapshot: prev_seq is not chained yet,
        // the first/last range check admits it.
        let r = book.apply_delta(&BookDelta {
            bids: vec![],
            asks: vec![lv(101.5, 1.0)],
            first_seq: Some(11),
            last_seq: 11,
            prev_seq: Some(7),
            timestamp: 0,
        });
        assert_eq!(r, Ok(ApplyResult::Applied));

        // From now on prev_seq must chain exactly.
        let r = book.apply_delta(&BookDelta {
            bids: vec![],
            asks: vec![lv(101.6, 1.0)],
            first_seq: Some(13),
            last_seq: 13,
            prev_seq: Some(12),
            timestamp: 0,
        });
        assert_eq!(
            r,
            Err(BookFault::SequenceGap {
                expected: 11,
                got: 12
            })
        );
    }

    #[test]
    fn rest_snapshot_bridge_accepts_covering_delta() {
        // REST snapshot at seq 1000; stream delta spans 998..=1005.
        let mut book = OrderBook::new();
        book.apply_snapshot(vec![lv(100.0, 1.0)], vec![lv(101.0, 1.0)], 1000, 0)
            .unwrap();

        let r = book.apply_delta(&BookDelta {
            bids: vec![lv(100.5, 2.0)],
            asks: vec![],
            first_seq: Some(998),
            last_seq: 1005,
            prev_seq: Some(990),
            timestamp: 0,
        });
        assert_eq!(r, Ok(ApplyResult::Applied));
        assert_eq!(book.sequence(), 1005);

        // A bridging delta that starts beyond the snapshot is a gap.
        let mut late = OrderBook::new();
        late.apply_snapshot(vec![lv(100.0, 1.0)], vec![lv(101.0, 1.0)], 1000, 0)
            .unwrap();
        let r = late.apply_delta(&BookDelta {
            bids: vec![],
            asks: vec![lv(101.5, 1.0)],
            first_seq: Some(1002),
            last_seq: 1003,
            prev_seq: Some(1001),
            timestamp: 0,
        });
        assert!(matches!(r, Err(BookFault::SequenceGap { .. })));
    }

    #[test]
    fn crossed_after_apply_is_a_fault() {
        let mut book = snapshot_book();
        let r = book.apply_delta(&BookDelta {
            bids: vec![lv(101.5, 1.0)],
            asks: vec![],
            first_seq: Some(11),
            last_seq: 11,
            prev_seq: None,
            timestamp: 0,
        });
        assert!(matches!(r, Err(BookFault::Crossed { .. })));
    }

    #[test]
    fn snapshot_repairs_unsorted_duplicated_input() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            vec![lv(99.0, 1.0), lv(100.0, 2.0), lv(99.0, 5.0), lv(98.0, 0.0)],
            vec![lv(102.0, 1.0), lv(101.0, 2.0)],
            1,
            0,
        )
        .unwrap();
        let (bids, asks) = book.top(10);
        // Deduped by price (last wins), sorted, zero qty dropped
        assert_eq!(bids, vec![lv(100.0, 2.0), lv(99.0, 5.0)]);
        assert_eq!(asks, vec![lv(101.0, 2.0), lv(102.0, 1.0)]);
    }

    #[test]
    fn delta_interleaving_equals_final_snapshot() {
        // A snapshot followed by inserts, updates and deletes must equal
        // a single snapshot of the final state.
        let mut incremental = OrderBook::new();
        incremental
            .apply_snapshot(
                vec![lv(100.0, 1.0), lv(99.0, 2.0), lv(98.0, 3.0)],
                vec![lv(101.0, 1.0), lv(102.0, 2.0)],
                1,
                0,
            )
            .unwrap();

        let deltas = [
            BookDelta {
                bids: vec![lv(99.0, 0.0)],          // delete
                asks: vec![lv(101.5, 4.0)],         // insert
                first_seq: Some(2),
                last_seq: 2,
                prev_seq: None,
                timestamp: 1,
            },
            BookDelta {
                bids: vec![lv(100.0, 7.0), lv(97.5, 1.0)], // update + insert
                asks: vec![lv(102.0, 0.0)],                // delete
                first_seq: Some(3),
                last_seq: 3,
                prev_seq: None,
                timestamp: 2,
            },
            BookDelta {
                bids: vec![lv(98.0, 0.5)],
                asks: vec![lv(101.0, 0.0), lv(103.0, 9.0)],
                first_seq: Some(4),
                last_seq: 4,
                prev_seq: None,
                timestamp: 3,
            },
        ];
        for d in &deltas {
            assert_eq!(incremental.apply_delta(d), Ok(ApplyResult::Applied));
        }

        let mut replacement = OrderBook::new();
        replacement
            .apply_snapshot(
                vec![lv(100.0, 7.0), lv(98.0, 0.5), lv(97.5, 1.0)],
                vec![lv(101.5, 4.0), lv(103.0, 9.0)],
                4,
                3,
            )
            .unwrap();

        assert_eq!(incremental.top(10), replacement.top(10));
        assert_eq!(incremental.sequence(), replacement.sequence());
    }
}
