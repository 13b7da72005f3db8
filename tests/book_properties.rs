//! Book maintenance properties across snapshot/delta interleavings.

use md_ingest::book::{ApplyResult, BookDelta, BookFault, OrderBook};
use md_ingest::schema::PriceLevel;

fn lv(price: f64, qty: f64) -> PriceLevel {
    PriceLevel::new(price, qty)
}

#[test]
fn snapshot_delta_merge_scenario() {
    // Snapshot: bids [(100.0, 2.0), (99.5, 1.0)], asks [(101.0, 3.0)], seq=10.
    // Delta seq=11: delete 99.5, insert (99.0, 4.0).
    let mut book = OrderBook::new();
    book.apply_snapshot(
        vec![lv(100.0, 2.0), lv(99.5, 1.0)],
        vec![lv(101.0, 3.0)],
        10,
        1_700_000_000_000,
    )
    .unwrap();

    let result = book
        .apply_delta(&BookDelta {
            bids: vec![lv(99.5, 0.0), lv(99.0, 4.0)],
            asks: vec![],
            first_seq: Some(11),
            last_seq: 11,
            prev_seq: None,
            timestamp: 1_700_000_000_100,
        })
        .unwrap();
    assert_eq!(result, ApplyResult::Applied);

    let (bids, asks) = book.top(20);
    assert_eq!(bids, vec![lv(100.0, 2.0), lv(99.0, 4.0)]);
    assert_eq!(asks, vec![lv(101.0, 3.0)]);
    assert_eq!(book.best_bid().unwrap().price, 100.0);
    assert_eq!(book.best_ask().unwrap().price, 101.0);
    assert!((book.spread_bps().unwrap() - 100.0).abs() < 1e-9);
}

#[test]
fn gap_recovery_flow() {
    // Snapshot at seq=100, deltas 101, 102, then 104: the gap must be
    // detected; a refetched snapshot resumes the stream, and deltas at
    // or below the snapshot sequence are discarded.
    let mut book = OrderBook::new();
    book.apply_snapshot(vec![lv(100.0, 1.0)], vec![lv(101.0, 1.0)], 100, 0)
        .unwrap();

    for seq in [101u64, 102] {
        let r = book.apply_delta(&BookDelta {
            bids: vec![lv(100.0, seq as f64)],
            asks: vec![],
            first_seq: Some(seq),
            last_seq: seq,
            prev_seq: None,
            timestamp: 0,
        });
        assert_eq!(r, Ok(ApplyResult::Applied));
    }

    let gap = book.apply_delta(&BookDelta {
        bids: vec![lv(100.0, 9.0)],
        asks: vec![],
        first_seq: Some(104),
        last_seq: 104,
        prev_seq: None,
        timestamp: 0,
    });
    assert_eq!(
        gap,
        Err(BookFault::SequenceGap {
            expected: 103,
            got: 104
        })
    );

    // Session behavior on a fault: discard + REST snapshot refetch.
    let mut book = OrderBook::new();
    book.apply_snapshot(vec![lv(100.0, 5.0)], vec![lv(101.0, 5.0)], 105, 0)
        .unwrap();

    // A replayed delta at seq <= 105 is dropped...
    let stale = book.apply_delta(&BookDelta {
        bids: vec![lv(99.0, 1.0)],
        asks: vec![],
        first_seq: Some(104),
        last_seq: 104,
        prev_seq: None,
        timestamp: 0,
    });
    assert_eq!(stale, Ok(ApplyResult::Stale));
    assert_eq!(book.best_bid().unwrap().quantity, 5.0);

    // ...and streaming resumes with the first delta beyond it.
    let resumed = book.apply_delta(&BookDelta {
        bids: vec![lv(100.5, 2.0)],
        asks: vec![],
        first_seq: Some(106),
        last_seq: 106,
        prev_seq: None,
        timestamp: 0,
    });
    assert_eq!(resumed, Ok(ApplyResult::Applied));
    assert_eq!(book.best_bid().unwrap().price, 100.5);
}

/// Tiny deterministic LCG so the interleavings below are reproducible
/// without pulling randomness into the test.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn price(&mut self) -> f64 {
        // bid space below 100, ask space above 101
        (self.next() % 200) as f64 / 10.0
    }

    fn qty(&mut self) -> f64 {
        // ~1 in 4 operations is a deletion
        match self.next() % 4 {
            0 => 0.0,
            n => n as f64,
        }
    }
}

#[test]
fn random_interleavings_match_final_state_snapshot() {
    // Property: a snapshot followed by any in-order interleaving of
    // inserts, updates and deletes equals one snapshot of the final
    // state.
    for seed in [1u64, 7, 42, 1234, 99999] {
        let mut rng = Lcg(seed);
        let mut incremental = OrderBook::new();
        incremental
            .apply_snapshot(
                vec![lv(80.0, 1.0), lv(79.0, 2.0)],
                vec![lv(121.0, 1.0), lv(122.0, 2.0)],
                0,
                0,
            )
            .unwrap();

        // Shadow maps hold the expected final state
        let mut bid_map = std::collections::BTreeMap::new();
        let mut ask_map = std::collections::BTreeMap::new();
        bid_map.insert(800u64, lv(80.0, 1.0));
        bid_map.insert(790, lv(79.0, 2.0));
        ask_map.insert(1210u64, lv(121.0, 1.0));
        ask_map.insert(1220, lv(122.0, 2.0));

        for seq in 1..=200u64 {
            let bid = lv(50.0 + rng.price(), rng.qty());
            let ask = lv(121.0 + rng.price(), rng.qty());

            for (map, level) in [(&mut bid_map, bid), (&mut ask_map, ask)] {
                let key = (level.price * 10.0).round() as u64;
                if level.quantity > 0.0 {
                    map.insert(key, level);
                } else {
                    map.remove(&key);
                }
            }

            let r = incremental.apply_delta(&BookDelta {
                bids: vec![bid],
                asks: vec![ask],
                first_seq: Some(seq),
                last_seq: seq,
                prev_seq: None,
                timestamp: seq as i64,
            });
            assert_eq!(r, Ok(ApplyResult::Applied), "seed {seed} seq {seq}");
        }

        let mut replacement = OrderBook::new();
        replacement
            .apply_snapshot(
                bid_map.values().copied().collect(),
                ask_map.values().copied().collect(),
                200,
                200,
            )
            .unwrap();

        assert_eq!(
            incremental.top(1000),
            replacement.top(1000),
            "seed {seed}"
        );
    }
}

#[test]
fn quantities_always_positive_and_books_never_crossed() {
    let mut rng = Lcg(2024);
    let mut book = OrderBook::new();
    book.apply_snapshot(vec![lv(90.0, 1.0)], vec![lv(110.0, 1.0)], 0, 0)
        .unwrap();

    for seq in 1..=500u64 {
        let _ = book.apply_delta(&BookDelta {
            bids: vec![lv(50.0 + rng.price() / 2.0, rng.qty())],
            asks: vec![lv(105.0 + rng.price(), rng.qty())],
            first_seq: Some(seq),
            last_seq: seq,
            prev_seq: None,
            timestamp: seq as i64,
        });

        let (bids, asks) = book.top(1000);
        assert!(bids.iter().all(|l| l.quantity > 0.0));
        assert!(asks.iter().all(|l| l.quantity > 0.0));
        if let (Some(b), Some(a)) = (book.best_bid(), book.best_ask()) {
            assert!(b.price < a.price);
        }
        // Sides stay sorted
        assert!(bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(asks.windows(2).all(|w| w[0].price < w[1].price));
    }
}
