use std::cmp::Ordering;

use crate::config::ScoreWeights;
use crate::schema::SpreadTick;

/// Composite ranking score of a spread row:
///
///   score = spread_bps
///         + funding_weight * net_funding_bps_per_day
///         - depth_weight / min_depth_usd
///
/// Monotone in all three inputs: wider spread, more favourable funding
/// and deeper books all rank higher. Weights come from configuration;
/// the formula itself is fixed so that rows from different processes
/// rank identically.
pub fn composite_score(
    spread_bps: f64,
    net_funding_bps_per_day: f64,
    min_depth_usd: f64,
    weights: ScoreWeights,
) -> f64 {
    let depth_penalty = if min_depth_usd > 0.0 {
        weights.depth_weight / min_depth_usd
    } else {
        f64::INFINITY
    };
    spread_bps + weights.funding_weight * net_funding_bps_per_day - depth_penalty
}

/// Sorts a ranked list in emission order.
///
/// Ordering: score descending; ties broken by spread_bps descending,
/// then min_depth descending, then (long, short) lexicographic so that
/// equal rows order deterministically.
pub fn rank(ticks: &mut [SpreadTick]) {
    ticks.sort_by(compare);
}

fn compare(a: &SpreadTick, b: &SpreadTick) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.spread_bps.total_cmp(&a.spread_bps))
        .then_with(|| b.min_depth_usd.total_cmp(&a.min_depth_usd))
        .then_with(|| {
            (a.long_exchange.as_str(), a.short_exchange.as_str())
                .cmp(&(b.long_exchange.as_str(), b.short_exchange.as_str()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExchangeId;

    fn tick(
        long: ExchangeId,
        short: ExchangeId,
        score: f64,
        spread_bps: f64,
        depth: f64,
    ) -> SpreadTick {
        SpreadTick {
            id: format!("BTC:{long}:{short}"),
            canonical: "BTC".into(),
            long_exchange: long,
            short_exchange: short,
            long_symbol: String::new(),
            short_symbol: String::new(),
            long_price: 0.0,
            short_price: 0.0,
            spread_percent: spread_bps / 100.0,
            spread_bps,
            long_funding: 0.0,
            short_funding: 0.0,
            net_funding: 0.0,
            long_depth_usd: depth,
            short_depth_usd: depth,
            min_depth_usd: depth,
            volume_24h: 0.0,
            score,
            updated_at: 0,
        }
    }

    #[test]
    fn score_is_monotone() {
        let w = ScoreWeights::default();
        let base = composite_score(10.0, 0.0, 10_000.0, w);
        assert!(composite_score(11.0, 0.0, 10_000.0, w) > base);
        assert!(composite_score(10.0, 1.0, 10_000.0, w) > base);
        assert!(composite_score(10.0, 0.0, 20_000.0, w) > base);
        // Zero depth is never rankable
        assert_eq!(
            composite_score(10.0, 0.0, 0.0, w),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn ordering_and_tie_breaks() {
        let mut ticks = vec![
            tick(ExchangeId::Okx, ExchangeId::Bybit, 5.0, 4.0, 100.0),
            tick(ExchangeId::Binance, ExchangeId::Okx, 9.0, 4.0, 100.0),
            // Same score: wider spread first
            tick(ExchangeId::Bybit, ExchangeId::Okx, 5.0, 6.0, 100.0),
            // Same score and spread: deeper first
            tick(ExchangeId::Gateio, ExchangeId::Okx, 5.0, 4.0, 900.0),
            // Full tie with row 0 except venue pair: lexicographic
            tick(ExchangeId::Binance, ExchangeId::Bybit, 5.0, 4.0, 100.0),
        ];
        rank(&mut ticks);

        let order: Vec<(ExchangeId, ExchangeId)> = ticks
            .iter()
            .map(|t| (t.long_exchange, t.short_exchange))
            .collect();
        assert_eq!(
            order,
            vec![
                (ExchangeId::Binance, ExchangeId::Okx),
                (ExchangeId::Bybit, ExchangeId::Okx),
                (ExchangeId::Gateio, ExchangeId::Okx),
                (ExchangeId::Binance, ExchangeId::Bybit),
                (ExchangeId::Okx, ExchangeId::Bybit),
            ]
        );
    }
}
