// Resampler - Synthesizes non-native intervals from a native base series
// Bucket aggregation keyed by floor(open_time / target_width)

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::core::types::{Candle, Interval};

/// Aggregate base-interval candles into a target interval.
///
/// Each base candle lands in the bucket `floor(t / target_ms) * target_ms`.
/// The first candle of a bucket seeds OHLCV; later candles raise the high,
/// lower the low, replace the close and accumulate volume. A bucket closes
/// once it contains a closed base candle whose end reaches the bucket's end.
/// Output is sorted by bucket start time. Resampling to the base interval is
/// the identity.
pub fn resample(base: &[Candle], base_interval: Interval, target_interval: Interval) -> Vec<Candle> {
    if base_interval == target_interval {
        return base.to_vec();
    }

    let target_ms = target_interval.width_ms();
    let base_ms = base_interval.width_ms();
    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();

    for c in base {
        let bucket = c.open_time.div_euclid(target_ms) * target_ms;
        let agg = match buckets.entry(bucket) {
            Entry::Vacant(slot) => slot.insert(Candle::new(
                c.symbol.clone(),
                bucket,
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume,
                false,
            )),
            Entry::Occupied(slot) => {
                let agg = slot.into_mut();
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
                agg.volume += c.volume;
                agg
            }
        };
        if c.is_closed && c.open_time + base_ms >= bucket + target_ms {
            agg.is_closed = true;
        }
    }

    buckets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64, o: f64, h: f64, l: f64, c: f64, v: f64, closed: bool) -> Candle {
        Candle::new("BTCUSDT", t, o, h, l, c, v, closed)
    }

    fn minute_series(count: i64) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(i * 60_000, base, base + 2.0, base - 2.0, base + 1.0, 10.0, true)
            })
            .collect()
    }

    #[test]
    fn test_identity_on_equal_intervals() {
        let base = minute_series(7);
        let out = resample(&base, Interval::M1, Interval::M1);
        assert_eq!(out.len(), base.len());
        for (a, b) in out.iter().zip(base.iter()) {
            assert_eq!(a.open_time, b.open_time);
            assert_eq!(a.close, b.close);
        }
    }

    #[test]
    fn test_buckets_align_to_target_width() {
        let base = minute_series(10);
        let out = resample(&base, Interval::M1, Interval::M2);
        assert_eq!(out.len(), 5);
        for c in &out {
            assert_eq!(c.open_time % Interval::M2.width_ms(), 0);
        }
    }

    #[test]
    fn test_ohlcv_aggregation() {
        // Two 1m candles into one 2m bucket
        let base = vec![
            candle(0, 100.0, 105.0, 99.0, 104.0, 10.0, true),
            candle(60_000, 104.0, 110.0, 103.0, 108.0, 15.0, true),
        ];
        let out = resample(&base, Interval::M1, Interval::M2);
        assert_eq!(out.len(), 1);
        let agg = &out[0];
        assert_eq!(agg.open_time, 0);
        assert_eq!(agg.open, 100.0);
        assert_eq!(agg.high, 110.0);
        assert_eq!(agg.low, 99.0);
        assert_eq!(agg.close, 108.0);
        assert_eq!(agg.volume, 25.0);
        assert!(agg.is_closed);
    }

    #[test]
    fn test_aggregate_extremes_dominate_base() {
        let base = minute_series(45);
        let out = resample(&base, Interval::M1, Interval::M45);
        assert_eq!(out.len(), 1);
        let agg = &out[0];
        let max_high = base.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let min_low = base.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        assert!(agg.high >= max_high);
        assert!(agg.low <= min_low);
    }

    #[test]
    fn test_bucket_stays_open_until_last_base_closes() {
        // First of two 1m candles in a 2m bucket: closed, but its end does
        // not reach the bucket end, so the bucket stays open.
        let base = vec![candle(0, 100.0, 101.0, 99.0, 100.5, 10.0, true)];
        let out = resample(&base, Interval::M1, Interval::M2);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_closed);

        // Second candle still streaming: bucket remains open.
        let base = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5, 10.0, true),
            candle(60_000, 100.5, 102.0, 100.0, 101.0, 5.0, false),
        ];
        let out = resample(&base, Interval::M1, Interval::M2);
        assert!(!out[0].is_closed);

        // Second candle closed: its end reaches the bucket end, bucket closes.
        let base = vec![
            candle(0, 100.0, 101.0, 99.0, 100.5, 10.0, true),
            candle(60_000, 100.5, 102.0, 100.0, 101.0, 5.0, true),
        ];
        let out = resample(&base, Interval::M1, Interval::M2);
        assert!(out[0].is_closed);
    }

    #[test]
    fn test_partial_tail_bucket() {
        // 3 one-minute candles into 2m: second bucket only half filled
        let base = minute_series(3);
        let out = resample(&base, Interval::M1, Interval::M2);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_closed);
        assert!(!out[1].is_closed);
        assert_eq!(out[1].open_time, 2 * 60_000);
        assert_eq!(out[1].volume, 10.0);
    }

    #[test]
    fn test_output_sorted_by_bucket() {
        let base = minute_series(20);
        let out = resample(&base, Interval::M1, Interval::M5);
        for pair in out.windows(2) {
            assert!(pair[0].open_time < pair[1].open_time);
        }
    }
}
