// Indicator Kernel - EMA and MACD enrichment over a candle sequence
// Pure function of its inputs; undefined inputs propagate as None

use crate::core::types::Candle;

/// EMA series with smoothing `2 / (n + 1)`, seeded by the simple mean of the
/// first `n` values. Entries before the seed window fills are `None`.
pub fn ema_series(values: &[f64], n: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if n == 0 || values.len() < n {
        return out;
    }
    let alpha = 2.0 / (n as f64 + 1.0);
    let seed = values[..n].iter().sum::<f64>() / n as f64;
    out[n - 1] = Some(seed);
    let mut prev = seed;
    for i in n..values.len() {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// EMA over a partially defined series. The defined region is contiguous at
/// the tail, so the recurrence runs over it and maps back in place.
fn ema_over_options(values: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let start = match values.iter().position(|v| v.is_some()) {
        Some(i) => i,
        None => return out,
    };
    let defined: Vec<f64> = values[start..].iter().map(|v| v.unwrap_or(0.0)).collect();
    for (i, v) in ema_series(&defined, n).into_iter().enumerate() {
        out[start + i] = v;
    }
    out
}

/// Enrich candles in place with EMA(7/25/99) and MACD(fast, slow, signal)
/// over closes. MACD line is EMA(fast) - EMA(slow); the signal line is an
/// EMA of the MACD line; the histogram is their difference. Values derived
/// from undefined inputs stay undefined.
pub fn enrich(candles: &mut [Candle], macd_fast: usize, macd_slow: usize, macd_signal: usize) {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let ema7 = ema_series(&closes, 7);
    let ema25 = ema_series(&closes, 25);
    let ema99 = ema_series(&closes, 99);

    let fast = ema_series(&closes, macd_fast);
    let slow = ema_series(&closes, macd_slow);
    let macd_line: Vec<Option<f64>> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();
    let signal_line = ema_over_options(&macd_line, macd_signal);

    for (i, candle) in candles.iter_mut().enumerate() {
        candle.ema7 = ema7[i];
        candle.ema25 = ema25[i];
        candle.ema99 = ema99[i];
        candle.macd_line = macd_line[i];
        candle.macd_signal = signal_line[i];
        candle.macd_hist = match (macd_line[i], signal_line[i]) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new("BTCUSDT", i as i64 * 60_000, c, c, c, c, 1.0, true))
            .collect()
    }

    #[test]
    fn test_ema_undefined_before_seed_window() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = ema_series(&values, 3);
        assert!(ema[0].is_none());
        assert!(ema[1].is_none());
        assert!(ema[2].is_some());
    }

    #[test]
    fn test_ema_seed_is_simple_mean() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        let ema = ema_series(&values, 3);
        assert_eq!(ema[2], Some(20.0));
        // alpha = 0.5: 0.5*40 + 0.5*20 = 30
        assert_eq!(ema[3], Some(30.0));
    }

    #[test]
    fn test_ema_of_constant_series_is_constant() {
        let values = vec![45.0; 120];
        for n in [7, 25, 99] {
            let ema = ema_series(&values, n);
            for v in ema.iter().skip(n - 1) {
                assert_eq!(*v, Some(45.0));
            }
        }
    }

    #[test]
    fn test_ema_series_shorter_than_period() {
        let values = vec![1.0, 2.0];
        assert!(ema_series(&values, 7).iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_enrich_sets_all_fields() {
        let mut candles = candles_from_closes(&vec![100.0; 150]);
        enrich(&mut candles, 12, 26, 9);

        let last = candles.last().unwrap();
        assert_eq!(last.ema7, Some(100.0));
        assert_eq!(last.ema25, Some(100.0));
        assert_eq!(last.ema99, Some(100.0));
        assert_eq!(last.macd_line, Some(0.0));
        assert_eq!(last.macd_signal, Some(0.0));
        assert_eq!(last.macd_hist, Some(0.0));

        // Head of the series stays undefined
        assert!(candles[0].ema7.is_none());
        assert!(candles[50].ema99.is_none());
    }

    #[test]
    fn test_macd_defined_after_slow_plus_signal_window() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let mut candles = candles_from_closes(&closes);
        enrich(&mut candles, 12, 26, 9);

        // MACD line appears once the slow EMA is seeded (index 25)
        assert!(candles[24].macd_line.is_none());
        assert!(candles[25].macd_line.is_some());
        // Signal line needs 9 MACD values on top of that (index 25 + 8)
        assert!(candles[32].macd_signal.is_none());
        assert!(candles[33].macd_signal.is_some());
        assert!(candles[33].macd_hist.is_some());
    }

    #[test]
    fn test_enrich_is_deterministic() {
        let closes: Vec<f64> = (0..130).map(|i| 100.0 + (i % 13) as f64).collect();
        let mut a = candles_from_closes(&closes);
        let mut b = candles_from_closes(&closes);
        enrich(&mut a, 12, 26, 9);
        enrich(&mut b, 12, 26, 9);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.ema7, y.ema7);
            assert_eq!(x.macd_signal, y.macd_signal);
        }
    }

    #[test]
    fn test_rising_series_ema7_above_ema25() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        let mut candles = candles_from_closes(&closes);
        enrich(&mut candles, 12, 26, 9);
        let last = candles.last().unwrap();
        assert!(last.ema7.unwrap() > last.ema25.unwrap());
        assert!(last.ema25.unwrap() > last.ema99.unwrap());
    }
}
