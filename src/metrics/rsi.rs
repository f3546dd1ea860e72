// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Edge policy: a missing or broken input never surfaces as NaN/Inf or an
// error — the caller always gets a value in [0, 100], with 50 standing in
// for "not enough information to say".
// =============================================================================

/// Domain-neutral RSI returned when the sample is too short or degenerate.
pub const NEUTRAL_RSI: f64 = 50.0;

/// Compute the latest RSI over `closes` for the given `period`.
///
/// # Edge cases
/// - `period == 0` or fewer than `period + 1` closes => [`NEUTRAL_RSI`]
///   (need at least `period` deltas to seed the averages).
/// - No movement at all (`avg_gain == avg_loss == 0`) => [`NEUTRAL_RSI`].
/// - No down moves (`avg_loss == 0`) => 100.0, not infinity.
/// - The result is clamped to [0, 100] and is never NaN/Inf.
pub fn latest_rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return NEUTRAL_RSI;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    // Seed averages with the SMA of the first `period` deltas.
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    // Wilder's smoothing for the remaining deltas.
    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    rsi_from_averages(avg_gain, avg_loss)
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        NEUTRAL_RSI // No movement at all.
    } else if avg_loss == 0.0 {
        100.0 // All gains, no losses.
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if rsi.is_finite() {
        rsi.clamp(0.0, 100.0)
    } else {
        NEUTRAL_RSI
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input_is_neutral() {
        assert!((latest_rsi(&[], 14) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rsi_period_zero_is_neutral() {
        assert!((latest_rsi(&[1.0, 2.0, 3.0], 0) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rsi_insufficient_data_is_neutral() {
        // 14 closes => 13 deltas < period 14.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!((latest_rsi(&closes, 14) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rsi_single_sample_is_neutral() {
        assert!((latest_rsi(&[42.0], 14) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!((latest_rsi(&closes, 14) - 100.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(latest_rsi(&closes, 14).abs() < 1e-10);
    }

    #[test]
    fn rsi_constant_prices_is_exactly_neutral() {
        // 20 identical closes => avg_gain = avg_loss = 0 => neutral branch,
        // not a division by zero, for any period <= history length.
        let closes = vec![100.0; 20];
        for period in [2, 5, 14, 19] {
            let rsi = latest_rsi(&closes, period);
            assert!((rsi - 50.0).abs() < f64::EPSILON, "period {period}: {rsi}");
        }
    }

    #[test]
    fn rsi_always_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for period in 1..closes.len() {
            let rsi = latest_rsi(&closes, period);
            assert!((0.0..=100.0).contains(&rsi), "period {period}: {rsi}");
            assert!(rsi.is_finite());
        }
    }

    #[test]
    fn rsi_known_sequence() {
        // Mixed gains and losses — must land strictly between the extremes.
        let closes = vec![10.0, 11.0, 10.5, 11.5, 11.0, 12.0, 11.8, 12.5, 12.2, 13.0];
        let rsi = latest_rsi(&closes, 5);
        assert!(rsi > 50.0 && rsi < 100.0, "uptrend with pullbacks: {rsi}");
    }
}
