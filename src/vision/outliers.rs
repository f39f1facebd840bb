//! Interquartile-range outlier rejection.
//!
//! Each motion dimension (x, y, scale change) is filtered independently:
//! values outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]` are discarded and the
//! aggregate is the mean of the survivors.

/// Whisker multiplier of the classic Tukey fence.
const IQR_FACTOR: f64 = 1.5;

/// Mean of the values surviving IQR rejection, 0.0 for an empty input or
/// when no value survives.
pub fn iqr_filtered_mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);

    let q1 = percentile(&sorted, 25.0);
    let q3 = percentile(&sorted, 75.0);
    let iqr = q3 - q1;
    let lower = q1 - IQR_FACTOR * iqr;
    let upper = q3 + IQR_FACTOR * iqr;

    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in &sorted {
        if v >= lower && v <= upper {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Percentile with linear interpolation between closest ranks, over an
/// already sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
