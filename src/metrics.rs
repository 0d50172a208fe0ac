use crate::model::TimingStats;
use hdrhistogram::Histogram;

/// Compute timing statistics (mean, stddev, p50/p90/p99) from samples
pub fn compute_timing_stats(samples: &[i64]) -> Option<TimingStats> {
    if samples.len() < 2 {
        return None;
    }
    let mut hist = Histogram::<u64>::new(3).ok()?;
    for &s in samples {
        hist.record(s.max(0) as u64).ok()?;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    let variance = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Some(TimingStats {
        count: samples.len() as u64,
        mean,
        stddev: variance.sqrt(),
        p50: hist.value_at_quantile(0.50) as f64,
        p90: hist.value_at_quantile(0.90) as f64,
        p99: hist.value_at_quantile(0.99) as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_samples_yield_nothing() {
        assert!(compute_timing_stats(&[]).is_none());
        assert!(compute_timing_stats(&[42]).is_none());
    }

    #[test]
    fn stats_match_a_known_series() {
        let samples = vec![10, 10, 10, 10, 10, 10, 10, 10, 10, 100];
        let stats = compute_timing_stats(&samples).unwrap();
        assert_eq!(stats.count, 10);
        assert!((stats.mean - 19.0).abs() < 1e-9);
        assert!((stats.stddev - 27.0).abs() < 1e-9);
        assert_eq!(stats.p50, 10.0);
        assert_eq!(stats.p99, 100.0);
    }

    #[test]
    fn negative_samples_do_not_panic() {
        let stats = compute_timing_stats(&[-5, 20, 20]).unwrap();
        assert_eq!(stats.count, 3);
        assert!(stats.mean < 20.0);
    }
}
