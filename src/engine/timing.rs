use serde::Serialize;
use std::time::Duration;

/// Summary statistics over a set of request durations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingStats {
    pub count: u64,
    pub mean: Duration,
    /// Variance in seconds squared.
    pub variance: f64,
    pub stddev: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

#[derive(Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn variance(&self, sample: bool) -> f64 {
        let divisor = if sample {
            self.count.saturating_sub(1)
        } else {
            self.count
        };
        if divisor == 0 {
            return 0.0;
        }
        self.m2 / divisor as f64
    }
}

fn nanos(duration: &Duration) -> f64 {
    duration.as_nanos() as f64
}

fn from_nanos(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_nanos(value.round() as u64)
    } else {
        Duration::ZERO
    }
}

fn sorted_nanos(timings: &[Duration]) -> Vec<f64> {
    let mut values: Vec<f64> = timings.iter().map(nanos).collect();
    values.sort_by(f64::total_cmp);
    values
}

/// Linear interpolation at position `p·(n−1)` of an ascending slice.
fn interpolate(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let position = p.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let weight = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Mean, variance (sample when `sample`, population otherwise), extremes and
/// interpolated P50/P90/P99. `None` for an empty set.
pub fn stats(timings: &[Duration], sample: bool) -> Option<TimingStats> {
    if timings.is_empty() {
        return None;
    }

    let mut running = RunningStats::default();
    for timing in timings {
        running.add(nanos(timing));
    }
    let sorted = sorted_nanos(timings);

    let variance_nanos = running.variance(sample);
    Some(TimingStats {
        count: running.count,
        mean: from_nanos(running.mean),
        variance: variance_nanos / 1e18,
        stddev: from_nanos(variance_nanos.sqrt()),
        min: from_nanos(running.min),
        max: from_nanos(running.max),
        p50: from_nanos(interpolate(&sorted, 0.50)),
        p90: from_nanos(interpolate(&sorted, 0.90)),
        p99: from_nanos(interpolate(&sorted, 0.99)),
    })
}

/// Interpolated percentile, `p` in `[0, 1]`.
pub fn percentile(timings: &[Duration], p: f64) -> Option<Duration> {
    if timings.is_empty() {
        return None;
    }
    let p = if p.is_finite() { p } else { 0.0 };
    Some(from_nanos(interpolate(&sorted_nanos(timings), p)))
}

/// Ascending tail at or above the `p` percentile, ties with the threshold
/// included. `p` is clamped to `[0, 1]`; NaN and infinities count as 0.
pub fn outliers(timings: &[Duration], p: f64) -> Vec<Duration> {
    let mut sorted = timings.to_vec();
    sorted.sort();
    if sorted.is_empty() {
        return sorted;
    }

    let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
    if p <= 0.0 {
        return sorted;
    }

    let values: Vec<f64> = sorted.iter().map(nanos).collect();
    let threshold = interpolate(&values, p);
    let mut start = values.partition_point(|value| *value < threshold);
    while start > 0 && values[start - 1] == threshold {
        start -= 1;
    }
    sorted.split_off(start)
}
