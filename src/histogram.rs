//! Fixed-bucket latency histogram.
//!
//! Buckets split `[0, range)` linearly; anything at or past `range` lands in
//! the last bucket. The histogram is a plain accumulator and does no I/O;
//! `render` produces the ASCII plot printed in the run report.

use std::fmt::Write;
use std::time::Duration;

/// Default number of buckets.
pub const DEFAULT_BUCKETS: usize = 100;

/// Buckets per axis tick in the rendered plot.
const TICK: usize = 10;

#[derive(Debug, Clone)]
pub struct Histogram {
    range: Duration,
    buckets: Vec<u64>,
}

impl Histogram {
    /// Create a histogram over `[0, range)` with the default bucket count.
    pub fn new(range: Duration) -> Self {
        Self::with_buckets(range, DEFAULT_BUCKETS)
    }

    /// Create a histogram with a custom bucket count.
    ///
    /// A zero bucket count is bumped to one.
    pub fn with_buckets(range: Duration, buckets: usize) -> Self {
        Self {
            range,
            buckets: vec![0; buckets.max(1)],
        }
    }

    /// Record one sample.
    pub fn record(&mut self, sample: Duration) {
        let idx = self.bucket_index(sample);
        self.buckets[idx] += 1;
    }

    /// Bucket a sample falls into.
    pub fn bucket_index(&self, sample: Duration) -> usize {
        let last = self.buckets.len() - 1;
        if self.range.is_zero() || sample >= self.range {
            return last;
        }
        let scaled = sample.as_secs_f64() / self.range.as_secs_f64() * self.buckets.len() as f64;
        (scaled as usize).min(last)
    }

    /// Total number of recorded samples.
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    #[cfg(test)]
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Render an ASCII density plot `lines` rows high.
    ///
    /// Columns are scaled so the fullest bucket reaches the top row. Each row
    /// ends with the bucket count it represents; the x axis is labelled in
    /// milliseconds.
    pub fn render(&self, lines: usize) -> String {
        let max = self.buckets.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return "(no samples)\n".to_string();
        }

        let lines = lines.max(1);
        let factor = lines as f64 / max as f64;
        let scaled: Vec<f64> = self.buckets.iter().map(|&v| v as f64 * factor).collect();

        let mut out = String::new();
        for scanline in (0..=lines).rev() {
            for value in &scaled {
                let v = value - scanline as f64;
                out.push(if v > 0.5 {
                    '#'
                } else if v > 0.0 {
                    '.'
                } else {
                    ' '
                });
            }
            let _ = writeln!(out, "| {}", (scanline as f64 / factor) as u64);
        }

        let n = self.buckets.len();
        for _ in (0..n).step_by(TICK) {
            out.push_str("+---------");
        }
        out.push_str("+\n");

        let mut tick = 0;
        while tick < n {
            let _ = write!(out, "{:<10}", self.label_ms(tick));
            tick += TICK;
        }
        let _ = writeln!(out, "{} msec", self.label_ms(tick));
        out
    }

    /// Millisecond value at the left edge of bucket `idx`.
    fn label_ms(&self, idx: usize) -> u64 {
        (idx as f64 * self.range.as_secs_f64() * 1000.0 / self.buckets.len() as f64) as u64
    }
}
