// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A streaming quantile summary in the Greenwald-Khanna style.
//!
//! After `n` insertions, a query at rank `r` returns a value whose true rank
//! lies within `[r - eps*n, r + eps*n]`. Each retained tuple carries the
//! trace id of one of the samples it summarizes, so a caller can always name
//! a concrete trace representing a quantile band.

/// Default relative rank accuracy used by the stats pipeline.
pub const DEFAULT_EPSILON: f64 = 0.01;

#[derive(Clone, Debug)]
struct Entry {
    /// Sample value.
    v: i64,
    /// Number of samples summarized by this tuple.
    g: u64,
    /// Rank uncertainty of this tuple.
    delta: u64,
    /// Trace id of one sample summarized by this tuple.
    trace_id: u64,
}

/// An epsilon-approximate quantile summary over `(value, trace_id)` samples.
#[derive(Clone, Debug)]
pub struct GkSketch {
    eps: f64,
    n: u64,
    /// Tuples sorted by value.
    entries: Vec<Entry>,
    inserts_since_compress: u64,
}

impl GkSketch {
    /// Build a sketch with the given rank accuracy. `eps` is clamped into
    /// `(0, 0.5)`.
    pub fn new(eps: f64) -> Self {
        let eps = if eps > 0.0 && eps < 0.5 {
            eps
        } else {
            DEFAULT_EPSILON
        };
        Self {
            eps,
            n: 0,
            entries: Vec::new(),
            inserts_since_compress: 0,
        }
    }

    /// Rank accuracy of this sketch.
    pub fn epsilon(&self) -> f64 {
        self.eps
    }

    /// Number of samples inserted.
    pub fn count(&self) -> u64 {
        self.n
    }

    /// Number of tuples currently retained.
    pub fn retained(&self) -> usize {
        self.entries.len()
    }

    fn compress_period(&self) -> u64 {
        ((1.0 / (2.0 * self.eps)).floor() as u64).max(1)
    }

    /// Insert a sample. Returns whether the sample became a retained
    /// representative: a new tuple of the summary carrying `trace_id`. An
    /// interior sample whose rank band is already covered by an existing
    /// tuple is absorbed into it and not retained.
    pub fn insert(&mut self, v: i64, trace_id: u64) -> bool {
        self.n += 1;
        self.inserts_since_compress += 1;
        let threshold = (2.0 * self.eps * self.n as f64).floor() as u64;
        let idx = self.entries.partition_point(|e| e.v < v);

        // absorb interior samples into the succeeding tuple when its rank
        // band can take one more observation
        if idx > 0 && idx < self.entries.len() {
            let successor = &mut self.entries[idx];
            if successor.g + successor.delta + 1 <= threshold {
                successor.g += 1;
                self.maybe_compress();
                return false;
            }
        }

        let delta = if idx == 0 || idx == self.entries.len() {
            0
        } else {
            threshold.saturating_sub(1)
        };
        self.entries.insert(
            idx,
            Entry {
                v,
                g: 1,
                delta,
                trace_id,
            },
        );
        if self.inserts_since_compress >= self.compress_period() {
            self.inserts_since_compress = 0;
            self.compress();
            return self.entries.iter().any(|e| e.trace_id == trace_id);
        }
        true
    }

    fn maybe_compress(&mut self) {
        if self.inserts_since_compress >= self.compress_period() {
            self.inserts_since_compress = 0;
            self.compress();
        }
    }

    /// Merge another summary into this one. Both sides must share the same
    /// epsilon; the merged summary answers queries over the union of the two
    /// sample streams.
    pub fn merge(&mut self, other: &GkSketch) {
        debug_assert!((self.eps - other.eps).abs() < f64::EPSILON);
        if other.entries.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(self.entries.len() + other.entries.len());
        {
            let mut left = self.entries.drain(..).peekable();
            let mut right = other.entries.iter().cloned().peekable();
            loop {
                let take_left = match (left.peek(), right.peek()) {
                    (Some(l), Some(r)) => l.v <= r.v,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                let next = if take_left { left.next() } else { right.next() };
                if let Some(entry) = next {
                    merged.push(entry);
                }
            }
        }
        self.entries = merged;
        self.n += other.n;
        self.compress();
    }

    /// Value answering a quantile query, `q` in `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<i64> {
        self.representative(q).map(|(v, _)| v)
    }

    /// Value answering a quantile query together with the trace id retained
    /// for that quantile band.
    pub fn representative(&self, q: f64) -> Option<(i64, u64)> {
        let last = self.entries.last()?;
        let q = q.clamp(0.0, 1.0);
        // the first and last tuples are never merged away, so the extremes
        // are answered exactly
        if q <= 0.0 {
            let first = &self.entries[0];
            return Some((first.v, first.trace_id));
        }
        if q >= 1.0 {
            return Some((last.v, last.trace_id));
        }
        let rank = ((q * self.n as f64).ceil() as u64).max(1);
        let allowed = (self.eps * self.n as f64).ceil() as u64;

        let mut rmin = 0u64;
        let mut prev = &self.entries[0];
        for entry in &self.entries {
            rmin += entry.g;
            if rmin + entry.delta > rank + allowed {
                return Some((prev.v, prev.trace_id));
            }
            prev = entry;
        }
        Some((last.v, last.trace_id))
    }

    /// Merge adjacent tuples whose combined span of ranks stays within the
    /// error budget. The first and last tuples are kept so the extremes stay
    /// exact.
    fn compress(&mut self) {
        if self.entries.len() <= 2 {
            return;
        }
        let threshold = (2.0 * self.eps * self.n as f64).floor() as u64;
        let mut i = self.entries.len() - 2;
        while i >= 1 {
            let merged_g = self.entries[i].g + self.entries[i + 1].g;
            if merged_g + self.entries[i + 1].delta <= threshold {
                self.entries[i + 1].g = merged_g;
                self.entries.remove(i);
            }
            i -= 1;
        }
    }
}

impl Default for GkSketch {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}
