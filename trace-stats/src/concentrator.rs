// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The concentrator maintains the ordered set of open stats buckets covering
//! the recent past and decides which incoming spans still belong to one.

use std::collections::BTreeMap;
use std::time::{self, Duration, SystemTime};

use datadog_trace_model::Span;
use tracing::debug;

use crate::bucket::StatsBucket;

/// Default width of a stats bucket.
pub const DEFAULT_BUCKET_INTERVAL: Duration = Duration::from_secs(10);
/// Default maximum age of a span before it is discarded as a straggler.
pub const DEFAULT_OLDEST_SPAN_CUTOFF: Duration = Duration::from_secs(60);

/// Nanoseconds between `t` and the unix epoch, 0 if `t` is before the epoch.
pub fn system_time_to_unix_ns(t: SystemTime) -> i64 {
    match t.duration_since(time::UNIX_EPOCH) {
        Err(_) => 0,
        Ok(d) => d.as_nanos() as i64,
    }
}

/// Outcome of feeding one span to the concentrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanVerdict {
    /// The span landed in an open bucket. `keep` is set when the span marked
    /// its trace as worth forwarding in full (error span or quantile-band
    /// representative).
    Aggregated { keep: bool },
    /// The span arrived after its bucket's cutoff and was discarded.
    Straggler,
}

/// Time-bucketed aggregation of span statistics.
///
/// A single worker owns the concentrator; spans and flush ticks arrive on a
/// merged channel so all mutation is serial. Buckets are keyed by their
/// aligned start timestamp, which makes flush order monotonic in `start`.
#[derive(Clone, Debug)]
pub struct Concentrator {
    /// Bucket width in nanoseconds.
    bucket_interval: i64,
    /// Maximum time we wait before discarding straggling spans, in
    /// nanoseconds.
    cutoff: i64,
    eps: f64,
    /// Span meta keys aggregated as dimensions beyond the two defaults.
    extra_aggregators: Vec<String>,
    buckets: BTreeMap<i64, StatsBucket>,
    /// Buckets starting before this timestamp have been flushed and are
    /// immutable; spans targeting them are stragglers regardless of age.
    flushed_until: i64,
}

impl Concentrator {
    pub fn new(
        bucket_interval: Duration,
        cutoff: Duration,
        eps: f64,
        extra_aggregators: Vec<String>,
        now: SystemTime,
    ) -> Self {
        let bucket_interval = bucket_interval.as_nanos().max(1) as i64;
        let cutoff = cutoff.as_nanos() as i64;
        let now_ns = system_time_to_unix_ns(now);
        let mut concentrator = Self {
            bucket_interval,
            cutoff,
            eps,
            extra_aggregators,
            buckets: BTreeMap::new(),
            flushed_until: 0,
        };
        concentrator.flushed_until = concentrator.align(now_ns.saturating_sub(cutoff));
        concentrator
    }

    /// Align a timestamp on the start of its bucket.
    fn align(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.bucket_interval)
    }

    /// Width of the buckets, in nanoseconds.
    pub fn bucket_interval(&self) -> i64 {
        self.bucket_interval
    }

    /// Number of currently open buckets. Bounded by `cutoff / interval + 1`
    /// for spans within the acceptance window.
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Fold one span into its target bucket, or discard it as a straggler
    /// when the bucket is past the cutoff or already flushed.
    pub fn add_span(&mut self, span: &Span, now_ns: i64) -> SpanVerdict {
        let target = self.align(span.start);
        if now_ns.saturating_sub(target) > self.cutoff || target < self.flushed_until {
            return SpanVerdict::Straggler;
        }
        let (bucket_interval, eps) = (self.bucket_interval, self.eps);
        let keep = self
            .buckets
            .entry(target)
            .or_insert_with(|| StatsBucket::new(target, bucket_interval, eps))
            .handle_span(span, &self.extra_aggregators);
        SpanVerdict::Aggregated { keep }
    }

    /// Remove and return every bucket whose window closed more than the
    /// cutoff ago, oldest first. With `force`, every open bucket is flushed
    /// (shutdown path). Flushed buckets are immutable: late spans targeting
    /// them are discarded as stragglers.
    pub fn flush(&mut self, now_ns: i64, force: bool) -> Vec<StatsBucket> {
        let boundary = if force {
            i64::MAX
        } else {
            // start + duration + cutoff <= now
            now_ns.saturating_sub(self.cutoff + self.bucket_interval)
        };

        let mut flushed = Vec::new();
        while let Some((&start, _)) = self.buckets.first_key_value() {
            if start > boundary {
                break;
            }
            if let Some(bucket) = self.buckets.remove(&start) {
                self.flushed_until = self.flushed_until.max(start + self.bucket_interval);
                flushed.push(bucket);
            }
        }
        if !flushed.is_empty() {
            debug!(
                buckets = flushed.len(),
                open = self.buckets.len(),
                "flushed stats buckets"
            );
        }
        flushed
    }
}
