// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counts and stats buckets.
//!
//! A [`Count`] accumulates one metric over one tag dimension; a
//! [`StatsBucket`] owns every count of a `[start, start+duration)` window,
//! keyed by the canonical [`count_key`] string.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use datadog_gksketch::GkSketch;
use datadog_trace_model::{Span, Tag};
use serde::Serialize;

pub const HITS: &str = "hits";
pub const ERRORS: &str = "errors";
pub const TIMES: &str = "times";

/// The metric behind a count. The variant decides how a span updates the
/// count and what keep bit `add` returns; the string name is only used for
/// serialization keys.
#[derive(Clone, Debug)]
pub enum Metric {
    Hits,
    Errors,
    /// Accumulated durations with an attached distribution sketch.
    Times(GkSketch),
}

impl Metric {
    /// Resolve a metric name, attaching a distribution with accuracy `eps`
    /// to `times`. Unknown names are rejected here so that [`Count::add`]
    /// stays total.
    pub fn from_name(name: &str, eps: f64) -> Result<Metric> {
        match name {
            HITS => Ok(Metric::Hits),
            ERRORS => Ok(Metric::Errors),
            TIMES => Ok(Metric::Times(GkSketch::new(eps))),
            _ => Err(anyhow!("unknown count metric '{name}'")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Hits => HITS,
            Metric::Errors => ERRORS,
            Metric::Times(_) => TIMES,
        }
    }
}

/// Canonical identity of a count within a bucket:
/// `metric:M|tags:k1=v1,k2=v2,...` with tags sorted on their rendering, so
/// the key is invariant under tag permutation.
pub fn count_key(metric: &str, tags: &[Tag]) -> String {
    let mut rendered: Vec<String> = tags.iter().map(|t| format!("{}={}", t.name, t.value)).collect();
    rendered.sort_unstable();
    format!("metric:{}|tags:{}", metric, rendered.join(","))
}

/// One metric accumulated over one tag dimension.
#[derive(Clone, Debug, Serialize)]
pub struct Count {
    pub name: &'static str,
    pub tags: Vec<Tag>,
    pub value: f64,
    #[serde(skip)]
    metric: Metric,
}

impl Count {
    fn new(metric: Metric, tags: Vec<Tag>) -> Self {
        Self {
            name: metric.name(),
            tags,
            value: 0.0,
            metric,
        }
    }

    /// Fold a span into the count and return the keep bit: `hits` and
    /// `errors` always keep, `times` keeps iff the distribution retained the
    /// sample as a quantile-band representative.
    pub fn add(&mut self, span: &Span) -> bool {
        match &mut self.metric {
            Metric::Hits => {
                self.value += 1.0;
                true
            }
            Metric::Errors => {
                self.value += 1.0;
                true
            }
            Metric::Times(distribution) => {
                self.value += span.duration as f64;
                distribution.insert(span.duration, span.trace_id)
            }
        }
    }

    /// The attached duration distribution, for `times` counts.
    pub fn distribution(&self) -> Option<&GkSketch> {
        match &self.metric {
            Metric::Times(distribution) => Some(distribution),
            _ => None,
        }
    }
}

/// Aggregated statistics over one half-open time window. Owned exclusively
/// by the concentrator between creation and flush.
#[derive(Clone, Debug, Serialize)]
pub struct StatsBucket {
    /// Window start, nanoseconds since epoch.
    pub start: i64,
    /// Window width in nanoseconds.
    pub duration: i64,
    #[serde(skip)]
    eps: f64,
    pub counts: HashMap<String, Count>,
}

impl StatsBucket {
    pub fn new(start: i64, duration: i64, eps: f64) -> Self {
        Self {
            start,
            duration,
            eps,
            counts: HashMap::new(),
        }
    }

    /// Fold a span into every dimension this bucket tracks: `{service}`,
    /// `{service, resource}`, and `{service, <key>}` for every extra
    /// aggregator key the span carries in its meta.
    ///
    /// Returns whether the span marked its trace as worth keeping in full:
    /// an error span, or a span retained by a `times` distribution. The
    /// unconditional `hits` keep bit does not participate, it would mark
    /// every trace.
    pub fn handle_span(&mut self, span: &Span, extra_aggregators: &[String]) -> bool {
        let service_tag = Tag::new("service", span.service.clone());

        let mut keep = self.add_in_dimension(span, vec![service_tag.clone()]);
        keep |= self.add_in_dimension(
            span,
            vec![
                service_tag.clone(),
                Tag::new("resource", span.resource.clone()),
            ],
        );

        for key in extra_aggregators {
            if let Some(value) = span.meta.get(key) {
                keep |= self.add_in_dimension(
                    span,
                    vec![service_tag.clone(), Tag::new(key.clone(), value.clone())],
                );
            }
        }
        keep
    }

    fn add_in_dimension(&mut self, span: &Span, tags: Vec<Tag>) -> bool {
        self.add_to_count(Metric::Hits, span, &tags);
        let mut keep = false;
        if span.is_error() {
            keep |= self.add_to_count(Metric::Errors, span, &tags);
        }
        keep |= self.add_to_count(Metric::Times(GkSketch::new(self.eps)), span, &tags);
        keep
    }

    fn add_to_count(&mut self, metric: Metric, span: &Span, tags: &[Tag]) -> bool {
        let key = count_key(metric.name(), tags);
        self.counts
            .entry(key)
            .or_insert_with(|| Count::new(metric, tags.to_vec()))
            .add(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(trace_id: u64, duration: i64, service: &str, resource: &str, error: bool) -> Span {
        let mut span = Span {
            trace_id,
            span_id: trace_id,
            service: service.to_string(),
            name: "query".to_string(),
            resource: resource.to_string(),
            start: 1_000,
            duration,
            ..Default::default()
        };
        if error {
            span.meta
                .insert("error".to_string(), "boom".to_string());
        }
        span
    }

    #[test]
    fn test_count_key_is_permutation_invariant() {
        let forward = vec![Tag::new("service", "web"), Tag::new("resource", "GET /")];
        let backward = vec![Tag::new("resource", "GET /"), Tag::new("service", "web")];
        assert_eq!(count_key(HITS, &forward), count_key(HITS, &backward));
        assert_eq!(
            count_key(HITS, &forward),
            "metric:hits|tags:resource=GET /,service=web"
        );
    }

    #[test]
    fn test_unknown_metric_is_rejected_at_construction() {
        assert!(Metric::from_name("latency", 0.01).is_err());
        assert!(Metric::from_name(TIMES, 0.01).is_ok());
    }

    #[test]
    fn test_hits_count_spans() {
        let mut bucket = StatsBucket::new(0, 10, 0.01);
        for i in 0..50 {
            bucket.handle_span(&span(i, 100, "web", "GET /", false), &[]);
        }
        let by_service = &bucket.counts[&count_key(HITS, &[Tag::new("service", "web")])];
        assert_eq!(by_service.value, 50.0);
        let by_resource = &bucket.counts[&count_key(
            HITS,
            &[Tag::new("service", "web"), Tag::new("resource", "GET /")],
        )];
        assert_eq!(by_resource.value, 50.0);
    }

    #[test]
    fn test_errors_only_counted_for_error_spans() {
        let mut bucket = StatsBucket::new(0, 10, 0.01);
        bucket.handle_span(&span(1, 100, "web", "GET /", false), &[]);
        bucket.handle_span(&span(2, 100, "web", "GET /", true), &[]);

        let errors = &bucket.counts[&count_key(ERRORS, &[Tag::new("service", "web")])];
        assert_eq!(errors.value, 1.0);
    }

    #[test]
    fn test_times_accumulate_and_attach_distribution() {
        let mut bucket = StatsBucket::new(0, 10, 0.01);
        let mut total = 0.0;
        for i in 1..=100 {
            bucket.handle_span(&span(i, i as i64, "web", "GET /", false), &[]);
            total += i as f64;
        }
        let times = &bucket.counts[&count_key(TIMES, &[Tag::new("service", "web")])];
        assert_eq!(times.value, total);
        let distribution = times.distribution().unwrap();
        assert_eq!(distribution.count(), 100);
        // median of 1..=100 within eps
        let median = distribution.quantile(0.5).unwrap();
        assert!((45..=55).contains(&median), "median {median}");
    }

    #[test]
    fn test_error_span_keeps_trace() {
        let mut bucket = StatsBucket::new(0, 10, 0.01);
        assert!(bucket.handle_span(&span(1, 100, "web", "GET /", true), &[]));
    }

    #[test]
    fn test_extra_aggregator_dimension() {
        let mut bucket = StatsBucket::new(0, 10, 0.01);
        let mut tagged = span(1, 100, "web", "GET /", false);
        tagged
            .meta
            .insert("version".to_string(), "v2".to_string());
        bucket.handle_span(&tagged, &["version".to_string()]);
        // an untagged span adds nothing in the extra dimension
        bucket.handle_span(&span(2, 100, "web", "GET /", false), &["version".to_string()]);

        let extra = &bucket.counts[&count_key(
            HITS,
            &[Tag::new("service", "web"), Tag::new("version", "v2")],
        )];
        assert_eq!(extra.value, 1.0);
    }

    #[test]
    fn test_counts_serialize_with_metric_name() {
        let mut bucket = StatsBucket::new(0, 10_000_000_000, 0.01);
        bucket.handle_span(&span(1, 100, "web", "GET /", false), &[]);
        let json = serde_json::to_value(&bucket).unwrap();
        assert_eq!(json["start"], 0);
        let counts = json["counts"].as_object().unwrap();
        assert!(counts
            .keys()
            .any(|k| k == &count_key(HITS, &[Tag::new("service", "web")])));
    }
}
