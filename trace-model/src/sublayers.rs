// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sublayer computation: for every span of a trace, the wall-clock time not
//! covered by its synchronous children, aggregated by span type and by
//! service.

use std::collections::HashMap;
use std::fmt;

use crate::span::Span;
use crate::tag::Tag;
use crate::trace::{children_map, covered_duration};

pub const METRIC_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";
pub const METRIC_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
pub const METRIC_SPAN_COUNT: &str = "_sublayers.span_count";
/// Per-span metric carrying the exclusive duration.
pub const METRIC_SPAN_DURATION: &str = "_sublayers.duration";

/// One flat row emitted per `(type)` or `(service)` after computation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SublayerValue {
    pub metric: String,
    pub tag: Tag,
    pub value: f64,
}

impl fmt::Display for SublayerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.name.is_empty() {
            return write!(f, "SublayerValue{{{:?}, {}}}", self.metric, self.value);
        }
        write!(
            f,
            "SublayerValue{{{:?}, {}, {}}}",
            self.metric, self.tag, self.value
        )
    }
}

/// Compute the sublayer values of a trace.
///
/// Returns the aggregated rows (duration by type, duration by service, span
/// count) together with the exclusive duration of every span, keyed by span
/// id.
///
/// A child is synchronous iff it ends within its parent's lifetime
/// (`child.end() <= parent.end()` and `child.end() >= parent.start`); other
/// children are fire-and-forget and contribute nothing to the parent's
/// covered time. Covered time is the length of the union of the clipped
/// child intervals, so overlapping children are not double counted.
pub fn compute_sublayers(trace: &[Span]) -> (Vec<SublayerValue>, HashMap<u64, i64>) {
    let children = children_map(trace);

    let mut type_duration: HashMap<&str, f64> = HashMap::new();
    let mut service_duration: HashMap<&str, f64> = HashMap::new();
    let mut exclusive: HashMap<u64, i64> = HashMap::with_capacity(trace.len());

    for span in trace {
        let synchronous_children = children
            .get(&span.span_id)
            .into_iter()
            .flatten()
            .map(|&i| &trace[i])
            .filter(|child| child.end() <= span.end() && child.end() >= span.start);

        let covered = covered_duration(synchronous_children, span.start);
        let duration = (span.duration - covered).max(0);
        exclusive.insert(span.span_id, duration);

        *type_duration.entry(span.r#type.as_str()).or_default() += duration as f64;
        *service_duration.entry(span.service.as_str()).or_default() += duration as f64;
    }

    let mut values = Vec::with_capacity(type_duration.len() + service_duration.len() + 1);
    for (span_type, duration) in type_duration {
        values.push(SublayerValue {
            metric: METRIC_DURATION_BY_TYPE.to_string(),
            tag: Tag::new("sublayer_type", span_type),
            value: duration,
        });
    }
    for (service, duration) in service_duration {
        values.push(SublayerValue {
            metric: METRIC_DURATION_BY_SERVICE.to_string(),
            tag: Tag::new("sublayer_service", service),
            value: duration,
        });
    }
    values.push(SublayerValue {
        metric: METRIC_SPAN_COUNT.to_string(),
        tag: Tag::default(),
        value: trace.len() as f64,
    });

    (values, exclusive)
}

/// Pin the aggregated sublayer values on a span's metrics map, under
/// `metric.tagname:tagvalue` keys.
pub fn set_sublayers_on_span(span: &mut Span, values: &[SublayerValue]) {
    for value in values {
        let key = if value.tag.name.is_empty() {
            value.metric.clone()
        } else {
            format!("{}.{}", value.metric, value.tag)
        };
        span.metrics.insert(key, value.value);
    }
}

/// Attach the exclusive duration of each span as `_sublayers.duration`.
pub fn set_exclusive_durations(trace: &mut [Span], exclusive: &HashMap<u64, i64>) {
    for span in trace.iter_mut() {
        if let Some(duration) = exclusive.get(&span.span_id) {
            span.metrics
                .insert(METRIC_SPAN_DURATION.to_string(), *duration as f64);
        }
    }
}
