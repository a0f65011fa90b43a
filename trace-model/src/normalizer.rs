// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation and in-place normalization of incoming traces.
//!
//! Malformed spans are dropped with a typed reason so the receiver can keep
//! per-reason counters; a payload trace with zero surviving spans is dropped
//! entirely by the caller.

use crate::normalize_utils;
use crate::span::Span;
use crate::trace::Trace;

/// Why a span was rejected during sanitization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DropReason {
    TraceIdZero,
    SpanIdZero,
    ForeignSpan,
    EmptyService,
    InvalidDuration,
    InvalidStart,
}

impl DropReason {
    /// Stable identifier used as a metric tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::TraceIdZero => "trace_id_zero",
            DropReason::SpanIdZero => "span_id_zero",
            DropReason::ForeignSpan => "foreign_span",
            DropReason::EmptyService => "empty_service",
            DropReason::InvalidDuration => "invalid_duration",
            DropReason::InvalidStart => "invalid_start",
        }
    }
}

fn validate_span(span: &Span, trace_id: u64, now_ns: i64, cutoff_ns: i64) -> Option<DropReason> {
    if span.trace_id == 0 {
        return Some(DropReason::TraceIdZero);
    }
    if span.span_id == 0 {
        return Some(DropReason::SpanIdZero);
    }
    if span.trace_id != trace_id {
        return Some(DropReason::ForeignSpan);
    }
    if span.service.trim().is_empty() {
        return Some(DropReason::EmptyService);
    }
    if span.duration <= 0 {
        return Some(DropReason::InvalidDuration);
    }
    if span.start <= 0 || span.start.checked_add(span.duration).is_none() {
        return Some(DropReason::InvalidStart);
    }
    // anything older than the concentrator's acceptance window can only ever
    // be a straggler, refuse it at the door
    if span.start < now_ns.saturating_sub(cutoff_ns) {
        return Some(DropReason::InvalidStart);
    }
    None
}

fn normalize_span(span: &mut Span) {
    span.service = normalize_utils::normalize_service(&span.service);
    span.name = normalize_utils::normalize_name(&span.name);
    // resource is an aggregation key, leave it byte-identical

    // zipkin-style root spans are their own parent
    if span.parent_id == span.span_id {
        span.parent_id = 0;
    }
}

/// Validate and normalize one decoded trace.
///
/// Returns the surviving spans (normalized in place) and the drop reason for
/// every rejected span, in payload order. The first span's trace id is
/// authoritative: spans with a different id are dropped as foreign.
pub fn sanitize_trace(
    spans: Vec<Span>,
    now_ns: i64,
    cutoff_ns: i64,
) -> (Trace, Vec<DropReason>) {
    let mut drops = Vec::new();
    let trace_id = match spans.iter().find(|s| s.trace_id != 0) {
        Some(span) => span.trace_id,
        None => {
            drops.extend(spans.iter().map(|_| DropReason::TraceIdZero));
            return (Vec::new(), drops);
        }
    };

    let mut trace = Vec::with_capacity(spans.len());
    for mut span in spans {
        match validate_span(&span, trace_id, now_ns, cutoff_ns) {
            Some(reason) => drops.push(reason),
            None => {
                normalize_span(&mut span);
                trace.push(span);
            }
        }
    }
    (trace, drops)
}
