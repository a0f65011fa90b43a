// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::{DefaultHasher, Hash, Hasher};

use datadog_trace_model::Span;

/// Reduce a trace to a 64-bit signature of its shape: the sorted multiset of
/// `(service, name, resource, error)` tuples. Span order within the payload
/// does not matter.
pub fn trace_signature(trace: &[Span]) -> u64 {
    let mut fingerprints: Vec<u64> = trace.iter().map(span_fingerprint).collect();
    fingerprints.sort_unstable();

    let mut hasher = DefaultHasher::new();
    for fingerprint in fingerprints {
        fingerprint.hash(&mut hasher);
    }
    hasher.finish()
}

fn span_fingerprint(span: &Span) -> u64 {
    let mut hasher = DefaultHasher::new();
    span.service.hash(&mut hasher);
    span.name.hash(&mut hasher);
    span.resource.hash(&mut hasher);
    span.is_error().hash(&mut hasher);
    hasher.finish()
}
