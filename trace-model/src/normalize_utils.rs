// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lossy normalization of the free-form identifiers that become metric
//! dimensions. Resources are deliberately left out of here: they are
//! aggregation keys and must stay byte-identical to what the tracer sent.

/// Maximum length of a normalized service name.
pub const MAX_SERVICE_LEN: usize = 100;
/// Maximum length of a normalized operation name.
pub const MAX_NAME_LEN: usize = 100;

/// Fallback service name when normalization leaves nothing.
pub const DEFAULT_SERVICE_NAME: &str = "unnamed-service";
/// Fallback operation name when normalization leaves nothing.
pub const DEFAULT_SPAN_NAME: &str = "unnamed_operation";

/// Normalize a free-form identifier into the `[a-z0-9_]` metric alphabet:
/// lowercase, runs of other characters collapsed to a single underscore,
/// leading and trailing underscores trimmed.
pub fn normalize_metric_name(name: &str) -> String {
    let truncated = truncate(name, MAX_NAME_LEN);
    let mut out = String::with_capacity(truncated.len());
    let mut pending_sep = false;
    for c in truncated.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Normalize a service identifier. Same alphabet as metric names.
pub fn normalize_service(service: &str) -> String {
    let normalized = normalize_metric_name(truncate(service, MAX_SERVICE_LEN));
    if normalized.is_empty() {
        return DEFAULT_SERVICE_NAME.to_string();
    }
    normalized
}

/// Normalize an operation name, falling back to a default when nothing
/// usable remains.
pub fn normalize_name(name: &str) -> String {
    let normalized = normalize_metric_name(name);
    if normalized.is_empty() {
        return DEFAULT_SPAN_NAME.to_string();
    }
    normalized
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    // cut on a char boundary
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
