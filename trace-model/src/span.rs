// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Meta key carrying the error marker. A span is errored iff the value is
/// non-empty.
pub const ERROR_KEY: &str = "error";

/// A single timed operation reported by an instrumented application.
///
/// `service` and `name` are normalized before aggregation; `resource` is an
/// uninterpreted blob used as an aggregation key and is never altered.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub r#type: String,
    /// Start of the span in nanoseconds since epoch.
    pub start: i64,
    /// Duration in nanoseconds. Non-negative after sanitization.
    pub duration: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

impl Span {
    /// End of the span in nanoseconds since epoch.
    #[inline]
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.duration)
    }

    /// Whether the span carries an error marker in its meta.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.meta.get(ERROR_KEY).is_some_and(|v| !v.is_empty())
    }

    /// Whether the span is the root of its trace.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}
