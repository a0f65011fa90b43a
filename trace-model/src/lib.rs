// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized span/trace entities shared by the whole trace-agent pipeline,
//! plus tree navigation, covered-interval arithmetic and the sublayer
//! (exclusive duration) computation.

pub mod normalize_utils;
pub mod normalizer;
pub mod span;
pub mod sublayers;
pub mod tag;
pub mod trace;

use std::collections::HashMap;

pub use normalizer::{sanitize_trace, DropReason};
pub use span::Span;
pub use sublayers::{
    compute_sublayers, set_exclusive_durations, set_sublayers_on_span, SublayerValue,
};
pub use tag::Tag;
pub use trace::Trace;

/// Metadata reported by instrumented applications on the services endpoint,
/// keyed by service name (e.g. `{"backend": {"app": "django", "app_type": "web"}}`).
pub type ServicesMetadata = HashMap<String, HashMap<String, String>>;
