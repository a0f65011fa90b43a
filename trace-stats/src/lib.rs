// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pre-aggregation of span statistics into sliding time buckets.
//!
//! The [`concentrator::Concentrator`] owns the open buckets; each bucket
//! tracks hits/errors/times counts per tag dimension, with an approximate
//! duration distribution attached to `times`.

pub mod bucket;
pub mod concentrator;

pub use bucket::{count_key, Count, Metric, StatsBucket, ERRORS, HITS, TIMES};
pub use concentrator::{Concentrator, SpanVerdict};
