// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Score-based trace sampling.
//!
//! Traces are reduced to a signature describing their shape; each signature
//! carries an exponentially-decaying score. Rare signatures are always kept,
//! common ones are kept with a probability shrinking with their score, and a
//! token bucket caps the aggregate keep rate.

pub mod rate_limiter;
pub mod score;
pub mod signature;

pub use rate_limiter::TokenBucket;
pub use score::ScoreSampler;
pub use signature::trace_signature;

/// Knuth multiplicative hash factor, the same constant the tracers use for
/// client-side sampling, so agent-side and client-side decisions agree for a
/// given trace id.
const KNUTH_FACTOR: u64 = 1111111111111111111;

/// Deterministic rate sampling on the trace id: a given trace id is always
/// kept or always dropped for a fixed rate.
pub fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    trace_id.wrapping_mul(KNUTH_FACTOR) <= (rate * u64::MAX as f64) as u64
}
