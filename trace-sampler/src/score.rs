// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use datadog_trace_model::Span;
use rand::Rng;
use tracing::debug;

use crate::rate_limiter::TokenBucket;
use crate::signature::trace_signature;

/// Signatures whose decayed score falls below this are expired from the
/// table. A signature observed after expiry starts over at score 1 and is
/// almost certainly kept again.
const SCORE_EXPIRY_THRESHOLD: f64 = 0.1;

#[derive(Clone, Copy, Debug)]
struct SignatureScore {
    score: f64,
    last_seen_ns: i64,
}

/// Selects which traces to forward in full.
///
/// Per signature, the score decays exponentially with time constant `theta`
/// and gains 1 on every observation, so it approximates the signature's
/// recent arrival volume. A trace is kept iff `1/s >= r - jitter` for a
/// uniform draw `r`, with two overrides: signatures scoring under `s_min`
/// are always kept (rare shapes), and the aggregate keep rate is capped at
/// `tps_max` traces per second by a token bucket.
#[derive(Clone, Debug)]
pub struct ScoreSampler {
    theta_secs: f64,
    jitter: f64,
    s_min: f64,
    scores: HashMap<u64, SignatureScore>,
    limiter: TokenBucket,
}

impl ScoreSampler {
    pub fn new(theta_secs: f64, jitter: f64, s_min: f64, tps_max: f64) -> Self {
        Self {
            theta_secs: if theta_secs > 0.0 { theta_secs } else { 60.0 },
            jitter,
            s_min,
            scores: HashMap::new(),
            limiter: TokenBucket::new(tps_max),
        }
    }

    /// Decide whether to keep this trace, updating the signature table.
    pub fn sample(&mut self, trace: &[Span], now_ns: i64) -> bool {
        let draw: f64 = rand::thread_rng().gen();
        self.sample_with_draw(trace_signature(trace), now_ns, draw)
    }

    /// Same as [`sample`](Self::sample) with the uniform draw supplied by
    /// the caller, for reproducible tests.
    pub fn sample_with_draw(&mut self, signature: u64, now_ns: i64, draw: f64) -> bool {
        let entry = self.scores.entry(signature).or_insert(SignatureScore {
            score: 0.0,
            last_seen_ns: now_ns,
        });
        let elapsed_secs = now_ns.saturating_sub(entry.last_seen_ns).max(0) as f64 / 1e9;
        entry.score = entry.score * (-elapsed_secs / self.theta_secs).exp() + 1.0;
        entry.last_seen_ns = now_ns;
        let score = entry.score;

        let keep = score < self.s_min || 1.0 / score >= draw - self.jitter;
        // the ceiling only applies to kept traces, a drop consumes no token
        keep && self.limiter.allow(now_ns)
    }

    /// Drop signatures whose score has decayed below the expiry threshold.
    pub fn prune(&mut self, now_ns: i64) {
        let theta = self.theta_secs;
        let before = self.scores.len();
        self.scores.retain(|_, entry| {
            let elapsed_secs = now_ns.saturating_sub(entry.last_seen_ns).max(0) as f64 / 1e9;
            entry.score * (-elapsed_secs / theta).exp() >= SCORE_EXPIRY_THRESHOLD
        });
        let expired = before - self.scores.len();
        if expired > 0 {
            debug!(expired, tracked = self.scores.len(), "expired trace signatures");
        }
    }

    /// Number of signatures currently tracked.
    pub fn tracked_signatures(&self) -> usize {
        self.scores.len()
    }
}
