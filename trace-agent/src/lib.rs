// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The trace agent: a long-lived sidecar receiving spans over HTTP,
//! pre-aggregating them into time-bucketed statistics, sampling an
//! informative subset of full traces and shipping both streams to the
//! collection API.
//!
//! The pipeline is receiver -> (concentrator, sampler) -> writer, wired by
//! the [`agent`] supervisor over bounded channels. Each stateful worker is
//! single-threaded and owns its state exclusively; a broadcast cancellation
//! token coordinates shutdown.

pub mod agent;
pub mod config;
pub mod metrics;
pub mod receiver;
pub mod writer;

pub use agent::Agent;
pub use config::AgentConfig;
pub use metrics::MetricsClient;
pub use receiver::HttpReceiver;
