// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal telemetry: a thin statsd client every worker holds a handle to.
//! Sends are queued and never block the pipeline; failures are logged and
//! swallowed.

use std::net::UdpSocket;

use anyhow::Result;
use cadence::prelude::*;
use cadence::{Metric, MetricBuilder, QueuingMetricSink, StatsdClient, UdpMetricSink};
use tracing::debug;

/// Prefix applied to every metric key.
const PREFIX: &str = "trace_agent";

// Queue with a maximum capacity of 32K elements
const QUEUE_SIZE: usize = 32 * 1024;

/// Statsd emitter for the agent's own counters and gauges.
///
/// A disabled client (statsd unreachable, or tests) swallows everything.
#[derive(Debug, Default)]
pub struct MetricsClient {
    client: Option<StatsdClient>,
}

impl MetricsClient {
    /// Build a client flushing to `host:port` over UDP through a bounded
    /// queue.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let udp_sink = UdpMetricSink::from((host, port), socket)?;
        let sink = QueuingMetricSink::with_capacity(udp_sink, QUEUE_SIZE);
        Ok(Self {
            client: Some(StatsdClient::builder(PREFIX, sink).build()),
        })
    }

    /// A client that drops everything.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn count(&self, key: &str, value: i64, tags: &[(&str, &str)]) {
        if let Some(client) = &self.client {
            send(client.count_with_tags(key, value), tags);
        }
    }

    pub fn incr(&self, key: &str, tags: &[(&str, &str)]) {
        self.count(key, 1, tags);
    }

    pub fn gauge(&self, key: &str, value: f64, tags: &[(&str, &str)]) {
        if let Some(client) = &self.client {
            send(client.gauge_with_tags(key, value), tags);
        }
    }
}

fn send<'m, T>(mut builder: MetricBuilder<'m, '_, T>, tags: &'m [(&str, &str)])
where
    T: Metric + From<String>,
{
    for (name, value) in tags {
        builder = builder.with_tag(name, value);
    }
    if let Err(error) = builder.try_send() {
        debug!(%error, "failed to send internal metric");
    }
}
