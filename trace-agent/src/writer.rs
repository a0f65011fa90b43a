// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound writer: ships flushed stats buckets and sampled traces to the
//! collection API.
//!
//! The publish entry points never block the pipeline workers: payloads go
//! through a bounded queue to a dedicated worker, and a full queue drops the
//! batch with a counter. There is no retry here, delivery is best-effort by
//! design.

use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{Method, Request};
use http_body_util::Full;
use hyper::body::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use datadog_trace_model::{ServicesMetadata, Trace};
use datadog_trace_stats::StatsBucket;

use crate::config::AgentConfig;
use crate::metrics::MetricsClient;

/// Capacity of the writer's in-memory payload buffer.
const PAYLOAD_QUEUE: usize = 64;

const HEADER_API_KEY: &str = "DD-Api-Key";

/// Consumer of flushed stats buckets.
pub trait StatsWriter: Send + Sync {
    /// Accept a batch of flushed buckets. Must not block the caller.
    fn publish_stats(&self, buckets: Vec<StatsBucket>);
}

/// Consumer of sampled traces and services metadata.
pub trait TraceWriter: Send + Sync {
    /// Accept a batch of sampled traces plus the current services metadata.
    /// Must not block the caller.
    fn publish_traces(&self, traces: Vec<Trace>, services: ServicesMetadata);
}

enum Payload {
    Stats(Vec<StatsBucket>),
    Traces {
        traces: Vec<Trace>,
        services: ServicesMetadata,
    },
}

/// Writer shipping payloads to the collection API over HTTP.
pub struct ApiWriter {
    tx: mpsc::Sender<Payload>,
    metrics: Arc<MetricsClient>,
}

impl ApiWriter {
    /// Build the writer handle and its worker. The worker must be spawned by
    /// the supervisor; it exits once every handle is dropped and the queue
    /// is drained.
    pub fn new(config: &AgentConfig, metrics: Arc<MetricsClient>) -> (Arc<Self>, ApiWriterWorker) {
        let (tx, rx) = mpsc::channel(PAYLOAD_QUEUE);
        let writer = Arc::new(Self {
            tx,
            metrics: metrics.clone(),
        });
        let worker = ApiWriterWorker {
            rx,
            endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            flush_traces: config.api_flush_traces,
            hostname: config.hostname.clone(),
            client: hyper_util::client::legacy::Client::builder(
                hyper_util::rt::TokioExecutor::new(),
            )
            .build_http(),
            metrics,
        };
        (writer, worker)
    }

    fn enqueue(&self, payload: Payload, kind: &'static str) {
        if self.tx.try_send(payload).is_err() {
            // bounded buffer is full or the worker is gone; this pipeline is
            // lossy, drop and count
            self.metrics
                .incr("writer.payloads_dropped", &[("kind", kind)]);
        }
    }
}

impl StatsWriter for ApiWriter {
    fn publish_stats(&self, buckets: Vec<StatsBucket>) {
        if buckets.is_empty() {
            return;
        }
        self.enqueue(Payload::Stats(buckets), "stats");
    }
}

impl TraceWriter for ApiWriter {
    fn publish_traces(&self, traces: Vec<Trace>, services: ServicesMetadata) {
        if traces.is_empty() && services.is_empty() {
            return;
        }
        self.enqueue(Payload::Traces { traces, services }, "traces");
    }
}

#[derive(Serialize)]
struct StatsPayload<'a> {
    hostname: &'a str,
    stats: &'a [StatsBucket],
}

#[derive(Serialize)]
struct TracesPayload<'a> {
    hostname: &'a str,
    traces: &'a [Trace],
    services: &'a ServicesMetadata,
}

/// Worker draining the payload queue and posting to the API.
pub struct ApiWriterWorker {
    rx: mpsc::Receiver<Payload>,
    endpoint: String,
    api_key: String,
    flush_traces: bool,
    hostname: String,
    client: hyper_util::client::legacy::Client<
        hyper_util::client::legacy::connect::HttpConnector,
        Full<Bytes>,
    >,
    metrics: Arc<MetricsClient>,
}

impl ApiWriterWorker {
    /// Whether payloads are actually posted. Without an API key the writer
    /// only logs what it would send.
    fn enabled(&self) -> bool {
        !self.api_key.is_empty() && !self.endpoint.is_empty()
    }

    pub async fn run(&mut self) {
        while let Some(payload) = self.rx.recv().await {
            match payload {
                Payload::Stats(buckets) => {
                    self.metrics
                        .count("writer.stats_buckets", buckets.len() as i64, &[]);
                    let body = StatsPayload {
                        hostname: &self.hostname,
                        stats: &buckets,
                    };
                    self.post("/stats", &body, buckets.len(), "stats buckets").await;
                }
                Payload::Traces { traces, services } => {
                    self.metrics
                        .count("writer.traces", traces.len() as i64, &[]);
                    if !self.flush_traces {
                        debug!(traces = traces.len(), "trace flushing is disabled");
                        continue;
                    }
                    let body = TracesPayload {
                        hostname: &self.hostname,
                        traces: &traces,
                        services: &services,
                    };
                    self.post("/traces", &body, traces.len(), "traces").await;
                }
            }
        }
    }

    async fn post<T: Serialize>(&self, path: &str, payload: &T, count: usize, what: &str) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(error) => {
                error!(%error, "cannot serialize {what} payload");
                return;
            }
        };
        if !self.enabled() {
            info!("would flush {count} {what} ({} bytes), api key not set", body.len());
            return;
        }

        let uri = format!("{}{}", self.endpoint, path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_API_KEY, &self.api_key)
            .body(Full::new(Bytes::from(body)));
        let request = match request {
            Ok(request) => request,
            Err(error) => {
                error!(%error, "cannot build {what} request");
                return;
            }
        };

        match self.client.request(request).await {
            Ok(response) if response.status().is_success() => {
                debug!(count, "flushed {what}");
            }
            Ok(response) => {
                error!(status = %response.status(), %uri, "api refused {what} payload");
                self.metrics.incr("writer.errors", &[]);
            }
            Err(error) => {
                error!(%error, %uri, "failed to send {what} payload");
                self.metrics.incr("writer.errors", &[]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datadog_trace_model::Span;

    fn test_writer() -> (Arc<ApiWriter>, ApiWriterWorker) {
        let config = AgentConfig::default();
        ApiWriter::new(&config, Arc::new(MetricsClient::disabled()))
    }

    #[tokio::test]
    async fn test_publish_does_not_block() {
        let (writer, _worker) = test_writer();
        // the worker is never started: the queue fills up and publishes drop
        for _ in 0..PAYLOAD_QUEUE * 2 {
            writer.publish_traces(vec![vec![Span::default()]], ServicesMetadata::new());
        }
    }

    #[tokio::test]
    async fn test_worker_exits_when_handles_are_dropped() {
        let (writer, mut worker) = test_writer();
        let handle = tokio::spawn(async move { worker.run().await });
        writer.publish_stats(Vec::new()); // empty batches are skipped
        drop(writer);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_writer_logs_instead_of_posting() {
        let config = AgentConfig {
            api_key: String::new(),
            ..Default::default()
        };
        let (writer, mut worker) = ApiWriter::new(&config, Arc::new(MetricsClient::disabled()));
        assert!(!worker.enabled());

        writer.publish_traces(vec![vec![Span::default()]], ServicesMetadata::new());
        drop(writer);
        // drains the queue without any endpoint being reachable
        worker.run().await;
    }
}
