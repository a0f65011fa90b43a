// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent supervisor: wires receiver -> (concentrator, sampler) -> writer
//! over bounded channels and coordinates shutdown.
//!
//! Every stateful worker is a single task owning its state, fed by a merged
//! stream of inputs and ticks. Shutdown is one broadcast token: the receiver
//! stops accepting and drains its handlers, channel senders drop, each
//! downstream worker drains its input to EOF, emits a final flush and exits,
//! and the writer posts the last batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use datadog_trace_model::{
    compute_sublayers, set_exclusive_durations, set_sublayers_on_span, ServicesMetadata, Trace,
};
use datadog_trace_sampler::ScoreSampler;
use datadog_trace_stats::concentrator::{system_time_to_unix_ns, Concentrator};
use datadog_trace_stats::{SpanVerdict, StatsBucket};

use crate::config::AgentConfig;
use crate::metrics::MetricsClient;
use crate::receiver::HttpReceiver;
use crate::writer::{ApiWriter, StatsWriter, TraceWriter};

const TRACE_CHANNEL: usize = 1000;
const SERVICE_CHANNEL: usize = 50;
const STATS_CHANNEL: usize = 16;
const KEPT_CHANNEL: usize = 1000;
/// How often the sampler prunes expired signatures.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

fn now_ns() -> i64 {
    system_time_to_unix_ns(SystemTime::now())
}

/// Run the sublayer computer on a kept trace: exclusive durations go on
/// every span, the aggregated values on the root span.
fn annotate_sublayers(trace: &mut Trace) {
    let (values, exclusive) = compute_sublayers(trace);
    set_exclusive_durations(trace, &exclusive);
    if let Some(root) = trace.iter().position(|s| s.is_root()) {
        set_sublayers_on_span(&mut trace[root], &values);
    }
}

/// Owns the pipeline workers for one agent process.
pub struct Agent {
    config: Arc<AgentConfig>,
    metrics: Arc<MetricsClient>,
}

impl Agent {
    pub fn new(config: AgentConfig, metrics: Arc<MetricsClient>) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
        }
    }

    /// Bind the receiver socket and run the pipeline against the API writer
    /// until `shutdown` fires and the drain completes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.receiver_host, self.config.receiver_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind receiver on {addr}"))?;

        let (writer, mut writer_worker) = ApiWriter::new(&self.config, self.metrics.clone());
        let writer_handle = tokio::spawn(async move { writer_worker.run().await });

        let stats_writer: Arc<dyn StatsWriter> = writer.clone();
        let trace_writer: Arc<dyn TraceWriter> = writer;
        self.run_pipeline(listener, stats_writer, trace_writer, shutdown)
            .await?;

        // every writer handle is gone, the worker drains its queue and exits
        writer_handle.await.context("writer worker panicked")?;
        info!("trace agent exited cleanly");
        Ok(())
    }

    /// Run the full pipeline with the given writers. Returns once every
    /// worker drained and exited after `shutdown`.
    pub async fn run_pipeline(
        self,
        listener: TcpListener,
        stats_writer: Arc<dyn StatsWriter>,
        trace_writer: Arc<dyn TraceWriter>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (traces_tx, traces_rx) = mpsc::channel(TRACE_CHANNEL);
        let (services_tx, services_rx) = mpsc::channel(SERVICE_CHANNEL);
        let (concentrator_tx, concentrator_rx) = mpsc::channel(TRACE_CHANNEL);
        let (sampler_tx, sampler_rx) = mpsc::channel(TRACE_CHANNEL);
        let (stats_tx, stats_rx) = mpsc::channel(STATS_CHANNEL);
        let (kept_tx, kept_rx) = mpsc::channel(KEPT_CHANNEL);

        let receiver = HttpReceiver::new(
            self.config.clone(),
            self.metrics.clone(),
            traces_tx,
            services_tx,
        );
        let concentrator = Concentrator::new(
            self.config.bucket_interval,
            self.config.oldest_span_cutoff,
            self.config.distribution_eps,
            self.config.extra_aggregators.clone(),
            SystemTime::now(),
        );
        let sampler = ScoreSampler::new(
            self.config.sampler_theta,
            self.config.sampler_jitter,
            self.config.sampler_score_threshold,
            self.config.sampler_tps_max,
        );

        let mut workers: JoinSet<()> = JoinSet::new();
        workers.spawn(receiver.run(listener, shutdown.clone()));
        workers.spawn(fan_out(traces_rx, concentrator_tx, sampler_tx));
        workers.spawn(concentrator_worker(
            concentrator_rx,
            stats_tx,
            kept_tx.clone(),
            concentrator,
            self.config.bucket_interval,
            self.metrics.clone(),
        ));
        workers.spawn(sampler_worker(
            sampler_rx,
            kept_tx,
            sampler,
            self.metrics.clone(),
        ));
        workers.spawn(writer_feed(
            stats_rx,
            kept_rx,
            services_rx,
            stats_writer,
            trace_writer,
            self.config.bucket_interval,
        ));

        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

/// Dispatch each normalized trace to both stateful workers.
async fn fan_out(
    mut traces_rx: mpsc::Receiver<Trace>,
    concentrator_tx: mpsc::Sender<Trace>,
    sampler_tx: mpsc::Sender<Trace>,
) {
    while let Some(trace) = traces_rx.recv().await {
        if concentrator_tx.send(trace.clone()).await.is_err() {
            break;
        }
        if sampler_tx.send(trace).await.is_err() {
            break;
        }
    }
}

/// Single owner of the concentrator state: folds spans into buckets and
/// flushes closed buckets downstream on every interval tick.
async fn concentrator_worker(
    mut traces_rx: mpsc::Receiver<Trace>,
    stats_tx: mpsc::Sender<Vec<StatsBucket>>,
    kept_tx: mpsc::Sender<Trace>,
    mut concentrator: Concentrator,
    flush_interval: Duration,
    metrics: Arc<MetricsClient>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_trace = traces_rx.recv() => {
                let Some(mut trace) = maybe_trace else { break };
                let now = now_ns();
                let mut keep = false;
                for span in &trace {
                    match concentrator.add_span(span, now) {
                        SpanVerdict::Aggregated { keep: span_keep } => keep |= span_keep,
                        SpanVerdict::Straggler => {
                            metrics.incr("concentrator.stragglers", &[]);
                        }
                    }
                }
                // distribution representatives join the kept-trace stream
                if keep {
                    annotate_sublayers(&mut trace);
                    if kept_tx.try_send(trace).is_err() {
                        metrics.incr("concentrator.kept_dropped", &[]);
                    }
                }
            }
            _ = ticker.tick() => {
                let buckets = concentrator.flush(now_ns(), false);
                if !buckets.is_empty() {
                    metrics.count("concentrator.buckets_flushed", buckets.len() as i64, &[]);
                    if stats_tx.send(buckets).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // input closed: emit everything still open so shutdown loses nothing
    let buckets = concentrator.flush(now_ns(), true);
    if !buckets.is_empty() {
        metrics.count("concentrator.buckets_flushed", buckets.len() as i64, &[]);
        let _ = stats_tx.send(buckets).await;
    }
    debug!("concentrator worker exited");
}

/// Single owner of the sampler state: scores traces and annotates kept ones
/// with their sublayer metrics.
async fn sampler_worker(
    mut traces_rx: mpsc::Receiver<Trace>,
    kept_tx: mpsc::Sender<Trace>,
    mut sampler: ScoreSampler,
    metrics: Arc<MetricsClient>,
) {
    let mut prune_ticker = tokio::time::interval(PRUNE_INTERVAL);
    prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_trace = traces_rx.recv() => {
                let Some(mut trace) = maybe_trace else { break };
                if !sampler.sample(&trace, now_ns()) {
                    metrics.incr("sampler.dropped", &[]);
                    continue;
                }
                metrics.incr("sampler.kept", &[]);
                annotate_sublayers(&mut trace);
                if kept_tx.send(trace).await.is_err() {
                    break;
                }
            }
            _ = prune_ticker.tick() => {
                sampler.prune(now_ns());
                metrics.gauge(
                    "sampler.tracked_signatures",
                    sampler.tracked_signatures() as f64,
                    &[],
                );
            }
        }
    }
    debug!("sampler worker exited");
}

/// Harvest flushed buckets and kept traces and hand them to the writers in
/// batches. Kept traces are deduped by trace id within a flush window since
/// both the sampler and the concentrator may select the same trace.
async fn writer_feed(
    mut stats_rx: mpsc::Receiver<Vec<StatsBucket>>,
    mut kept_rx: mpsc::Receiver<Trace>,
    mut services_rx: mpsc::Receiver<ServicesMetadata>,
    stats_writer: Arc<dyn StatsWriter>,
    trace_writer: Arc<dyn TraceWriter>,
    flush_interval: Duration,
) {
    let mut buffer: Vec<Trace> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut services = ServicesMetadata::new();
    let mut services_dirty = false;

    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut stats_done = false;
    let mut kept_done = false;
    let mut services_done = false;

    while !(stats_done && kept_done && services_done) {
        tokio::select! {
            maybe_buckets = stats_rx.recv(), if !stats_done => {
                match maybe_buckets {
                    Some(buckets) => stats_writer.publish_stats(buckets),
                    None => stats_done = true,
                }
            }
            maybe_trace = kept_rx.recv(), if !kept_done => {
                match maybe_trace {
                    Some(trace) => {
                        let trace_id = trace.first().map(|s| s.trace_id).unwrap_or_default();
                        if seen.insert(trace_id) {
                            buffer.push(trace);
                        }
                    }
                    None => kept_done = true,
                }
            }
            maybe_services = services_rx.recv(), if !services_done => {
                match maybe_services {
                    Some(update) => {
                        services.extend(update);
                        services_dirty = true;
                    }
                    None => services_done = true,
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() || services_dirty {
                    trace_writer.publish_traces(std::mem::take(&mut buffer), services.clone());
                    seen.clear();
                    services_dirty = false;
                }
            }
        }
    }

    if !buffer.is_empty() || services_dirty {
        trace_writer.publish_traces(buffer, services);
    }
    debug!("writer feed exited");
}
