// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The HTTP receiver: decodes trace payloads over multiple API versions and
//! encodings, validates and normalizes spans, and hands surviving traces to
//! the pipeline over bounded channels.
//!
//! Handlers never block for long: channel sends are bounded by a short
//! deadline and a full pipeline drops the payload (with a counter) while
//! still answering 200, so clients do not enter retry storms.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use datadog_trace_model::{sanitize_trace, ServicesMetadata, Span, Trace};
use datadog_trace_stats::concentrator::system_time_to_unix_ns;

use crate::config::AgentConfig;
use crate::metrics::MetricsClient;

const APPLICATION_JSON: &str = "application/json";
const APPLICATION_MSGPACK: &str = "application/msgpack";

/// How long a handler may wait on a full pipeline channel.
const CHANNEL_SEND_TIMEOUT: Duration = Duration::from_millis(100);
/// Lease duration of one remote peer slot.
const PEER_LEASE: Duration = Duration::from_secs(30);
/// Grace period for in-flight handlers on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Trace API versions served by the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    V02,
    V03,
}

impl ApiVersion {
    fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V02 => "v0.2",
            ApiVersion::V03 => "v0.3",
        }
    }
}

enum Encoding {
    Json,
    Msgpack,
}

/// Select the decoder for a request, enforcing the per-version media-type
/// rules: absent or JSON everywhere, msgpack only from v0.3 on.
fn encoding_for(version: ApiVersion, content_type: Option<&str>) -> Result<Encoding, StatusCode> {
    // strip any ;charset=... parameter
    let media_type = content_type.map(|v| v.split(';').next().unwrap_or("").trim());
    match media_type {
        None | Some("") | Some(APPLICATION_JSON) => Ok(Encoding::Json),
        Some(APPLICATION_MSGPACK) => match version {
            ApiVersion::V02 => Err(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            ApiVersion::V03 => Ok(Encoding::Msgpack),
        },
        Some(_) => Err(StatusCode::UNSUPPORTED_MEDIA_TYPE),
    }
}

/// Lease table throttling the number of unique remote peers.
struct PeerLeases {
    limit: usize,
    leases: HashMap<IpAddr, Instant>,
}

impl PeerLeases {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            leases: HashMap::new(),
        }
    }

    /// Whether `peer` may talk to us right now. Expired leases are pruned on
    /// every call so the table stays bounded by the limit.
    fn admit(&mut self, peer: IpAddr, now: Instant) -> bool {
        self.leases.retain(|_, expiry| *expiry > now);
        if self.leases.contains_key(&peer) {
            return true;
        }
        if self.leases.len() < self.limit {
            self.leases.insert(peer, now + PEER_LEASE);
            return true;
        }
        false
    }
}

struct ReceiverState {
    config: Arc<AgentConfig>,
    metrics: Arc<MetricsClient>,
    traces_tx: mpsc::Sender<Trace>,
    services_tx: mpsc::Sender<ServicesMetadata>,
    peers: Mutex<PeerLeases>,
}

/// HTTP server exposing the `v0.2` and `v0.3` trace and services endpoints.
pub struct HttpReceiver {
    state: Arc<ReceiverState>,
}

impl HttpReceiver {
    pub fn new(
        config: Arc<AgentConfig>,
        metrics: Arc<MetricsClient>,
        traces_tx: mpsc::Sender<Trace>,
        services_tx: mpsc::Sender<ServicesMetadata>,
    ) -> Self {
        let peers = Mutex::new(PeerLeases::new(config.connection_limit));
        Self {
            state: Arc::new(ReceiverState {
                config,
                metrics,
                traces_tx,
                services_tx,
                peers,
            }),
        }
    }

    /// Serve until `shutdown` fires, then drain in-flight handlers under a
    /// bounded grace period. Consumes the receiver so the pipeline channels
    /// close once the last handler finished.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening for traces");
        }
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            debug!(%error, "failed to accept connection");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    handlers.spawn(serve_connection(state, stream, peer));
                }
                // reap finished handlers so the join set stays small
                _ = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period exceeded, aborting in-flight handlers");
            handlers.shutdown().await;
        }
    }
}

async fn serve_connection(
    state: Arc<ReceiverState>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle_request(state.clone(), peer.ip(), req));
    if let Err(error) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(%error, "connection error");
    }
}

async fn handle_request(
    state: Arc<ReceiverState>,
    peer: IpAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let admitted = match state.peers.lock() {
        Ok(mut peers) => peers.admit(peer, Instant::now()),
        Err(_) => true,
    };
    if !admitted {
        state.metrics.incr("receiver.throttled", &[]);
        return Ok(status_response(StatusCode::TOO_MANY_REQUESTS));
    }

    let (version, endpoint) = match route(req.uri().path()) {
        Some(route) => route,
        None => return Ok(status_response(StatusCode::NOT_FOUND)),
    };
    if req.method() != Method::POST {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let encoding = match encoding_for(version, content_type.as_deref()) {
        Ok(encoding) => encoding,
        Err(status) => {
            state
                .metrics
                .incr("receiver.media_type_refused", &[("version", version.as_str())]);
            return Ok(status_response(status));
        }
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            debug!(%error, "failed to read request body");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    let status = match endpoint {
        Endpoint::Traces => handle_traces(&state, version, encoding, &body).await,
        Endpoint::Services => handle_services(&state, version, encoding, &body).await,
    };
    Ok(status_response(status))
}

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Traces,
    Services,
}

fn route(path: &str) -> Option<(ApiVersion, Endpoint)> {
    match path {
        "/v0.2/traces" => Some((ApiVersion::V02, Endpoint::Traces)),
        "/v0.3/traces" => Some((ApiVersion::V03, Endpoint::Traces)),
        "/v0.2/services" => Some((ApiVersion::V02, Endpoint::Services)),
        "/v0.3/services" => Some((ApiVersion::V03, Endpoint::Services)),
        _ => None,
    }
}

async fn handle_traces(
    state: &ReceiverState,
    version: ApiVersion,
    encoding: Encoding,
    body: &Bytes,
) -> StatusCode {
    let payload: Vec<Vec<Span>> = match decode(encoding, body) {
        Ok(payload) => payload,
        Err(error) => {
            debug!(%error, version = version.as_str(), "cannot decode trace payload");
            state
                .metrics
                .incr("receiver.decode_errors", &[("version", version.as_str())]);
            return StatusCode::BAD_REQUEST;
        }
    };

    let now_ns = system_time_to_unix_ns(SystemTime::now());
    let cutoff_ns = state.config.oldest_span_cutoff.as_nanos() as i64;
    for spans in payload {
        state
            .metrics
            .count("receiver.spans_received", spans.len() as i64, &[]);
        let (trace, drops) = sanitize_trace(spans, now_ns, cutoff_ns);
        for reason in &drops {
            state
                .metrics
                .incr("receiver.spans_dropped", &[("reason", reason.as_str())]);
        }
        if trace.is_empty() {
            state.metrics.incr("receiver.traces_dropped", &[]);
            continue;
        }
        match state
            .traces_tx
            .send_timeout(trace, CHANNEL_SEND_TIMEOUT)
            .await
        {
            Ok(()) => state.metrics.incr("receiver.traces_received", &[]),
            Err(_) => {
                // pipeline is saturated, drop rather than stall the client
                state.metrics.incr("receiver.overflows", &[]);
            }
        }
    }
    StatusCode::OK
}

async fn handle_services(
    state: &ReceiverState,
    version: ApiVersion,
    encoding: Encoding,
    body: &Bytes,
) -> StatusCode {
    let services: ServicesMetadata = match decode(encoding, body) {
        Ok(services) => services,
        Err(error) => {
            debug!(%error, version = version.as_str(), "cannot decode services payload");
            state
                .metrics
                .incr("receiver.decode_errors", &[("version", version.as_str())]);
            return StatusCode::BAD_REQUEST;
        }
    };

    state
        .metrics
        .count("receiver.services_received", services.len() as i64, &[]);
    if state
        .services_tx
        .send_timeout(services, CHANNEL_SEND_TIMEOUT)
        .await
        .is_err()
    {
        state.metrics.incr("receiver.overflows", &[]);
    }
    StatusCode::OK
}

fn decode<T: serde::de::DeserializeOwned>(encoding: Encoding, body: &Bytes) -> anyhow::Result<T> {
    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(body)?),
        Encoding::Msgpack => Ok(rmp_serde::from_slice(body)?),
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::collections::HashMap as StdHashMap;

    fn test_span() -> Span {
        Span {
            trace_id: 42,
            span_id: 52,
            parent_id: 0,
            service: "fennel_IS amazing!".to_string(),
            name: "something &&<@# that should be a metric!".to_string(),
            resource: "NOT touched because it is going to be hashed".to_string(),
            r#type: "web".to_string(),
            start: system_time_to_unix_ns(SystemTime::now()),
            duration: 1_000_000_000,
            meta: StdHashMap::from([("http.host".to_string(), "192.168.0.1".to_string())]),
            metrics: StdHashMap::from([("http.monitor".to_string(), 41.99)]),
        }
    }

    fn test_traces(trace_count: usize, size: usize) -> Vec<Vec<Span>> {
        vec![vec![test_span(); size]; trace_count]
    }

    struct TestReceiver {
        addr: SocketAddr,
        traces_rx: mpsc::Receiver<Trace>,
        services_rx: mpsc::Receiver<ServicesMetadata>,
        shutdown: CancellationToken,
    }

    impl Drop for TestReceiver {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_receiver(config: AgentConfig) -> TestReceiver {
        let (traces_tx, traces_rx) = mpsc::channel(100);
        let (services_tx, services_rx) = mpsc::channel(100);
        let receiver = HttpReceiver::new(
            Arc::new(config),
            Arc::new(MetricsClient::disabled()),
            traces_tx,
            services_tx,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(receiver.run(listener, shutdown.clone()));
        TestReceiver {
            addr,
            traces_rx,
            services_rx,
            shutdown,
        }
    }

    async fn post(
        addr: SocketAddr,
        path: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> StatusCode {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}{path}"));
        if let Some(content_type) = content_type {
            builder = builder.header(http::header::CONTENT_TYPE, content_type);
        }
        let request = builder.body(Full::new(Bytes::from(body))).unwrap();
        client.request(request).await.unwrap().status()
    }

    fn assert_normalized(span: &Span) {
        assert_eq!(span.trace_id, 42);
        assert_eq!(span.span_id, 52);
        assert_eq!(span.service, "fennel_is_amazing");
        assert_eq!(span.name, "something_that_should_be_a_metric");
        assert_eq!(
            span.resource,
            "NOT touched because it is going to be hashed"
        );
        assert_eq!(span.meta["http.host"], "192.168.0.1");
        assert_eq!(span.metrics["http.monitor"], 41.99);
    }

    #[tokio::test]
    async fn test_traces_json_decoder() {
        // no content-type or JSON decodes on both versions
        for (path, content_type) in [
            ("/v0.2/traces", None),
            ("/v0.2/traces", Some(APPLICATION_JSON)),
            ("/v0.3/traces", None),
            ("/v0.3/traces", Some(APPLICATION_JSON)),
        ] {
            let mut receiver = start_receiver(AgentConfig::default()).await;
            let body = serde_json::to_vec(&test_traces(1, 1)).unwrap();
            let status = post(receiver.addr, path, content_type, body).await;
            assert_eq!(status, StatusCode::OK, "{path} {content_type:?}");

            let trace = receiver.traces_rx.try_recv().expect("no data received");
            assert_eq!(trace.len(), 1);
            assert_normalized(&trace[0]);
        }
    }

    #[tokio::test]
    async fn test_traces_msgpack_decoder() {
        // msgpack is supported from v0.3 on, v0.2 answers 415
        let body = rmp_serde::to_vec_named(&test_traces(1, 1)).unwrap();

        let mut receiver = start_receiver(AgentConfig::default()).await;
        let status = post(
            receiver.addr,
            "/v0.2/traces",
            Some(APPLICATION_MSGPACK),
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(receiver.traces_rx.try_recv().is_err());

        let status = post(
            receiver.addr,
            "/v0.3/traces",
            Some(APPLICATION_MSGPACK),
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let trace = receiver.traces_rx.try_recv().expect("no data received");
        assert_eq!(trace.len(), 1);
        assert_normalized(&trace[0]);
    }

    #[tokio::test]
    async fn test_services_json_decoder() {
        let services: ServicesMetadata = StdHashMap::from([
            (
                "backend".to_string(),
                StdHashMap::from([
                    ("app".to_string(), "django".to_string()),
                    ("app_type".to_string(), "web".to_string()),
                ]),
            ),
            (
                "database".to_string(),
                StdHashMap::from([
                    ("app".to_string(), "postgres".to_string()),
                    ("app_type".to_string(), "db".to_string()),
                ]),
            ),
        ]);

        for path in ["/v0.2/services", "/v0.3/services"] {
            let mut receiver = start_receiver(AgentConfig::default()).await;
            let body = serde_json::to_vec(&services).unwrap();
            let status = post(receiver.addr, path, Some(APPLICATION_JSON), body).await;
            assert_eq!(status, StatusCode::OK);

            let received = receiver.services_rx.try_recv().expect("no data received");
            assert_eq!(received.len(), 2);
            assert_eq!(received["backend"]["app"], "django");
            assert_eq!(received["backend"]["app_type"], "web");
            assert_eq!(received["database"]["app"], "postgres");
            assert_eq!(received["database"]["app_type"], "db");
        }
    }

    #[tokio::test]
    async fn test_services_msgpack_decoder() {
        let services: ServicesMetadata = StdHashMap::from([(
            "backend".to_string(),
            StdHashMap::from([("app".to_string(), "django".to_string())]),
        )]);
        let body = rmp_serde::to_vec_named(&services).unwrap();

        let mut receiver = start_receiver(AgentConfig::default()).await;
        let status = post(
            receiver.addr,
            "/v0.2/services",
            Some(APPLICATION_MSGPACK),
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let status = post(
            receiver.addr,
            "/v0.3/services",
            Some(APPLICATION_MSGPACK),
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let received = receiver.services_rx.try_recv().expect("no data received");
        assert_eq!(received["backend"]["app"], "django");
    }

    #[tokio::test]
    async fn test_unknown_media_type_is_refused() {
        let receiver = start_receiver(AgentConfig::default()).await;
        let status = post(receiver.addr, "/v0.3/traces", Some("text/plain"), vec![]).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_bad_request() {
        let receiver = start_receiver(AgentConfig::default()).await;
        let status = post(
            receiver.addr,
            "/v0.3/traces",
            None,
            b"{not json".to_vec(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let receiver = start_receiver(AgentConfig::default()).await;
        let status = post(receiver.addr, "/v0.1/traces", None, vec![]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_spans_are_dropped_but_payload_accepted() {
        let mut receiver = start_receiver(AgentConfig::default()).await;
        let mut bad_span = test_span();
        bad_span.duration = -1;
        let payload = vec![vec![test_span(), bad_span]];
        let body = serde_json::to_vec(&payload).unwrap();
        let status = post(receiver.addr, "/v0.3/traces", None, body).await;
        assert_eq!(status, StatusCode::OK);

        let trace = receiver.traces_rx.try_recv().expect("no data received");
        assert_eq!(trace.len(), 1);
    }

    #[tokio::test]
    async fn test_trace_with_no_surviving_span_is_dropped() {
        let mut receiver = start_receiver(AgentConfig::default()).await;
        let mut bad_span = test_span();
        bad_span.service = String::new();
        let body = serde_json::to_vec(&vec![vec![bad_span]]).unwrap();
        let status = post(receiver.addr, "/v0.3/traces", None, body).await;
        assert_eq!(status, StatusCode::OK);
        assert!(receiver.traces_rx.try_recv().is_err());
    }

    #[test]
    fn test_peer_leases() {
        let mut leases = PeerLeases::new(2);
        let now = Instant::now();
        let peer = |n: u8| IpAddr::from([10, 0, 0, n]);

        assert!(leases.admit(peer(1), now));
        assert!(leases.admit(peer(2), now));
        // both peers hold leases, a third is refused
        assert!(!leases.admit(peer(3), now));
        // known peers keep passing
        assert!(leases.admit(peer(1), now + Duration::from_secs(10)));

        // leases expire and slots free up
        let later = now + PEER_LEASE + Duration::from_secs(1);
        assert!(leases.admit(peer(3), later));
    }

    #[tokio::test]
    async fn test_connection_limit_answers_429() {
        let config = AgentConfig {
            connection_limit: 0,
            ..Default::default()
        };
        let receiver = start_receiver(config).await;
        let body = serde_json::to_vec(&test_traces(1, 1)).unwrap();
        let status = post(receiver.addr, "/v0.3/traces", None, body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }
}
