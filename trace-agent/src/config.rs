// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: safe defaults for every knob, optionally overridden
//! by a TOML config file. The parsed [`AgentConfig`] is the one structure
//! shared across all components, with reliable values only.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default relative accuracy of the duration distributions.
pub const DEFAULT_DISTRIBUTION_EPS: f64 = 0.01;

/// Interpreted configuration shared across all agent components.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    // Global
    pub hostname: String,
    /// Draw the network topology from TCP connection info (CLI flag, not
    /// supported by this build).
    pub topology: bool,

    // API
    pub api_endpoint: String,
    pub api_key: String,
    pub api_flush_traces: bool,

    // Concentrator
    /// Width of a pre-aggregation bucket.
    pub bucket_interval: Duration,
    /// Maximum time we wait before discarding straggling spans.
    pub oldest_span_cutoff: Duration,
    /// Span meta keys aggregated as extra tag dimensions.
    pub extra_aggregators: Vec<String>,
    pub distribution_eps: f64,

    // Sampler
    pub sampler_score_threshold: f64,
    pub sampler_theta: f64,
    pub sampler_jitter: f64,
    pub sampler_tps_max: f64,

    // Receiver
    pub receiver_host: String,
    pub receiver_port: u16,
    /// Unique remote peers allowed per 30 second lease period.
    pub connection_limit: usize,

    // Internal telemetry
    pub statsd_host: String,
    pub statsd_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            topology: false,

            api_endpoint: "https://trace.datadoghq.com/api/v0.1".to_string(),
            api_key: String::new(),
            api_flush_traces: true,

            bucket_interval: Duration::from_secs(10),
            oldest_span_cutoff: Duration::from_secs(60),
            extra_aggregators: Vec::new(),
            distribution_eps: DEFAULT_DISTRIBUTION_EPS,

            sampler_score_threshold: 5.0,
            sampler_theta: 60.0,
            sampler_jitter: 0.1,
            sampler_tps_max: 100.0,

            receiver_host: "127.0.0.1".to_string(),
            receiver_port: 7777,
            connection_limit: 2000,

            statsd_host: "localhost".to_string(),
            statsd_port: 8125,
        }
    }
}

impl AgentConfig {
    /// Load the defaults with overrides from a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&contents)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        Ok(Self::default().merge(file))
    }

    fn merge(mut self, file: ConfigFile) -> Self {
        if let Some(hostname) = file.hostname {
            self.hostname = hostname;
        }
        if let Some(endpoint) = file.api.endpoint {
            self.api_endpoint = endpoint;
        }
        if let Some(key) = file.api.key {
            self.api_key = key;
        }
        if let Some(flush_traces) = file.api.flush_traces {
            self.api_flush_traces = flush_traces;
        }
        if let Some(secs) = file.concentrator.bucket_size_seconds {
            self.bucket_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.concentrator.oldest_span_cutoff_seconds {
            self.oldest_span_cutoff = Duration::from_secs(secs);
        }
        if let Some(extra) = file.concentrator.extra_aggregators {
            self.extra_aggregators = extra;
        }
        if let Some(threshold) = file.sampler.score_threshold {
            self.sampler_score_threshold = threshold;
        }
        if let Some(theta) = file.sampler.trace_period {
            self.sampler_theta = theta;
        }
        if let Some(jitter) = file.sampler.score_jitter {
            self.sampler_jitter = jitter;
        }
        if let Some(tps_max) = file.sampler.tps_max {
            self.sampler_tps_max = tps_max;
        }
        if let Some(host) = file.receiver.host {
            self.receiver_host = host;
        }
        if let Some(port) = file.receiver.port {
            self.receiver_port = port;
        }
        if let Some(limit) = file.receiver.connection_limit {
            self.connection_limit = limit;
        }
        if let Some(host) = file.statsd.host {
            self.statsd_host = host;
        }
        if let Some(port) = file.statsd.port {
            self.statsd_port = port;
        }
        self
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    hostname: Option<String>,
    api: ApiSection,
    concentrator: ConcentratorSection,
    sampler: SamplerSection,
    receiver: ReceiverSection,
    statsd: StatsdSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ApiSection {
    endpoint: Option<String>,
    key: Option<String>,
    flush_traces: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConcentratorSection {
    bucket_size_seconds: Option<u64>,
    oldest_span_cutoff_seconds: Option<u64>,
    extra_aggregators: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SamplerSection {
    score_threshold: Option<f64>,
    trace_period: Option<f64>,
    score_jitter: Option<f64>,
    tps_max: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ReceiverSection {
    host: Option<String>,
    port: Option<u16>,
    connection_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StatsdSection {
    host: Option<String>,
    port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.bucket_interval, Duration::from_secs(10));
        assert_eq!(config.oldest_span_cutoff, Duration::from_secs(60));
        assert_eq!(config.sampler_score_threshold, 5.0);
        assert_eq!(config.sampler_theta, 60.0);
        assert_eq!(config.sampler_jitter, 0.1);
        assert_eq!(config.sampler_tps_max, 100.0);
        assert_eq!(config.connection_limit, 2000);
        assert_eq!(config.statsd_port, 8125);
        assert!(config.api_flush_traces);
    }

    #[test]
    fn test_from_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
hostname = "test-host"

[api]
endpoint = "https://example.test/api"
key = "secret"
flush_traces = false

[concentrator]
bucket_size_seconds = 5
oldest_span_cutoff_seconds = 30
extra_aggregators = ["version"]

[sampler]
score_threshold = 2.5
trace_period = 120.0
score_jitter = 0.2
tps_max = 50.0

[receiver]
port = 8126
connection_limit = 100

[statsd]
host = "statsd.local"
port = 9125
"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hostname, "test-host");
        assert_eq!(config.api_endpoint, "https://example.test/api");
        assert_eq!(config.api_key, "secret");
        assert!(!config.api_flush_traces);
        assert_eq!(config.bucket_interval, Duration::from_secs(5));
        assert_eq!(config.oldest_span_cutoff, Duration::from_secs(30));
        assert_eq!(config.extra_aggregators, vec!["version".to_string()]);
        assert_eq!(config.sampler_score_threshold, 2.5);
        assert_eq!(config.sampler_theta, 120.0);
        assert_eq!(config.sampler_jitter, 0.2);
        assert_eq!(config.sampler_tps_max, 50.0);
        assert_eq!(config.receiver_port, 8126);
        assert_eq!(config.connection_limit, 100);
        assert_eq!(config.statsd_host, "statsd.local");
        assert_eq!(config.statsd_port, 9125);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[receiver]\nport = 9999\n").unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.receiver_port, 9999);
        assert_eq!(config.connection_limit, 2000);
        assert_eq!(config.bucket_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[receiver]\nprot = 9999\n").unwrap();
        assert!(AgentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AgentConfig::from_file(Path::new("/nonexistent/trace-agent.toml")).is_err());
    }
}
