use std::{path::PathBuf, sync::OnceLock, time::Duration};

use anyhow::Result;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::wiring::ExecutionReport;

pub const LOG_FILE: &str = "modwire.log";
const SERVICE_NAME: &str = "modwire";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

/// Keeps the OTLP providers alive; flush them with [`TelemetryGuard::shutdown`].
#[derive(Default)]
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.logger_provider {
            if let Err(e) = provider.shutdown() {
                warn!("log provider shutdown failed: {}", e);
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                warn!("meter provider shutdown failed: {}", e);
            }
        }
    }
}

/// Install the global subscriber: stdout, a daily rolling file when `log_dir`
/// is set, and OTLP logs and metrics when an endpoint is configured.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            let layer = OpenTelemetryTracingBridge::new(&logger_provider);
            guard.logger_provider = Some(logger_provider);
            guard.meter_provider = Some(meter_provider);
            Some(layer)
        }
        None => None,
    };

    // exporter internals must not feed back into the exporter
    let filter = EnvFilter::new(&config.log_level)
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    info!(
        level = %config.log_level,
        log_dir = ?config.log_dir,
        otel = config.otel_endpoint.is_some(),
        "tracing initialised"
    );
    Ok(guard)
}

fn resource() -> Resource {
    static RESOURCE: OnceLock<Resource> = OnceLock::new();
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource())
        .build())
}

/// Heartbeat and wiring instruments, created from the global meter.
/// Without an OTLP endpoint the global meter is a no-op.
#[derive(Clone)]
pub struct RuntimeMetrics {
    ticks: Counter<u64>,
    skipped_ticks: Counter<u64>,
    tick_latency_ms: Histogram<f64>,
    executions: Counter<u64>,
    node_outcomes: Counter<u64>,
    execution_latency_ms: Histogram<f64>,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            ticks: meter
                .u64_counter("heartbeat_ticks")
                .with_description("Completed heartbeat ticks")
                .build(),
            skipped_ticks: meter
                .u64_counter("heartbeat_skipped_ticks")
                .with_description("Timer fires dropped while a tick was running")
                .build(),
            tick_latency_ms: meter
                .f64_histogram("heartbeat_tick_latency_ms")
                .with_unit("ms")
                .build(),
            executions: meter.u64_counter("wiring_executions").build(),
            node_outcomes: meter
                .u64_counter("wiring_node_outcomes")
                .with_description("Node results per execution, by outcome")
                .build(),
            execution_latency_ms: meter
                .f64_histogram("wiring_execution_latency_ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_tick(&self, elapsed: Duration) {
        self.ticks.add(1, &[]);
        self.tick_latency_ms
            .record(elapsed.as_secs_f64() * 1_000.0, &[]);
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.add(1, &[]);
    }

    pub fn record_execution(&self, report: &ExecutionReport) {
        let configuration = KeyValue::new("configuration", report.configuration.clone());
        self.executions.add(1, &[configuration.clone()]);
        let completed = report.completed().len() as u64;
        for (outcome, count) in [
            ("completed", completed),
            ("failed", report.failed.len() as u64),
            ("skipped", report.skipped.len() as u64),
        ] {
            if count > 0 {
                self.node_outcomes.add(
                    count,
                    &[configuration.clone(), KeyValue::new("outcome", outcome)],
                );
            }
        }
        self.execution_latency_ms
            .record(report.total.num_milliseconds() as f64, &[configuration]);
    }
}
