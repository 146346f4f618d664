//! OpenTelemetry integration for gatekeeper
//!
//! Structured logging through `tracing`, optional OTLP export of spans and
//! metrics, and the security counters the auth services report into.

use std::time::Duration;

use crate::config::{LoggingConfig, OtelConfig};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry provider
///
/// Owns the tracer and meter providers. With export disabled the meter
/// provider has no reader, so instruments are cheap no-ops.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    /// Create a new OtelProvider with the given configuration
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;

            (Some(tracer_provider), meter_provider)
        } else {
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    /// Get a tracer from the provider
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    /// Get the meter for creating metrics
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    /// Check if OTLP export is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush and shut down the providers
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
                }
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Counters reported by the auth services
pub struct SecurityMetrics {
    /// Requests rejected by the rate limiter, by `kind`
    pub rate_limited_total: Counter<u64>,

    /// Identities blocked by crawler detection
    pub crawler_blocked_total: Counter<u64>,

    /// Login attempts, by `outcome`
    pub login_attempts_total: Counter<u64>,

    /// Sessions created
    pub sessions_created_total: Counter<u64>,

    /// Sessions evicted by the per-user cap
    pub sessions_evicted_total: Counter<u64>,

    /// Password hashing/verification time in seconds
    pub password_hash_duration: Histogram<f64>,
}

impl SecurityMetrics {
    /// Create the instruments on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            rate_limited_total: meter
                .u64_counter("gatekeeper_rate_limited_total")
                .with_description("Requests rejected by the rate limiter")
                .init(),
            crawler_blocked_total: meter
                .u64_counter("gatekeeper_crawler_blocked_total")
                .with_description("Identities blocked as crawlers")
                .init(),
            login_attempts_total: meter
                .u64_counter("gatekeeper_login_attempts_total")
                .with_description("Login attempts by outcome")
                .init(),
            sessions_created_total: meter
                .u64_counter("gatekeeper_sessions_created_total")
                .with_description("Sessions created")
                .init(),
            sessions_evicted_total: meter
                .u64_counter("gatekeeper_sessions_evicted_total")
                .with_description("Sessions evicted by the per-user cap")
                .init(),
            password_hash_duration: meter
                .f64_histogram("gatekeeper_password_hash_duration_seconds")
                .with_description("Password hashing time in seconds")
                .init(),
        }
    }

    /// Record a rate-limit rejection (`limited`, `blocked` or `unavailable`)
    pub fn record_rate_limited(&self, kind: &str) {
        self.rate_limited_total
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }

    /// Record a crawler block
    pub fn record_crawler_blocked(&self) {
        self.crawler_blocked_total.add(1, &[]);
    }

    /// Record a login attempt outcome
    pub fn record_login(&self, outcome: &str) {
        self.login_attempts_total
            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    }

    /// Record a created session and the sessions it evicted
    pub fn record_session_created(&self, evicted: usize) {
        self.sessions_created_total.add(1, &[]);
        if evicted > 0 {
            self.sessions_evicted_total.add(evicted as u64, &[]);
        }
    }

    /// Record one hashing operation
    pub fn record_password_hash(&self, elapsed: Duration) {
        self.password_hash_duration
            .record(elapsed.as_secs_f64(), &[]);
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the tracing subscriber
///
/// `logging.format` selects `json` or plain `text` output; the OTLP layer is
/// added only when export is enabled.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(parse_level(&logging.level));

    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("gatekeeper")));
    let json = logging.format.eq_ignore_ascii_case("json");
    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
