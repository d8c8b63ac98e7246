//! Tracing setup: stderr logs plus optional OTLP span export.

use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable for service name (not exported by opentelemetry_sdk).
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

const DEFAULT_SERVICE_NAME: &str = "kinstall";

/// Flushes exported spans when dropped. Keep it alive for the whole run.
pub struct TelemetryGuard {
	_inner: Option<OtelGuard>,
}

struct OtelGuard {
	tracer_provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
	fn drop(&mut self) {
		if let Err(e) = self.tracer_provider.shutdown() {
			eprintln!("Failed to shutdown tracer provider: {e}");
		}
	}
}

fn otel_export_enabled() -> bool {
	std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT).is_ok()
		|| std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT).is_ok()
}

/// Build the env filter: `--log-level`, then `RUST_LOG`, then info.
fn filter(log_level: Option<Level>) -> EnvFilter {
	match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	}
}

/// Initialize tracing.
///
/// Logs go to stderr, pretty on a terminal and JSON otherwise, so stdout
/// stays reserved for the report. Spans are exported over OTLP when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` or `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` is
/// set; the service name defaults to `kinstall`.
pub fn init(log_level: Option<Level>) -> Result<TelemetryGuard> {
	let fmt_layer = if std::io::stderr().is_terminal() {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.pretty()
			.boxed()
	} else {
		tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.json()
			.boxed()
	};

	if otel_export_enabled() {
		let (otel_layer, guard) = init_otel()?;
		tracing_subscriber::registry()
			.with(filter(log_level))
			.with(fmt_layer)
			.with(otel_layer)
			.init();
		return Ok(TelemetryGuard {
			_inner: Some(guard),
		});
	}

	tracing_subscriber::registry()
		.with(filter(log_level))
		.with(fmt_layer)
		.init();
	Ok(TelemetryGuard { _inner: None })
}

fn init_otel<S>() -> Result<(impl Layer<S>, OtelGuard)>
where
	S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
	use opentelemetry_sdk::Resource;

	// Resource::builder() already reads OTEL_SERVICE_NAME and OTEL_RESOURCE_ATTRIBUTES.
	let mut resource_builder = Resource::builder();
	if std::env::var(OTEL_SERVICE_NAME).is_err() {
		resource_builder = resource_builder.with_service_name(DEFAULT_SERVICE_NAME);
	}

	let exporter = match std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL)
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build()?,
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build()?,
	};

	let tracer_provider = SdkTracerProvider::builder()
		.with_resource(resource_builder.build())
		.with_batch_exporter(exporter)
		.build();

	let layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(tracer_provider.tracer(DEFAULT_SERVICE_NAME));

	opentelemetry::global::set_tracer_provider(tracer_provider.clone());

	Ok((layer, OtelGuard { tracer_provider }))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_explicit_level_wins() {
		assert_eq!(filter(Some(Level::DEBUG)).to_string(), "debug");
	}
}
