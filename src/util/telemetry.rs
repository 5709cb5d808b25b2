use opentelemetry::trace::TraceContextExt as _;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt as _;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch the current trace id from the active span, for correlating logs
/// produced by a single reconcile pass.
pub fn get_trace_id() -> opentelemetry::trace::TraceId {
    Span::current().context().span().span_context().trace_id()
}

/// Initialize tracing: compact formatter, `RUST_LOG`-driven filter, falling
/// back to `info` when unset.
pub async fn init() {
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();

    let collector = Registry::default().with(logger).with(env_filter);

    tracing::subscriber::set_global_default(collector).unwrap();
}
