use opentelemetry::sdk::resource::Resource;
use opentelemetry::sdk::trace;
use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;

use tracing_error::ErrorLayer;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use std::net::IpAddr;

const FILTER: &str = "warn,chunk_node=info,chunk_node::storage=debug";

fn opentelemetry<S>(
    instance: String,
    endpoint: IpAddr,
    run: u16,
) -> Result<OpenTelemetryLayer<S, opentelemetry::sdk::trace::Tracer>, TraceError>
where
    S: tracing::subscriber::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    let run_numb = run.to_string();
    let resouces = vec![
        KeyValue::new("instance", instance),
        KeyValue::new("run", run_numb),
    ];
    let config = trace::Config::default().with_resource(Resource::new(resouces));

    let tracer = opentelemetry_jaeger::new_pipeline()
        .with_trace_config(config)
        .with_agent_endpoint((endpoint, 6831))
        .with_auto_split_batch(true)
        .with_service_name("chunk-cluster")
        .install_batch(opentelemetry::runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Logs go to stderr, stdout carries the results of operator commands
pub fn setup_tracing(
    instance: String,
    endpoint: Option<IpAddr>,
    run: u16,
) -> Result<(), TraceError> {
    let filter = filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter::EnvFilter::new(FILTER));

    let uptime = fmt::time::uptime();
    if let Some(endpoint) = endpoint {
        // ugly code duplication, needed or generics get angry
        let fmt_layer = fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_timer(uptime)
            .with_writer(std::io::stderr);

        let telemetry = opentelemetry(instance, endpoint, run)?;
        let _ignore_err = tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(filter)
            .with(telemetry)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_line_number(true)
            .with_timer(uptime)
            .with_writer(std::io::stderr);
        let _ignore_err = tracing_subscriber::registry()
            .with(ErrorLayer::default())
            .with(filter)
            .with(fmt_layer)
            .try_init();
    }
    Ok(())
}

#[allow(dead_code)]
pub fn setup_test_tracing(additional_filter: &str) {
    let base_filter = "info";
    let filter = filter::EnvFilter::new(format!("{base_filter},{additional_filter}"));

    let fmt = fmt::layer()
        .pretty()
        .with_line_number(true)
        .with_test_writer();

    let _ignore_err = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(filter)
        .with(fmt)
        .try_init();
}

pub fn setup_errors() -> color_eyre::Result<()> {
    color_eyre::install()
}
