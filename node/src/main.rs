use chunk_node::{run, util, Config};
use clap::Parser;
use color_eyre::eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let conf = Config::parse();

    util::setup_errors()?;
    util::setup_tracing(conf.id.to_string(), conf.endpoint, conf.run)?;

    let res = run(conf).await;
    opentelemetry::global::shutdown_tracer_provider();
    res
}
