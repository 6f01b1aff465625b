use std::net::{Ipv4Addr, SocketAddr};

use chunk_node::{coordinator, storage, util, Settings};
use color_eyre::eyre::Result;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Coordinator and storage nodes in one process, commands are read from
/// stdin. Pass the cluster size as first argument, defaults to 4.
#[tokio::main]
async fn main() -> Result<()> {
    util::setup_errors()?;
    util::setup_tracing("local".into(), None, 0)?;

    let cluster_size = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 4,
    };
    let settings = Settings::new(cluster_size);

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    let coordinator_addr = listener.local_addr()?;

    let mut nodes = JoinSet::new();
    for id in settings.storage_nodes() {
        let (listener, _) = util::open_socket(None).await?;
        let node = storage::work(id, coordinator_addr, settings.timing, listener)
            .instrument(tracing::info_span!("node", id));
        nodes.spawn(node);
    }

    let stdin = BufReader::new(tokio::io::stdin());
    coordinator::work(settings, listener, stdin, tokio::io::stdout())
        .instrument(tracing::info_span!("coordinator"))
        .await?;

    while let Some(res) = nodes.join_next().await {
        res??;
    }
    Ok(())
}
