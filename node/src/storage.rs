use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use futures::{SinkExt, TryStreamExt};
use protocol::connection::{self, FromCoordinator};
use protocol::{Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::{util, Id, Timing};

mod chunk_store;
mod heartbeat;

pub use chunk_store::ChunkStore;

#[derive(Clone)]
struct Node {
    store: Arc<Mutex<ChunkStore>>,
    /// cleared by a failover, set again by a recover
    heartbeat: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Node {
    async fn answer(&self, req: Request) -> Response {
        match req {
            Request::Failover => {
                info!("failover: no longer sending heartbeats");
                self.heartbeat.store(false, Ordering::Relaxed);
                Response::Done
            }
            Request::Recover => {
                info!("recovered: sending heartbeats again");
                self.heartbeat.store(true, Ordering::Relaxed);
                Response::Done
            }
            Request::Shutdown => Response::Done,
            data_req => {
                let mut store = self.store.lock().await;
                store.answer(data_req).unwrap_or(Response::Done)
            }
        }
    }
}

/// Serve chunk requests and emit heartbeats until the coordinator
/// orders a shutdown.
#[instrument(skip(listener, timing))]
pub async fn work(
    id: Id,
    coordinator: SocketAddr,
    timing: Timing,
    listener: TcpListener,
) -> Result<()> {
    let port = listener.local_addr()?.port();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let node = Node {
        store: Default::default(),
        heartbeat: Arc::new(AtomicBool::new(true)),
        shutdown: Arc::new(shutdown_tx),
    };

    info!("storage node listening for requests on port: {port}");
    let emitter = heartbeat::emit(
        id,
        port,
        coordinator,
        timing.heartbeat,
        node.heartbeat.clone(),
        shutdown.clone(),
    )
    .in_current_span();
    let requests = handle_requests(listener, node.clone(), shutdown).in_current_span();
    tokio::join!(emitter, requests);

    let held = node.store.lock().await.n_chunks();
    info!("storage node shut down, held {held} chunks");
    Ok(())
}

async fn handle_requests(listener: TcpListener, node: Node, mut shutdown: watch::Receiver<bool>) {
    let mut request_handlers = JoinSet::new();
    loop {
        let conn = tokio::select! {
            res = listener.accept() => res,
            () = util::until_shutdown(&mut shutdown) => break,
        };

        match conn {
            Ok((conn, _addr)) => {
                let handle = handle_conn(conn, node.clone()).in_current_span();
                request_handlers.spawn(handle);
            }
            Err(e) => warn!("could not accept connection: {e:?}"),
        }
    }
    debug!("stopped handling requests");
}

async fn handle_conn(stream: TcpStream, node: Node) {
    let mut stream: FromCoordinator = connection::wrap(stream);
    while let Ok(Some(req)) = stream.try_next().await {
        debug!("got request: {req:?}");
        let shutdown = matches!(req, Request::Shutdown);

        let reply = node.answer(req).await;
        if let Err(e) = stream.send(reply).await {
            warn!("error replying to message: {e:?}");
            return;
        }

        // only after replying, the shutdown aborts this task
        if shutdown {
            info!("coordinator ordered shutdown");
            node.shutdown.send_replace(true);
            return;
        }
    }
}
