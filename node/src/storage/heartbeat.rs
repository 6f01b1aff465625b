use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use protocol::connection::{self, LivenessSink};
use protocol::{Id, Liveness};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn};

use crate::util;

const RETRY: Duration = Duration::from_millis(20);

async fn connect(address: SocketAddr) -> LivenessSink {
    use std::io::ErrorKind;
    loop {
        match connection::connect(address).await {
            Ok(stream) => break stream,
            Err(e) => match e.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted => trace!("coordinator not reachable yet"),
                _ => warn!("unexpected error while connecting to coordinator: {e:?}"),
            },
        }
        sleep(RETRY).await;
    }
}

/// send a heartbeat every period unless suppressed, returns when the
/// connection broke
async fn beat(sink: &mut LivenessSink, period: Duration, enabled: &AtomicBool) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if !enabled.load(Ordering::Relaxed) {
            trace!("heartbeat suppressed");
            continue;
        }

        if let Err(e) = sink.send(Liveness::Heartbeat).await {
            warn!("could not send heartbeat, error: {e:?}");
            return;
        }
    }
}

/// Register then heartbeat over one connection, returns once the
/// connection broke.
async fn session(id: Id, port: u16, coordinator: SocketAddr, period: Duration, enabled: &AtomicBool) {
    let mut sink = connect(coordinator).await;
    if let Err(e) = sink.send(Liveness::Register { id, port }).await {
        warn!("could not register with coordinator, error: {e:?}");
        sleep(RETRY).await;
        return;
    }
    info!("registered with coordinator");
    beat(&mut sink, period, enabled).await;
}

/// Register with the coordinator then keep announcing liveness over the
/// same connection. Reconnects and registers again if the connection
/// breaks. Runs until shutdown.
#[instrument(skip(enabled, shutdown))]
pub(super) async fn emit(
    id: Id,
    port: u16,
    coordinator: SocketAddr,
    period: Duration,
    enabled: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = session(id, port, coordinator, period, &enabled) => (),
            () = util::until_shutdown(&mut shutdown) => break,
        }
    }
    debug!("heartbeat emitter stopped");
}
