use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, TryStreamExt};
use protocol::connection::{self, ToNode};
use protocol::{Request, Response};
use tokio::sync::watch;
use tracing::{instrument, trace};

use super::membership::Membership;
use crate::Id;

#[derive(Debug, thiserror::Error)]
pub enum Unreachable {
    #[error("node {0} never registered")]
    Unregistered(Id),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before reply")]
    Closed,
    #[error("io error talking to node: {0}")]
    Io(#[from] io::Error),
}

/// How the coordinator reaches storage nodes. Every request is
/// answered by exactly one response or fails.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, node: Id, req: Request) -> Result<Response, Unreachable>;
}

/// A fresh connection per request, bounded by a timeout so a node that
/// dies mid request can not stall the coordinator.
pub struct Tcp {
    membership: watch::Receiver<Membership>,
    timeout: Duration,
}

impl Tcp {
    pub fn new(membership: watch::Receiver<Membership>, timeout: Duration) -> Self {
        Self {
            membership,
            timeout,
        }
    }
}

async fn exchange(addr: SocketAddr, req: Request) -> Result<Response, Unreachable> {
    let mut stream: ToNode = connection::connect(addr).await?;
    stream.send(req).await?;
    stream.try_next().await?.ok_or(Unreachable::Closed)
}

#[async_trait]
impl Transport for Tcp {
    #[instrument(skip(self, req), level = "trace")]
    async fn request(&self, node: Id, req: Request) -> Result<Response, Unreachable> {
        let addr = self
            .membership
            .borrow()
            .addr(node)
            .ok_or(Unreachable::Unregistered(node))?;

        trace!("sending to {addr}");
        tokio::time::timeout(self.timeout, exchange(addr, req))
            .await
            .map_err(|_| Unreachable::Timeout(self.timeout))?
    }
}
