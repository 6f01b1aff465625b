use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use futures::future::join_all;
use protocol::{Chunk, ChunkIdx, Request, Response};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::command::{Command, ParseError};
use crate::{Id, Settings};

mod catalog;
pub mod membership;
mod placement;
mod search;
pub mod transport;

use catalog::{Catalog, File};
use membership::{Cluster, Membership};
use placement::Planner;
pub use transport::{Tcp, Transport, Unreachable};

/// Why an operator command failed, every kind is reported as `-1`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no file named: {0}")]
    NotFound(String),
    #[error("no alive replica could provide chunk {chunk}")]
    Unavailable { chunk: ChunkIdx },
    #[error("no alive node to place chunk {chunk} on")]
    NoCapacity { chunk: ChunkIdx },
    #[error("word of {len} bytes is longer then a chunk ({chunk_size} bytes)")]
    WordTooLong { len: usize, chunk_size: usize },
    #[error("can not search for an empty word")]
    EmptyWord,
    #[error("there is no storage node: {0}")]
    InvalidNode(Id),
    #[error("a file named {0} already exists")]
    Exists(String),
    #[error("could not read file to upload: {0:?}")]
    Unreadable(PathBuf),
}

/// Result of an operator command as printed on the command stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// per chunk the nodes it was placed on
    Uploaded(Vec<Vec<Id>>),
    Content(Vec<u8>),
    /// ascending offsets of every match
    Found(Vec<usize>),
    /// per chunk the alive nodes holding it
    Replicas(Vec<Vec<Id>>),
    Ack,
    Failed(Error),
}

fn write_chunk_nodes(out: &mut Vec<u8>, per_chunk: &[Vec<Id>]) {
    for (idx, nodes) in per_chunk.iter().enumerate() {
        let _ = write!(out, "{idx} {}", nodes.len());
        for node in nodes {
            let _ = write!(out, " {node}");
        }
        out.push(b'\n');
    }
}

impl Reply {
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Reply::Uploaded(placement) => {
                out.extend_from_slice(b"1\n");
                write_chunk_nodes(&mut out, placement);
            }
            Reply::Content(content) => {
                out.extend_from_slice(content);
                out.push(b'\n');
            }
            Reply::Found(offsets) => {
                let offsets: Vec<_> = offsets.iter().map(usize::to_string).collect();
                let _ = writeln!(out, "{}\n{}", offsets.len(), offsets.join(" "));
            }
            Reply::Replicas(replicas) => write_chunk_nodes(&mut out, replicas),
            Reply::Ack => out.extend_from_slice(b"1\n"),
            Reply::Failed(_) => out.extend_from_slice(b"-1\n"),
        }
        out
    }
}

/// Owns the catalog and placement state, handles one command at a time
pub struct Coordinator<T> {
    settings: Settings,
    catalog: Catalog,
    planner: Planner,
    membership: watch::Receiver<Membership>,
    transport: T,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(settings: Settings, membership: watch::Receiver<Membership>, transport: T) -> Self {
        let storage_nodes = settings.storage_nodes().count();
        Self {
            settings,
            catalog: Catalog::default(),
            planner: Planner::new(storage_nodes, settings.replication),
            membership,
            transport,
        }
    }

    /// the failure detectors view at this moment
    fn membership(&self) -> Membership {
        self.membership.borrow().clone()
    }

    fn is_storage_node(&self, node: Id) -> bool {
        self.settings.storage_nodes().any(|id| id == node)
    }

    /// Handle one command, returns what to print. `Exit` is not handled
    /// here, see [`Coordinator::exit`].
    #[instrument(skip(self))]
    pub async fn handle(&mut self, cmd: Command) -> Option<Reply> {
        let res = match cmd {
            Command::Upload { name, path } => self.upload(name, path).await.map(Reply::Uploaded),
            Command::Retrieve { name } => self.retrieve(&name).await.map(Reply::Content),
            Command::Search { name, word } => self.search(&name, &word).await.map(Reply::Found),
            Command::List { name } => self.list(&name).map(Reply::Replicas),
            Command::Failover(node) => self.failover(node).await.map(|_| Reply::Ack),
            Command::Recover(node) => {
                if let Err(e) = self.recover(node).await {
                    debug!("ignoring recover: {e}");
                }
                return None;
            }
            Command::Exit => {
                warn!("exit must be handled by the caller");
                return None;
            }
        };

        match res {
            Ok(reply) => Some(reply),
            Err(e @ Error::InvalidNode(_)) => {
                debug!("ignoring command: {e}");
                None
            }
            Err(e) => {
                warn!("command failed: {e}");
                Some(Reply::Failed(e))
            }
        }
    }

    async fn upload(&mut self, name: String, path: PathBuf) -> Result<Vec<Vec<Id>>, Error> {
        if self.catalog.contains(&name) {
            return Err(Error::Exists(name));
        }
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read {path:?}: {e}");
                return Err(Error::Unreadable(path));
            }
        };

        let id = self.catalog.next_id();
        let chunks = catalog::split(id, &content, self.settings.chunk_size);
        let membership = self.membership();
        let placement = self.planner.plan(chunks.len(), &membership)?;

        let mut batches: BTreeMap<Id, Vec<Chunk>> = BTreeMap::new();
        for (chunk, nodes) in chunks.iter().zip(&placement) {
            for node in nodes {
                batches.entry(*node).or_default().push(chunk.clone());
            }
        }

        let transport = &self.transport;
        let pushes = batches.into_iter().map(|(node, batch)| async move {
            (node, transport.request(node, Request::Store(batch)).await)
        });
        for (node, res) in join_all(pushes).await {
            match res {
                Ok(Response::Stored) => (),
                Ok(other) => warn!("node {node} answered store with: {other:?}"),
                Err(e) => warn!("could not push chunks to node {node}: {e}"),
            }
        }

        info!(
            "uploaded {name} as file {id}, {} bytes in {} chunks",
            content.len(),
            chunks.len()
        );
        self.catalog.register(File {
            id,
            name,
            len: content.len(),
            replicas: placement.clone(),
        });
        Ok(placement)
    }

    async fn retrieve(&self, name: &str) -> Result<Vec<u8>, Error> {
        let file = self.catalog.get(name)?;
        let membership = self.membership();

        let transport = &self.transport;
        let fetches = file.alive_holders(&membership).into_iter().map(|node| async move {
            let req = Request::Fetch { file: file.id };
            (node, transport.request(node, req).await)
        });

        let mut found: Vec<Option<Chunk>> = vec![None; file.chunk_count()];
        for (node, res) in join_all(fetches).await {
            let chunks = match res {
                Ok(Response::Chunks(chunks)) => chunks,
                Ok(other) => {
                    warn!("node {node} answered fetch with: {other:?}");
                    continue;
                }
                Err(e) => {
                    warn!("node {node} unavailable for retrieve: {e}");
                    continue;
                }
            };

            for chunk in chunks.into_iter().filter(|c| c.file == file.id) {
                match found.get_mut(chunk.idx) {
                    Some(slot @ None) => *slot = Some(chunk),
                    Some(Some(_)) => (),
                    None => warn!("node {node} returned unknown chunk: {}", chunk.idx),
                }
            }
        }

        let mut content = Vec::with_capacity(file.len);
        for (idx, chunk) in found.into_iter().enumerate() {
            let chunk = chunk.ok_or(Error::Unavailable { chunk: idx })?;
            content.extend_from_slice(chunk.content());
        }
        content.truncate(file.len);
        Ok(content)
    }

    fn list(&self, name: &str) -> Result<Vec<Vec<Id>>, Error> {
        let file = self.catalog.get(name)?;
        let membership = self.membership();
        Ok((0..file.chunk_count())
            .map(|chunk| file.alive_replicas(chunk, &membership))
            .collect())
    }

    async fn control(&self, node: Id, req: Request) -> Result<(), Error> {
        if !self.is_storage_node(node) {
            return Err(Error::InvalidNode(node));
        }
        match self.transport.request(node, req).await {
            Ok(Response::Done) => (),
            Ok(other) => warn!("node {node} answered control request with: {other:?}"),
            Err(e) => warn!("could not reach node {node}: {e}"),
        }
        Ok(())
    }

    /// The node stops heartbeating but keeps serving, it is only marked
    /// dead once the failure detector times out.
    async fn failover(&self, node: Id) -> Result<(), Error> {
        info!("failing over node {node}");
        self.control(node, Request::Failover).await
    }

    async fn recover(&self, node: Id) -> Result<(), Error> {
        info!("recovering node {node}");
        self.control(node, Request::Recover).await
    }

    /// Order every storage node to shut down, dead or alive
    pub async fn exit(&self) {
        info!("shutting down cluster");
        let transport = &self.transport;
        let shutdowns = self
            .settings
            .storage_nodes()
            .map(|node| async move { (node, transport.request(node, Request::Shutdown).await) });
        for (node, res) in join_all(shutdowns).await {
            if let Err(e) = res {
                warn!("could not shut down node {node}: {e}");
            }
        }
    }
}

/// Execute commands until `exit` or the end of the input. Lines that are
/// not valid commands are skipped, only a broken stream is an error.
async fn serve<T, R, W>(coordinator: &mut Coordinator<T>, mut input: R, mut output: W) -> io::Result<()>
where
    T: Transport,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let text = match std::str::from_utf8(&line) {
            Ok(text) => text,
            Err(e) => {
                warn!("ignoring line that is not utf-8: {e}");
                continue;
            }
        };
        let cmd = match text.parse::<Command>() {
            Ok(Command::Exit) => return Ok(()),
            Ok(cmd) => cmd,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                warn!("ignoring line {text:?}: {e}");
                continue;
            }
        };

        if let Some(reply) = coordinator.handle(cmd).await {
            output.write_all(&reply.render()).await?;
            output.flush().await?;
        }
    }
}

/// Run the coordinator: wait for every storage node, then execute the
/// commands read from `input` writing results to `output`. Returns after
/// `exit`, the end of the input or a broken operator stream, always once
/// the cluster is shut down.
pub async fn work<R, W>(settings: Settings, listener: TcpListener, input: R, output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut cluster = Cluster::start(&settings, listener);
    cluster.wait_for_nodes().await;

    let transport = Tcp::new(cluster.membership(), settings.timing.request);
    let mut coordinator = Coordinator::new(settings, cluster.membership(), transport);
    let res = serve(&mut coordinator, input, output).await;

    coordinator.exit().await;
    cluster.stop().await;
    info!("coordinator done");
    res.wrap_err("operator command stream broke")
}

#[cfg(test)]
mod tests;
