use std::net::{IpAddr, SocketAddr};
use std::num::{NonZeroU16, NonZeroUsize};
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
pub use color_eyre::eyre::WrapErr;
use tracing::{info, instrument};

pub mod command;
pub mod coordinator;
pub mod storage;
pub mod util;

pub use protocol::{ChunkIdx, FileId, Id, COORDINATOR};

/// One process of the chunk storage cluster
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// Id of this node, 0 runs the coordinator
    #[clap(short, long)]
    pub id: Id,
    /// number of processes in the cluster including the coordinator,
    /// must be fixed
    #[clap(short, long)]
    pub cluster_size: u16,
    /// address on which the coordinator listens for storage nodes
    #[clap(long, default_value = "127.0.0.1:4242")]
    pub coordinator: SocketAddr,
    /// Optional, port on which a storage node listens for requests
    /// by default pick a free port
    #[clap(short, long)]
    pub port: Option<NonZeroU16>,

    /// bytes per chunk
    #[clap(long, default_value = "32")]
    pub chunk_size: NonZeroUsize,
    /// maximum number of replicas per chunk
    #[clap(long, default_value_t = 3)]
    pub replication: usize,

    #[clap(long, default_value_t = 1000)]
    pub heartbeat_ms: u64,
    #[clap(long, default_value_t = 100)]
    pub poll_ms: u64,
    /// a node without heartbeat for this long is considered dead
    #[clap(long, default_value_t = 3000)]
    pub timeout_ms: u64,
    /// bound on every request the coordinator sends to a node
    #[clap(long, default_value_t = 2000)]
    pub request_timeout_ms: u64,

    /// Instrumentation endpoint, traces are only exported if set
    #[clap(short, long)]
    pub endpoint: Option<IpAddr>,
    /// Run
    #[clap(short('u'), long, default_value_t = 0)]
    pub run: u16,
}

/// Intervals driving heartbeats, failure detection and requests
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// period between heartbeats send by a storage node
    pub heartbeat: Duration,
    /// period between failure detector updates
    pub poll: Duration,
    /// a node is dead once its last heartbeat is this old
    pub timeout: Duration,
    /// maximum time a single coordinator to node request may take
    pub request: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(1),
            poll: Duration::from_millis(100),
            timeout: Duration::from_secs(3),
            request: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub cluster_size: u16,
    pub chunk_size: usize,
    pub replication: usize,
    pub timing: Timing,
}

impl Settings {
    pub fn new(cluster_size: u16) -> Self {
        Self {
            cluster_size,
            chunk_size: 32,
            replication: 3,
            timing: Timing::default(),
        }
    }

    /// ids of all storage nodes
    pub fn storage_nodes(&self) -> impl Iterator<Item = Id> + Clone {
        1..self.cluster_size as Id
    }
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            cluster_size: self.cluster_size,
            chunk_size: self.chunk_size.get(),
            replication: self.replication,
            timing: Timing {
                heartbeat: Duration::from_millis(self.heartbeat_ms),
                poll: Duration::from_millis(self.poll_ms),
                timeout: Duration::from_millis(self.timeout_ms),
                request: Duration::from_millis(self.request_timeout_ms),
            },
        }
    }
}

#[instrument(level = "info", skip_all, fields(id = conf.id))]
pub async fn run(conf: Config) -> Result<()> {
    let settings = conf.settings();
    if conf.id == COORDINATOR {
        info!("starting as coordinator of {} nodes", conf.cluster_size);
        let listener = tokio::net::TcpListener::bind(conf.coordinator)
            .await
            .wrap_err_with(|| format!("Could not bind to address: {}", conf.coordinator))?;
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        coordinator::work(settings, listener, stdin, tokio::io::stdout()).await
    } else {
        info!("starting as storage node");
        let (listener, _) = util::open_socket(conf.port).await?;
        storage::work(conf.id, conf.coordinator, settings.timing, listener).await
    }
}
