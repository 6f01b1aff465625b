use serde::{Deserialize, Serialize};

pub mod connection;

/// Node id, `0` is the coordinator, storage nodes are `1..cluster_size`
pub type Id = u64;
pub type FileId = u64;
pub type ChunkIdx = usize;

pub const COORDINATOR: Id = 0;

/// Fixed size slice of a file. `data` always holds exactly chunk size
/// bytes, everything past `fill` is zero padding.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub file: FileId,
    pub idx: ChunkIdx,
    /// number of bytes of `data` that are file content
    pub fill: usize,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn content(&self) -> &[u8] {
        &self.data[..self.fill]
    }

    /// the chunk has no padding, a match running off its end could
    /// continue in the next chunk
    pub fn is_full(&self) -> bool {
        self.fill == self.data.len()
    }
}

/// A position in a chunk where the searched word (possibly only its
/// prefix) was found.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hit {
    pub chunk: ChunkIdx,
    pub pos: usize,
}

/// Send by the coordinator to a storage node, each answered by
/// exactly one [`Response`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// add chunks to the store, answered by `Stored`
    Store(Vec<Chunk>),
    /// all chunks held for a file, answered by `Chunks`
    Fetch { file: FileId },
    /// scan every held chunk of the file for the word, answered by `Hits`
    Search { file: FileId, word: Vec<u8> },
    /// for each candidate check if the chunk after `candidate.chunk`
    /// starts with the part of the word that did not fit. Answered by
    /// `Verified` with one entry per candidate in the same order, `None`
    /// where the node does not hold that chunk.
    Verify {
        file: FileId,
        word: Vec<u8>,
        candidates: Vec<Hit>,
    },
    /// stop sending heartbeats, keep serving requests
    Failover,
    /// resume sending heartbeats
    Recover,
    /// stop all tasks of the node
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    Stored,
    Chunks(Vec<Chunk>),
    Hits {
        /// chunk indices this node scanned
        scanned: Vec<ChunkIdx>,
        hits: Vec<Hit>,
    },
    Verified(Vec<Option<bool>>),
    /// control request was applied
    Done,
}

/// Send by a storage node over its long lived connection to the
/// coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Liveness {
    /// first message on the connection, the port is where the node
    /// listens for requests
    Register { id: Id, port: u16 },
    Heartbeat,
}
