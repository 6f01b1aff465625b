use std::collections::{BTreeSet, HashMap};

use protocol::{Chunk, ChunkIdx, FileId};

use super::membership::Membership;
use super::Error;
use crate::{util, Id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: FileId,
    pub name: String,
    /// content length in bytes, the last chunk is padded past it
    pub len: usize,
    /// nodes holding a replica, per chunk
    pub replicas: Vec<Vec<Id>>,
}

impl File {
    pub fn chunk_count(&self) -> usize {
        self.replicas.len()
    }

    /// alive nodes that hold at least one chunk of this file
    pub fn alive_holders(&self, membership: &Membership) -> BTreeSet<Id> {
        self.replicas
            .iter()
            .flatten()
            .copied()
            .filter(|id| membership.is_alive(*id))
            .collect()
    }

    pub fn alive_replicas(&self, chunk: ChunkIdx, membership: &Membership) -> Vec<Id> {
        self.replicas[chunk]
            .iter()
            .copied()
            .filter(|id| membership.is_alive(*id))
            .collect()
    }

    /// first chunk without a single alive replica
    pub fn unavailable_chunk(&self, membership: &Membership) -> Option<ChunkIdx> {
        (0..self.chunk_count()).find(|chunk| self.alive_replicas(*chunk, membership).is_empty())
    }
}

/// Every successfully uploaded file, files are never changed or removed
#[derive(Debug, Default)]
pub struct Catalog {
    by_name: HashMap<String, File>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Result<&File, Error> {
        self.by_name
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// ids start at 1 and are only consumed by a successful upload
    pub fn next_id(&self) -> FileId {
        self.by_name.len() as FileId + 1
    }

    pub fn register(&mut self, file: File) {
        self.by_name.insert(file.name.clone(), file);
    }
}

/// Cut content into chunks of exactly `chunk_size` bytes, the last is
/// zero padded.
pub fn split(file: FileId, content: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(util::div_ceil(content.len(), chunk_size));
    for (idx, part) in content.chunks(chunk_size).enumerate() {
        let mut data = part.to_vec();
        data.resize(chunk_size, 0);
        chunks.push(Chunk {
            file,
            idx,
            fill: part.len(),
            data,
        });
    }
    chunks
}
