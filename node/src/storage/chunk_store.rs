use std::collections::{BTreeMap, HashMap};

use protocol::{Chunk, ChunkIdx, FileId, Hit, Request, Response};
use tracing::warn;

/// The chunks this storage node holds, per file ordered by index
#[derive(Debug, Default)]
pub struct ChunkStore {
    files: HashMap<FileId, BTreeMap<ChunkIdx, Chunk>>,
}

impl ChunkStore {
    /// never rejects a chunk, a chunk pushed twice replaces the earlier copy
    pub fn store(&mut self, chunks: Vec<Chunk>) {
        for chunk in chunks {
            self.files
                .entry(chunk.file)
                .or_default()
                .insert(chunk.idx, chunk);
        }
    }

    pub fn chunks(&self, file: FileId) -> Vec<Chunk> {
        self.files
            .get(&file)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn n_chunks(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }

    /// Scan every held chunk of `file` for `word`. Returns the indices
    /// of the scanned chunks and every position where the word starts.
    /// A position is also reported if only a prefix of the word fits
    /// before the end of a full chunk, the coordinator verifies those
    /// against the next chunk.
    pub fn search(&self, file: FileId, word: &[u8]) -> (Vec<ChunkIdx>, Vec<Hit>) {
        let mut scanned = Vec::new();
        let mut hits = Vec::new();
        for chunk in self.files.get(&file).into_iter().flat_map(BTreeMap::values) {
            scanned.push(chunk.idx);
            hits.extend(scan(chunk, word).map(|pos| Hit {
                chunk: chunk.idx,
                pos,
            }));
        }
        (scanned, hits)
    }

    /// For every candidate check whether the chunk following it starts
    /// with the part of `word` that ran off the end of the candidates chunk.
    /// `None` if that chunk is not held here.
    pub fn verify(&self, file: FileId, word: &[u8], candidates: &[Hit]) -> Vec<Option<bool>> {
        candidates
            .iter()
            .map(|candidate| {
                let next = self
                    .files
                    .get(&file)
                    .and_then(|chunks| chunks.get(&(candidate.chunk + 1)));
                match next {
                    Some(next) => Some(continues_in(next, word, candidate.pos)),
                    None => {
                        warn!("asked to verify against chunk we do not hold: {candidate:?}");
                        None
                    }
                }
            })
            .collect()
    }

    /// answer a data request, returns None for control requests
    pub fn answer(&mut self, req: Request) -> Option<Response> {
        Some(match req {
            Request::Store(chunks) => {
                self.store(chunks);
                Response::Stored
            }
            Request::Fetch { file } => Response::Chunks(self.chunks(file)),
            Request::Search { file, word } => {
                let (scanned, hits) = self.search(file, &word);
                Response::Hits { scanned, hits }
            }
            Request::Verify {
                file,
                word,
                candidates,
            } => Response::Verified(self.verify(file, &word, &candidates)),
            Request::Failover | Request::Recover | Request::Shutdown => return None,
        })
    }
}

/// positions in the chunk where `word` starts, only content bytes are
/// considered. A match cut short by the end of a full chunk counts, one
/// cut short by padding can never continue and does not.
fn scan<'a>(chunk: &'a Chunk, word: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    let content = chunk.content();
    (0..content.len()).filter(move |&pos| {
        let tail = &content[pos..];
        if tail.len() >= word.len() {
            tail.starts_with(word)
        } else {
            chunk.is_full() && word.starts_with(tail)
        }
    })
}

/// `pos` is where the word started in the chunk before `next`
fn continues_in(next: &Chunk, word: &[u8], pos: usize) -> bool {
    let chunk_size = next.data.len();
    if pos >= chunk_size {
        return false;
    }
    let consumed = (chunk_size - pos).min(word.len());
    let rest = &word[consumed..];
    next.content().starts_with(rest)
}
