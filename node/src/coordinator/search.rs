use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use protocol::{ChunkIdx, Hit, Request, Response};
use tracing::{debug, instrument, warn};

use super::catalog::File;
use super::membership::Membership;
use super::{Coordinator, Error, Transport};
use crate::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// runs off the end of its chunk, the next chunk decides
    Pending,
    /// runs off the end of the file
    Rejected,
}

/// Geometry of a search, what a hit means for a given word and file
#[derive(Debug, Clone, Copy)]
pub struct Boundaries {
    pub chunk_size: usize,
    pub word_len: usize,
    pub chunk_count: usize,
}

impl Boundaries {
    pub fn classify(&self, hit: Hit) -> Validity {
        let end = hit.pos + self.word_len;
        let last = hit.chunk + 1 == self.chunk_count;
        if hit == (Hit { chunk: 0, pos: 0 }) || end < self.chunk_size {
            Validity::Valid
        } else if last && end == self.chunk_size {
            Validity::Valid
        } else if last {
            Validity::Rejected
        } else {
            Validity::Pending
        }
    }

    pub fn offset(&self, hit: Hit) -> usize {
        hit.chunk * self.chunk_size + hit.pos
    }
}

impl<T: Transport> Coordinator<T> {
    /// Every offset in the file where `word` starts, ascending. The nodes
    /// scan their chunks locally, matches that cross into the next chunk
    /// are confirmed by a node holding that chunk.
    #[instrument(skip(self, word), fields(word_len = word.len()))]
    pub(super) async fn search(&self, name: &str, word: &[u8]) -> Result<Vec<usize>, Error> {
        if word.is_empty() {
            return Err(Error::EmptyWord);
        }
        let chunk_size = self.settings.chunk_size;
        if word.len() > chunk_size {
            return Err(Error::WordTooLong {
                len: word.len(),
                chunk_size,
            });
        }

        let file = self.catalog.get(name)?;
        let membership = self.membership();
        if let Some(chunk) = file.unavailable_chunk(&membership) {
            return Err(Error::Unavailable { chunk });
        }

        let hits = self.scan(file, word, &membership).await?;
        let bounds = Boundaries {
            chunk_size,
            word_len: word.len(),
            chunk_count: file.chunk_count(),
        };

        let mut valid = Vec::new();
        let mut pending = Vec::new();
        for hit in hits {
            match bounds.classify(hit) {
                Validity::Valid => valid.push(hit),
                Validity::Pending => pending.push(hit),
                Validity::Rejected => debug!("match runs past end of file: {hit:?}"),
            }
        }
        debug!("{} valid and {} pending hits", valid.len(), pending.len());
        valid.extend(self.verify(file, word, pending, &membership).await?);

        let mut offsets: Vec<_> = valid.into_iter().map(|hit| bounds.offset(hit)).collect();
        offsets.sort_unstable();
        Ok(offsets)
    }

    /// local scan on every alive holder, hits from replicas of the same
    /// chunk are merged
    async fn scan(&self, file: &File, word: &[u8], membership: &Membership) -> Result<BTreeSet<Hit>, Error> {
        let transport = &self.transport;
        let scans = file.alive_holders(membership).into_iter().map(|node| async move {
            let req = Request::Search {
                file: file.id,
                word: word.to_vec(),
            };
            (node, transport.request(node, req).await)
        });

        let mut covered = vec![false; file.chunk_count()];
        let mut merged = BTreeSet::new();
        for (node, res) in join_all(scans).await {
            let (scanned, hits) = match res {
                Ok(Response::Hits { scanned, hits }) => (scanned, hits),
                Ok(other) => {
                    warn!("node {node} answered search with: {other:?}");
                    continue;
                }
                Err(e) => {
                    warn!("node {node} unavailable for search: {e}");
                    continue;
                }
            };

            for idx in scanned {
                if let Some(seen) = covered.get_mut(idx) {
                    *seen = true;
                }
            }
            merged.extend(hits.into_iter().filter(|hit| hit.chunk < file.chunk_count()));
        }

        match covered.iter().position(|seen| !seen) {
            Some(chunk) => Err(Error::Unavailable { chunk }),
            None => Ok(merged),
        }
    }

    /// Ask a node holding the chunk after each pending hit whether the
    /// rest of the word follows, one request per node per round. A hit
    /// moves on to the next alive replica when a node can not answer for
    /// it, once none are left the chunk is unavailable.
    async fn verify(
        &self,
        file: &File,
        word: &[u8],
        pending: Vec<Hit>,
        membership: &Membership,
    ) -> Result<Vec<Hit>, Error> {
        let transport = &self.transport;
        let mut confirmed = Vec::new();
        // with the number of replicas of the next chunk already asked
        let mut unresolved: Vec<(Hit, usize)> = pending.into_iter().map(|hit| (hit, 0)).collect();

        while !unresolved.is_empty() {
            let mut batches: BTreeMap<Id, Vec<(Hit, usize)>> = BTreeMap::new();
            for (hit, asked) in unresolved.drain(..) {
                let next: ChunkIdx = hit.chunk + 1;
                let node = file
                    .alive_replicas(next, membership)
                    .get(asked)
                    .copied()
                    .ok_or(Error::Unavailable { chunk: next })?;
                batches.entry(node).or_default().push((hit, asked));
            }

            let requests = batches.into_iter().map(|(node, batch)| async move {
                let req = Request::Verify {
                    file: file.id,
                    word: word.to_vec(),
                    candidates: batch.iter().map(|(hit, _)| *hit).collect(),
                };
                (node, batch, transport.request(node, req).await)
            });

            for (node, batch, res) in join_all(requests).await {
                let verdicts = match res {
                    Ok(Response::Verified(verdicts)) if verdicts.len() == batch.len() => verdicts,
                    Ok(other) => {
                        warn!("node {node} answered verify with: {other:?}");
                        vec![None; batch.len()]
                    }
                    Err(e) => {
                        warn!("node {node} unavailable for verify: {e}");
                        vec![None; batch.len()]
                    }
                };

                for ((hit, asked), verdict) in batch.into_iter().zip(verdicts) {
                    match verdict {
                        Some(true) => confirmed.push(hit),
                        Some(false) => (),
                        None => unresolved.push((hit, asked + 1)),
                    }
                }
            }
        }
        Ok(confirmed)
    }
}
