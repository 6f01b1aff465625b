use crate::Id;

use super::membership::Membership;
use super::Error;

/// Greedy least loaded placement of chunk replicas. The load of a node
/// is the number of replicas ever assigned to it, it only grows.
#[derive(Debug, Clone)]
pub struct Planner {
    /// load of storage node `id` is at index `id - 1`
    loads: Vec<usize>,
    replication: usize,
}

impl Planner {
    pub fn new(storage_nodes: usize, replication: usize) -> Self {
        Self {
            loads: vec![0; storage_nodes],
            replication,
        }
    }

    /// Pick up to `replication` alive nodes with the least load for one
    /// chunk, ties go to the lowest id. Each chosen node's load is
    /// incremented. Empty if no node is alive.
    pub fn place_chunk(&mut self, is_alive: impl Fn(Id) -> bool) -> Vec<Id> {
        let mut candidates: Vec<_> = (1..=self.loads.len() as Id)
            .zip(self.loads.iter().copied())
            .filter(|(id, _)| is_alive(*id))
            .collect();
        candidates.sort_by_key(|(id, load)| (*load, *id));

        let chosen: Vec<Id> = candidates
            .into_iter()
            .take(self.replication)
            .map(|(id, _)| id)
            .collect();
        for id in &chosen {
            self.loads[*id as usize - 1] += 1;
        }
        chosen
    }

    /// Place every chunk of a file in order, each placement sees the
    /// loads left by the previous one. Either all chunks are placed and
    /// the loads are updated or nothing changes.
    pub fn plan(&mut self, n_chunks: usize, membership: &Membership) -> Result<Vec<Vec<Id>>, Error> {
        let mut scratch = self.clone();
        let mut placement = Vec::with_capacity(n_chunks);
        for chunk in 0..n_chunks {
            let nodes = scratch.place_chunk(|id| membership.is_alive(id));
            if nodes.is_empty() {
                return Err(Error::NoCapacity { chunk });
            }
            placement.push(nodes);
        }

        *self = scratch;
        Ok(placement)
    }
}
