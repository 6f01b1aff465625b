use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mktemp::Temp;

use super::*;
use crate::storage::ChunkStore;
use crate::util;

/// Feeds requests straight into per node chunk stores. Nodes in `down`
/// behave like a crashed process.
#[derive(Clone, Default)]
struct Mock {
    stores: Arc<Mutex<HashMap<Id, ChunkStore>>>,
    down: Arc<Mutex<HashSet<Id>>>,
    control: Arc<Mutex<Vec<(Id, Request)>>>,
}

#[async_trait]
impl Transport for Mock {
    async fn request(&self, node: Id, req: Request) -> Result<Response, Unreachable> {
        if self.down.lock().unwrap().contains(&node) {
            return Err(Unreachable::Closed);
        }
        let mut stores = self.stores.lock().unwrap();
        match stores.entry(node).or_default().answer(req.clone()) {
            Some(reply) => Ok(reply),
            None => {
                self.control.lock().unwrap().push((node, req));
                Ok(Response::Done)
            }
        }
    }
}

impl Mock {
    fn held(&self, node: Id, file: protocol::FileId) -> Vec<ChunkIdx> {
        let stores = self.stores.lock().unwrap();
        stores
            .get(&node)
            .map(|store| store.chunks(file).iter().map(|c| c.idx).collect())
            .unwrap_or_default()
    }
}

struct Setup {
    coordinator: Coordinator<Mock>,
    mock: Mock,
    status: watch::Sender<Membership>,
    dir: Temp,
}

impl Setup {
    fn new(cluster_size: u16, chunk_size: usize, replication: usize) -> Self {
        util::setup_test_tracing("chunk_node=debug");
        let settings = Settings {
            chunk_size,
            replication,
            ..Settings::new(cluster_size)
        };
        let storage_nodes = settings.storage_nodes().count();
        let (status, membership) = watch::channel(Membership::new(storage_nodes));
        let mock = Mock::default();
        Self {
            coordinator: Coordinator::new(settings, membership, mock.clone()),
            mock,
            status,
            dir: Temp::new_dir().unwrap(),
        }
    }

    async fn upload(&mut self, name: &str, content: &[u8]) -> Option<Reply> {
        let path = self.dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        let cmd = Command::Upload {
            name: name.to_owned(),
            path,
        };
        self.coordinator.handle(cmd).await
    }

    async fn search(&mut self, name: &str, word: &str) -> Option<Reply> {
        let cmd = Command::Search {
            name: name.to_owned(),
            word: word.as_bytes().to_vec(),
        };
        self.coordinator.handle(cmd).await
    }

    async fn retrieve(&mut self, name: &str) -> Option<Reply> {
        let cmd = Command::Retrieve {
            name: name.to_owned(),
        };
        self.coordinator.handle(cmd).await
    }

    async fn list(&mut self, name: &str) -> Option<Reply> {
        let cmd = Command::List {
            name: name.to_owned(),
        };
        self.coordinator.handle(cmd).await
    }

    fn kill(&self, node: Id) {
        self.status.send_modify(|m| m.set_alive(node, false));
    }

    fn revive(&self, node: Id) {
        self.status.send_modify(|m| m.set_alive(node, true));
    }
}

fn alphabet(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

#[tokio::test]
async fn upload_prints_placement() {
    let mut setup = Setup::new(5, 32, 3);
    let reply = setup.upload("f", &alphabet(70)).await.unwrap();

    let placement = vec![vec![1, 2, 3], vec![4, 1, 2], vec![3, 4, 1]];
    assert_eq!(reply, Reply::Uploaded(placement));
    assert_eq!(
        String::from_utf8(reply.render()).unwrap(),
        "1\n0 3 1 2 3\n1 3 4 1 2\n2 3 3 4 1\n"
    );
    assert_eq!(setup.mock.held(1, 1), vec![0, 1, 2]);
    assert_eq!(setup.mock.held(4, 1), vec![1, 2]);
}

#[tokio::test]
async fn retrieve_round_trips_zero_bytes() {
    let mut setup = Setup::new(4, 4, 2);
    let content = b"ab\0cd\0\0ef\0".to_vec();
    setup.upload("f", &content).await.unwrap();

    let reply = setup.retrieve("f").await.unwrap();
    assert_eq!(reply, Reply::Content(content.clone()));

    let mut printed = content;
    printed.push(b'\n');
    assert_eq!(reply.render(), printed);
}

#[tokio::test]
async fn unknown_file_is_not_found() {
    let mut setup = Setup::new(3, 4, 1);
    let not_found = Some(Reply::Failed(Error::NotFound("nope".into())));
    assert_eq!(setup.retrieve("nope").await, not_found);
    assert_eq!(setup.list("nope").await, not_found);
    assert_eq!(setup.search("nope", "a").await, not_found);
    assert_eq!(not_found.unwrap().render(), b"-1\n");
}

#[tokio::test]
async fn upload_rejects_duplicate_and_unreadable() {
    let mut setup = Setup::new(3, 4, 1);
    assert!(matches!(setup.upload("f", b"abc").await, Some(Reply::Uploaded(_))));
    assert_eq!(
        setup.upload("f", b"xyz").await,
        Some(Reply::Failed(Error::Exists("f".into())))
    );

    let path = setup.dir.join("missing");
    let cmd = Command::Upload {
        name: "g".into(),
        path: path.clone(),
    };
    let reply = setup.coordinator.handle(cmd).await;
    assert_eq!(reply, Some(Reply::Failed(Error::Unreadable(path))));

    // the first upload is untouched
    assert_eq!(setup.retrieve("f").await, Some(Reply::Content(b"abc".to_vec())));
}

#[tokio::test]
async fn failed_upload_changes_nothing() {
    let mut setup = Setup::new(3, 4, 1);
    setup.kill(1);
    setup.kill(2);
    assert_eq!(
        setup.upload("f", b"abcdef").await,
        Some(Reply::Failed(Error::NoCapacity { chunk: 0 }))
    );
    assert!(setup.mock.stores.lock().unwrap().is_empty());
    assert_eq!(
        setup.list("f").await,
        Some(Reply::Failed(Error::NotFound("f".into())))
    );

    setup.revive(1);
    setup.revive(2);
    let reply = setup.upload("f", b"abcdef").await;
    assert_eq!(reply, Some(Reply::Uploaded(vec![vec![1], vec![2]])));
    // the failed attempt did not consume a file id
    assert_eq!(setup.mock.held(1, 1), vec![0]);
}

#[tokio::test]
async fn dead_replicas_make_chunks_unavailable() {
    let mut setup = Setup::new(3, 4, 1);
    setup.upload("f", b"abcdefgh").await.unwrap();

    setup.kill(2);
    let unavailable = Some(Reply::Failed(Error::Unavailable { chunk: 1 }));
    assert_eq!(setup.retrieve("f").await, unavailable);
    assert_eq!(setup.search("f", "ab").await, unavailable);
    assert_eq!(setup.list("f").await, Some(Reply::Replicas(vec![vec![1], vec![]])));
}

#[tokio::test]
async fn unreachable_node_counts_as_unavailable() {
    let mut setup = Setup::new(3, 4, 1);
    // the push fails but the assignment stays
    setup.mock.down.lock().unwrap().insert(2);
    let reply = setup.upload("f", b"abcdefgh").await;
    assert_eq!(reply, Some(Reply::Uploaded(vec![vec![1], vec![2]])));

    let unavailable = Some(Reply::Failed(Error::Unavailable { chunk: 1 }));
    assert_eq!(setup.retrieve("f").await, unavailable);
    assert_eq!(setup.search("f", "gh").await, unavailable);
}

#[tokio::test]
async fn replicas_cover_dead_node() {
    let mut setup = Setup::new(4, 4, 2);
    setup.upload("f", b"abcdeabc").await.unwrap();
    setup.kill(1);
    setup.mock.down.lock().unwrap().insert(1);

    assert_eq!(setup.retrieve("f").await, Some(Reply::Content(b"abcdeabc".to_vec())));
    assert_eq!(setup.search("f", "cdea").await, Some(Reply::Found(vec![2])));
}

#[tokio::test]
async fn boundary_check_skips_replica_missing_chunk() {
    let mut setup = Setup::new(4, 4, 2);
    // node 3 misses the store push for chunk 1 but is alive afterwards
    setup.mock.down.lock().unwrap().insert(3);
    let reply = setup.upload("f", b"abcdeabc").await;
    assert_eq!(reply, Some(Reply::Uploaded(vec![vec![1, 2], vec![3, 1]])));
    setup.mock.down.lock().unwrap().remove(&3);
    assert!(setup.mock.held(3, 1).is_empty());

    assert_eq!(setup.search("f", "de").await, Some(Reply::Found(vec![3])));
    assert_eq!(setup.search("f", "cdea").await, Some(Reply::Found(vec![2])));
    assert_eq!(setup.search("f", "dx").await, Some(Reply::Found(vec![])));
}

#[tokio::test]
async fn boundary_check_skips_unreachable_replica() {
    let mut setup = Setup::new(4, 4, 2);
    let reply = setup.upload("f", b"abcdeabc").await;
    assert_eq!(reply, Some(Reply::Uploaded(vec![vec![1, 2], vec![3, 1]])));

    // still alive as far as the failure detector knows
    setup.mock.down.lock().unwrap().insert(3);
    assert_eq!(setup.search("f", "de").await, Some(Reply::Found(vec![3])));
}

#[tokio::test]
async fn list_is_idempotent() {
    let mut setup = Setup::new(5, 32, 3);
    setup.upload("f", &alphabet(70)).await.unwrap();
    setup.kill(4);

    let expected = Reply::Replicas(vec![vec![1, 2, 3], vec![1, 2], vec![3, 1]]);
    assert_eq!(setup.list("f").await.as_ref(), Some(&expected));
    assert_eq!(setup.list("f").await.as_ref(), Some(&expected));
    assert_eq!(
        String::from_utf8(expected.render()).unwrap(),
        "0 3 1 2 3\n1 2 1 2\n2 2 3 1\n"
    );
}

#[tokio::test]
async fn search_across_chunk_boundaries() {
    // one replica per chunk so matches crossing a boundary are always
    // verified by another node
    let mut setup = Setup::new(3, 4, 1);
    setup.upload("f", b"abcdeabc").await.unwrap();

    assert_eq!(setup.search("f", "de").await, Some(Reply::Found(vec![3])));
    assert_eq!(setup.search("f", "cdea").await, Some(Reply::Found(vec![2])));
    assert_eq!(setup.search("f", "eabc").await, Some(Reply::Found(vec![4])));
    assert_eq!(setup.search("f", "abc").await, Some(Reply::Found(vec![0, 5])));
    assert_eq!(setup.search("f", "dx").await, Some(Reply::Found(vec![])));
}

#[tokio::test]
async fn search_merges_replicas() {
    let mut setup = Setup::new(3, 4, 2);
    setup.upload("f", b"abcdeabc").await.unwrap();

    let reply = setup.search("f", "abc").await.unwrap();
    assert_eq!(reply, Reply::Found(vec![0, 5]));
    assert_eq!(String::from_utf8(reply.render()).unwrap(), "2\n0 5\n");
}

#[tokio::test]
async fn padding_never_matches() {
    let mut setup = Setup::new(3, 4, 1);
    setup.upload("f", b"abcdeab").await.unwrap();
    assert_eq!(setup.search("f", "abc").await, Some(Reply::Found(vec![0])));
    assert_eq!(setup.search("f", "ab").await, Some(Reply::Found(vec![0, 5])));
}

#[tokio::test]
async fn search_rejects_bad_words() {
    let mut setup = Setup::new(3, 4, 1);
    setup.upload("f", b"abcdeabc").await.unwrap();
    assert_eq!(
        setup.search("f", "abcde").await,
        Some(Reply::Failed(Error::WordTooLong {
            len: 5,
            chunk_size: 4
        }))
    );
    assert_eq!(
        setup.search("f", "").await,
        Some(Reply::Failed(Error::EmptyWord))
    );
}

#[tokio::test]
async fn empty_file() {
    let mut setup = Setup::new(3, 4, 1);
    let reply = setup.upload("f", b"").await.unwrap();
    assert_eq!(reply.render(), b"1\n");
    assert_eq!(setup.retrieve("f").await, Some(Reply::Content(Vec::new())));

    let reply = setup.search("f", "a").await.unwrap();
    assert_eq!(String::from_utf8(reply.render()).unwrap(), "0\n\n");
}

#[tokio::test]
async fn failover_and_recover() {
    let mut setup = Setup::new(3, 4, 1);
    let reply = setup.coordinator.handle(Command::Failover(2)).await;
    assert_eq!(reply.map(|r| r.render()), Some(b"1\n".to_vec()));
    assert_eq!(setup.coordinator.handle(Command::Recover(2)).await, None);

    // not a storage node: nothing is printed or sent
    assert_eq!(setup.coordinator.handle(Command::Failover(0)).await, None);
    assert_eq!(setup.coordinator.handle(Command::Failover(3)).await, None);
    assert_eq!(setup.coordinator.handle(Command::Recover(7)).await, None);

    let control = setup.mock.control.lock().unwrap();
    assert_eq!(control.len(), 2);
    assert!(matches!(control[0], (2, Request::Failover)));
    assert!(matches!(control[1], (2, Request::Recover)));
}

#[tokio::test]
async fn exit_reaches_dead_nodes() {
    let setup = Setup::new(4, 4, 1);
    setup.kill(2);
    setup.coordinator.exit().await;

    let control = setup.mock.control.lock().unwrap();
    let shut_down: Vec<_> = control
        .iter()
        .filter(|(_, req)| matches!(req, Request::Shutdown))
        .map(|(node, _)| *node)
        .collect();
    assert_eq!(shut_down.len(), 3);
    assert!(shut_down.contains(&2));
}
