use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::TryStreamExt;
use protocol::connection::{self, LivenessSource};
use protocol::Liveness;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::{util, Id, Settings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// where the node listens for requests, known once it registered
    pub addr: Option<SocketAddr>,
    pub alive: bool,
}

/// Status of every storage node as last derived by the failure detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// storage node `id` is at index `id - 1`
    members: Vec<Member>,
}

impl Membership {
    /// everyone starts alive, the detector treats the start as a heartbeat
    pub fn new(storage_nodes: usize) -> Self {
        let member = Member {
            addr: None,
            alive: true,
        };
        Self {
            members: vec![member; storage_nodes],
        }
    }

    fn get(&self, id: Id) -> Option<&Member> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.members.get(idx)
    }

    fn get_mut(&mut self, id: Id) -> Option<&mut Member> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.members.get_mut(idx)
    }

    pub fn is_alive(&self, id: Id) -> bool {
        self.get(id).map(|m| m.alive).unwrap_or(false)
    }

    pub fn addr(&self, id: Id) -> Option<SocketAddr> {
        self.get(id).and_then(|m| m.addr)
    }

    pub fn alive(&self) -> impl Iterator<Item = Id> + '_ {
        self.ids().filter(|id| self.is_alive(*id))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + Clone {
        1..=self.members.len() as Id
    }

    pub fn all_registered(&self) -> bool {
        self.members.iter().all(|m| m.addr.is_some())
    }

    pub(crate) fn set_alive(&mut self, id: Id, alive: bool) {
        if let Some(member) = self.get_mut(id) {
            member.alive = alive;
        }
    }

    pub(crate) fn set_addr(&mut self, id: Id, addr: SocketAddr) {
        if let Some(member) = self.get_mut(id) {
            member.addr = Some(addr);
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Registered { id: Id, addr: SocketAddr },
    Heartbeat(Id),
}

/// Timeout based liveness, a node is alive while its last heartbeat
/// is younger then the timeout.
#[derive(Debug)]
pub struct Detector {
    last_heartbeat: Vec<Instant>,
    timeout: Duration,
}

impl Detector {
    pub fn new(storage_nodes: usize, start: Instant, timeout: Duration) -> Self {
        Self {
            last_heartbeat: vec![start; storage_nodes],
            timeout,
        }
    }

    pub fn record(&mut self, id: Id, at: Instant) {
        let slot = usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|idx| self.last_heartbeat.get_mut(idx));
        match slot {
            Some(last) => *last = at.max(*last),
            None => warn!("heartbeat from unknown node: {id}"),
        }
    }

    pub fn is_alive(&self, id: Id, now: Instant) -> bool {
        usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|idx| self.last_heartbeat.get(idx))
            .map(|last| now.saturating_duration_since(*last) < self.timeout)
            .unwrap_or(false)
    }

    /// apply pending events and derive the status of every node at `now`
    fn update(&mut self, membership: &mut Membership, events: &mut mpsc::Receiver<Event>, now: Instant) {
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Registered { id, addr } => {
                    info!("node {id} registered, requests go to: {addr}");
                    membership.set_addr(id, addr);
                }
                Event::Heartbeat(id) => self.record(id, now),
            }
        }

        for id in membership.ids() {
            let alive = self.is_alive(id, now);
            if alive != membership.is_alive(id) {
                match alive {
                    true => info!("node {id} is back up"),
                    false => warn!("node {id} missed heartbeats, marking it dead"),
                }
            }
            membership.set_alive(id, alive);
        }
    }
}

/// Failure detector loop, every poll period drains the heartbeats that
/// arrived and publishes the new status.
#[instrument(skip_all)]
pub async fn monitor(
    mut detector: Detector,
    mut events: mpsc::Receiver<Event>,
    status: watch::Sender<Membership>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = interval.tick() => (),
            () = util::until_shutdown(&mut shutdown) => break,
        }

        let mut next = status.borrow().clone();
        detector.update(&mut next, &mut events, Instant::now());
        let changed = next != *status.borrow();
        if changed {
            status.send_replace(next);
        }
    }
    debug!("failure detector stopped");
}

/// accept heartbeat connections from storage nodes
#[instrument(skip_all)]
pub async fn accept_nodes(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        let conn = tokio::select! {
            res = listener.accept() => res,
            () = util::until_shutdown(&mut shutdown) => break,
        };

        match conn {
            Ok((stream, addr)) => {
                let recv = receive_liveness(stream, addr.ip(), events.clone()).in_current_span();
                connections.spawn(recv);
            }
            Err(e) => warn!("could not accept node connection: {e:?}"),
        }
    }
    debug!("stopped accepting nodes");
}

async fn receive_liveness(stream: TcpStream, ip: IpAddr, events: mpsc::Sender<Event>) {
    let mut stream: LivenessSource = connection::wrap(stream);
    let id = match stream.try_next().await {
        Ok(Some(Liveness::Register { id, port })) => {
            let addr = SocketAddr::new(ip, port);
            if events.send(Event::Registered { id, addr }).await.is_err() {
                return;
            }
            id
        }
        other => {
            warn!("expected registration, got: {other:?}");
            return;
        }
    };

    while let Ok(Some(msg)) = stream.try_next().await {
        match msg {
            Liveness::Heartbeat => {
                if events.send(Event::Heartbeat(id)).await.is_err() {
                    return;
                }
            }
            Liveness::Register { .. } => warn!("node {id} registered twice on one connection"),
        }
    }
    debug!("heartbeat connection of node {id} closed");
}

/// The background half of the coordinator: heartbeat intake and
/// failure detection.
pub struct Cluster {
    membership: watch::Receiver<Membership>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Cluster {
    pub fn start(settings: &Settings, listener: TcpListener) -> Self {
        let storage_nodes = settings.storage_nodes().count();
        let (status, membership) = watch::channel(Membership::new(storage_nodes));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events) = mpsc::channel(64 + 4 * storage_nodes);

        let detector = Detector::new(storage_nodes, Instant::now(), settings.timing.timeout);
        let mut tasks = JoinSet::new();
        tasks.spawn(
            monitor(
                detector,
                events,
                status,
                settings.timing.poll,
                shutdown_rx.clone(),
            )
            .in_current_span(),
        );
        tasks.spawn(accept_nodes(listener, events_tx, shutdown_rx).in_current_span());

        Self {
            membership,
            shutdown,
            tasks,
        }
    }

    pub fn membership(&self) -> watch::Receiver<Membership> {
        self.membership.clone()
    }

    pub async fn wait_for_nodes(&mut self) {
        info!("waiting for all storage nodes to register");
        loop {
            if self.membership.borrow_and_update().all_registered() {
                break;
            }
            if self.membership.changed().await.is_err() {
                break;
            }
        }
        info!("all storage nodes registered");
    }

    /// stop the failure detector and heartbeat intake, returns once
    /// both have ended
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                warn!("background task ended abnormally: {e:?}");
            }
        }
    }
}
