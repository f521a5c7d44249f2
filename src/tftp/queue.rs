//! Per-peer session queues
//!
//! Only the head of a peer's queue exchanges packets; everything behind it
//! waits for its deferred start.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use super::session::Session;

#[derive(Debug, Default)]
pub struct SessionTable {
    queues: HashMap<SocketAddr, VecDeque<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the peer's queue. Returns `true` when the session is now the head.
    pub fn enqueue(&mut self, session: Session) -> bool {
        let queue = self.queues.entry(session.address).or_default();
        queue.push_back(session);
        queue.len() == 1
    }

    pub fn head_mut(&mut self, peer: &SocketAddr) -> Option<&mut Session> {
        self.queues.get_mut(peer).and_then(|q| q.front_mut())
    }

    /// Remove the head of the peer's queue; drops the queue entry once empty.
    pub fn pop_head(&mut self, peer: &SocketAddr) -> Option<Session> {
        let queue = self.queues.get_mut(peer)?;
        let session = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(peer);
        }
        session
    }

    /// Peers whose head session satisfies `pred`
    pub fn peers_where(&self, mut pred: impl FnMut(&Session) -> bool) -> Vec<SocketAddr> {
        self.queues
            .iter()
            .filter(|(_, q)| q.front().is_some_and(&mut pred))
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn queue_len(&self, peer: &SocketAddr) -> usize {
        self.queues.get(peer).map_or(0, VecDeque::len)
    }

    pub fn peer_count(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
