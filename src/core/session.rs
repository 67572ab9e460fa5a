//! UDP session table
//!
//! Correlates inbound peer addresses with their upstream sockets. Each entry
//! carries a unique id so that only the task owning a session can remove it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::relay::ActivityClock;

/// Unique session identifier
pub type SessionId = u64;

/// One inbound peer's relay state
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Upstream socket, connected to the upstream endpoint
    pub socket: Arc<UdpSocket>,
    /// Last datagram seen in either direction
    pub activity: Arc<ActivityClock>,
    cancel_token: CancellationToken,
}

impl Session {
    fn new(id: SessionId, socket: UdpSocket) -> Self {
        Self {
            id,
            socket: Arc::new(socket),
            activity: Arc::new(ActivityClock::new()),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Ask the session's forwarding task to stop
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }
}

/// Table of live sessions keyed by inbound peer address
#[derive(Debug, Clone)]
pub struct SessionTable {
    /// Counter for generating unique session IDs
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SocketAddr, Session>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a new session for `peer` around `socket`.
    ///
    /// Returns `Err` with the live session if `peer` already has one; the
    /// offered socket is dropped in that case.
    pub fn insert(&self, peer: SocketAddr, socket: UdpSocket) -> Result<Session, Session> {
        match self.sessions.entry(peer) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let session = Session::new(id, socket);
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Look up the session for `peer`
    pub fn get(&self, peer: &SocketAddr) -> Option<Session> {
        self.sessions.get(peer).map(|entry| entry.value().clone())
    }

    /// Remove `peer`'s entry if it still belongs to session `id`.
    ///
    /// A newer session registered under the same address is left alone.
    pub fn remove(&self, peer: &SocketAddr, id: SessionId) -> bool {
        self.sessions
            .remove_if(peer, |_, session| session.id == id)
            .is_some()
    }

    /// Get the number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every live session; entries are removed by their own tasks
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        cancelled
    }
}
