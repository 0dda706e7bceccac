//! Session storage keyed by peer address.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::message::MessageType;
use crate::session::Session;

/// Owns every live [`Session`].
///
/// Sessions are taken out with [`resolve`](Self::resolve) while a message is
/// processed and put back with [`insert`](Self::insert). The registry also
/// keeps a reverse index from allocated address to peer, rebuilt on every
/// insert and remove, so conflict checks do not scan all sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Ipv4Addr, Session>,
    /// Allocated address → peer holding it.
    holders: HashMap<Ipv4Addr, Ipv4Addr>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &Ipv4Addr) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// Stores a session, replacing and returning any previous one for the
    /// same peer.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        let peer = session.peer();
        let previous = self.remove(&peer);
        if let Some(entry) = session.lease() {
            self.holders.insert(entry.address, peer);
        }
        self.sessions.insert(peer, session);
        previous
    }

    pub fn remove(&mut self, peer: &Ipv4Addr) -> Option<Session> {
        let session = self.sessions.remove(peer)?;
        if let Some(entry) = session.lease()
            && self.holders.get(&entry.address) == Some(peer)
        {
            self.holders.remove(&entry.address);
        }
        Some(session)
    }

    /// Takes the session for `peer` out of the registry for processing.
    ///
    /// An unknown peer only gets a fresh session when it sends DISCOVER;
    /// for any other message type this returns `None`.
    pub fn resolve(&mut self, peer: Ipv4Addr, kind: MessageType) -> Option<Session> {
        match self.remove(&peer) {
            Some(session) => Some(session),
            None if kind == MessageType::Discover => Some(Session::new(peer)),
            None => None,
        }
    }

    /// The peer whose session currently holds `address`.
    pub fn holder_of(&self, address: Ipv4Addr) -> Option<Ipv4Addr> {
        self.holders.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}
