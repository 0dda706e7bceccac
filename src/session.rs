//! Server-side per-peer protocol state.
//!
//! A [`Session`] tracks one peer from its first DISCOVER until the lease is
//! released or expires:
//!
//! ```text
//! WAIT_DISCOVER --DISCOVER/OFFER--> WAIT_REQUEST --REQUEST/ACK--> WAIT_RELEASE
//!       ^                                |                          |    ^
//!       +------ conflict (ACK error) ----+--------------------------+    |
//!                                                                  REQUEST_EXTEND
//! ```
//!
//! RELEASE and lease expiry are handled by the server, which removes the
//! session from the registry and calls [`Session::terminate`].

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::message::{Code, LeaseMessage, MessageType};
use crate::pool::{AddressPool, PoolEntry};
use crate::registry::SessionRegistry;
use crate::scheduler::{Alarm, LeaseScheduler};

/// Protocol state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing allocated; only DISCOVER is accepted.
    WaitDiscover,
    /// An address was offered and is held until the offer times out.
    WaitRequest,
    /// The lease is confirmed and runs until expiry or RELEASE.
    WaitRelease,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitDiscover => write!(f, "WAIT_DISCOVER"),
            Self::WaitRequest => write!(f, "WAIT_REQUEST"),
            Self::WaitRelease => write!(f, "WAIT_RELEASE"),
        }
    }
}

/// Lease parameters the server applies to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// TTL put in every OFFER, and the largest TTL a REQUEST may ask for.
    pub lease_ttl: u16,
    /// How long an offered address stays reserved without a REQUEST.
    pub offer_timeout: Duration,
}

impl From<&ServerConfig> for LeasePolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl,
            offer_timeout: config.offer_timeout(),
        }
    }
}

/// Everything a session may touch while handling one message.
///
/// `registry` holds the *other* sessions: the server takes the session being
/// handled out of the registry first, so it never sees itself there.
pub struct LeaseContext<'a, A> {
    pub pool: &'a mut AddressPool,
    pub scheduler: &'a mut LeaseScheduler<Ipv4Addr, A>,
    pub registry: &'a SessionRegistry,
    pub policy: &'a LeasePolicy,
    pub now: Instant,
}

/// Protocol state for one peer, identified by its source address.
#[derive(Debug, Clone)]
pub struct Session {
    peer: Ipv4Addr,
    state: SessionState,
    lease: Option<PoolEntry>,
    lease_start: Option<Instant>,
    lease_expiry: Option<Instant>,
}

impl Session {
    pub fn new(peer: Ipv4Addr) -> Self {
        Self {
            peer,
            state: SessionState::WaitDiscover,
            lease: None,
            lease_start: None,
            lease_expiry: None,
        }
    }

    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The entry taken from the pool for this peer, offered or confirmed.
    pub fn lease(&self) -> Option<PoolEntry> {
        self.lease
    }

    pub fn lease_start(&self) -> Option<Instant> {
        self.lease_start
    }

    pub fn lease_expiry(&self) -> Option<Instant> {
        self.lease_expiry
    }

    /// Feeds one message to the state machine and returns the reply, if any.
    pub fn handle<A: Alarm>(
        &mut self,
        message: &LeaseMessage,
        ctx: &mut LeaseContext<'_, A>,
    ) -> Option<LeaseMessage> {
        match (self.state, message.kind) {
            (SessionState::WaitDiscover, MessageType::Discover) => Some(self.offer(ctx)),
            (SessionState::WaitRequest, MessageType::Request) => {
                if message.code == Code::RequestAllocate {
                    self.confirm(message, ctx)
                } else {
                    warn!("{}: received invalid code {}. Ignore.", self.peer, message.code);
                    None
                }
            }
            (SessionState::WaitRelease, MessageType::Request) => {
                if message.code == Code::RequestExtend {
                    self.confirm(message, ctx)
                } else {
                    warn!("{}: received invalid code {}. Ignore.", self.peer, message.code);
                    None
                }
            }
            (state, kind) => {
                warn!("{}: unexpected {} in {}. Ignore.", self.peer, kind, state);
                None
            }
        }
    }

    fn offer<A: Alarm>(&mut self, ctx: &mut LeaseContext<'_, A>) -> LeaseMessage {
        let Some(entry) = ctx.pool.allocate() else {
            warn!("{}: no address resources left", self.peer);
            return LeaseMessage::offer_exhausted();
        };

        let hold_until = ctx.now + ctx.policy.offer_timeout;
        self.lease = Some(entry);
        self.lease_start = Some(ctx.now);
        self.lease_expiry = Some(hold_until);
        ctx.scheduler.schedule(self.peer, hold_until);

        self.transition(SessionState::WaitRequest);
        LeaseMessage::offer(entry, ctx.policy.lease_ttl)
    }

    /// Handles REQUEST_ALLOCATE in WAIT_REQUEST and REQUEST_EXTEND in
    /// WAIT_RELEASE; both validate the same way and lead to WAIT_RELEASE.
    fn confirm<A: Alarm>(
        &mut self,
        message: &LeaseMessage,
        ctx: &mut LeaseContext<'_, A>,
    ) -> Option<LeaseMessage> {
        let requested = message.entry();
        debug!(
            "{}: holds {:?}, requests {} for {}s",
            self.peer, self.lease, requested, message.ttl
        );

        if !ctx.pool.validate(requested) {
            warn!("{}: requested invalid resource {}. Ignore.", self.peer, requested);
            return None;
        }

        if message.ttl > ctx.policy.lease_ttl {
            warn!(
                "{}: requested ttl {} exceeds {}. Ignore.",
                self.peer, message.ttl, ctx.policy.lease_ttl
            );
            return None;
        }

        if let Some(holder) = ctx.registry.holder_of(requested.address) {
            warn!(
                "{}: {} is already allocated to {}",
                self.peer, requested.address, holder
            );
            self.demote(ctx);
            return Some(LeaseMessage::ack_conflict());
        }

        let Some(entry) = self.lease else {
            warn!("{}: no allocated address to confirm. Ignore.", self.peer);
            return None;
        };

        let expiry = ctx.now + Duration::from_secs(u64::from(message.ttl));
        self.lease_start = Some(ctx.now);
        self.lease_expiry = Some(expiry);
        ctx.scheduler.schedule(self.peer, expiry);

        self.transition(SessionState::WaitRelease);
        Some(LeaseMessage::ack(entry, message.ttl))
    }

    /// Falls back to WAIT_DISCOVER, returning the held entry to the pool.
    fn demote<A: Alarm>(&mut self, ctx: &mut LeaseContext<'_, A>) {
        if let Some(entry) = self.lease.take() {
            ctx.pool.release(entry);
        }
        ctx.scheduler.cancel(&self.peer);
        self.lease_start = None;
        self.lease_expiry = None;
        self.transition(SessionState::WaitDiscover);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("{}: from {} to {}", self.peer, self.state, next);
            self.state = next;
        }
    }

    /// Destroys the session, returning its entry to the pool and dropping
    /// any scheduled expiry.
    pub fn terminate<A: Alarm>(
        mut self,
        pool: &mut AddressPool,
        scheduler: &mut LeaseScheduler<Ipv4Addr, A>,
    ) {
        scheduler.cancel(&self.peer);
        if let Some(entry) = self.lease.take() {
            info!("{}: free {}", self.peer, entry);
            pool.release(entry);
        }
        info!("{}: release client", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::RecordingAlarm;

    const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);
    const OTHER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 21);

    fn entry(last: u8) -> PoolEntry {
        PoolEntry::new(Ipv4Addr::new(10, 0, 0, last), 24)
    }

    struct Harness {
        pool: AddressPool,
        scheduler: LeaseScheduler<Ipv4Addr, RecordingAlarm>,
        registry: SessionRegistry,
        policy: LeasePolicy,
        now: Instant,
    }

    impl Harness {
        fn new(resources: u8) -> Self {
            Self {
                pool: AddressPool::from_entries((1..=resources).map(entry)),
                scheduler: LeaseScheduler::new(RecordingAlarm::default()),
                registry: SessionRegistry::new(),
                policy: LeasePolicy {
                    lease_ttl: 40,
                    offer_timeout: Duration::from_secs(10),
                },
                now: Instant::now(),
            }
        }

        fn ctx(&mut self) -> LeaseContext<'_, RecordingAlarm> {
            LeaseContext {
                pool: &mut self.pool,
                scheduler: &mut self.scheduler,
                registry: &self.registry,
                policy: &self.policy,
                now: self.now,
            }
        }

        fn send(&mut self, session: &mut Session, message: LeaseMessage) -> Option<LeaseMessage> {
            session.handle(&message, &mut self.ctx())
        }

        /// Runs DISCOVER and REQUEST_ALLOCATE for `peer`.
        fn lease(&mut self, peer: Ipv4Addr, ttl: u16) -> Session {
            let mut session = Session::new(peer);
            let offer = self.send(&mut session, LeaseMessage::discover()).unwrap();
            let ack = self
                .send(&mut session, LeaseMessage::request_allocate(offer.entry(), ttl))
                .unwrap();
            assert_eq!(ack.code, Code::Ok);
            session
        }
    }

    #[test]
    fn test_discover_offers_first_entry() {
        let mut harness = Harness::new(2);
        let mut session = Session::new(PEER);

        let reply = harness.send(&mut session, LeaseMessage::discover()).unwrap();

        assert_eq!(reply, LeaseMessage::offer(entry(1), 40));
        assert_eq!(session.state(), SessionState::WaitRequest);
        assert_eq!(session.lease(), Some(entry(1)));
        assert_eq!(
            harness.scheduler.expiry_of(&PEER),
            Some(harness.now + Duration::from_secs(10))
        );
        assert_eq!(harness.pool.len(), 1);
    }

    #[test]
    fn test_discover_with_empty_pool() {
        let mut harness = Harness::new(0);
        let mut session = Session::new(PEER);

        let reply = harness.send(&mut session, LeaseMessage::discover()).unwrap();

        assert_eq!(reply, LeaseMessage::offer_exhausted());
        assert_eq!(session.state(), SessionState::WaitDiscover);
        assert!(session.lease().is_none());
        assert!(harness.scheduler.is_empty());
    }

    #[test]
    fn test_request_confirms_lease() {
        let mut harness = Harness::new(2);
        let session = harness.lease(PEER, 30);

        assert_eq!(session.state(), SessionState::WaitRelease);
        assert_eq!(session.lease(), Some(entry(1)));
        assert_eq!(session.lease_start(), Some(harness.now));
        assert_eq!(
            harness.scheduler.expiry_of(&PEER),
            Some(harness.now + Duration::from_secs(30))
        );
    }

    #[test]
    fn test_ack_carries_requested_ttl() {
        let mut harness = Harness::new(1);
        let mut session = Session::new(PEER);
        harness.send(&mut session, LeaseMessage::discover());

        let ack = harness
            .send(&mut session, LeaseMessage::request_allocate(entry(1), 12))
            .unwrap();
        assert_eq!(ack, LeaseMessage::ack(entry(1), 12));
    }

    #[test]
    fn test_invalid_request_is_dropped() {
        let mut harness = Harness::new(2);
        let mut session = Session::new(PEER);
        harness.send(&mut session, LeaseMessage::discover());

        let unknown = PoolEntry::new(Ipv4Addr::new(172, 16, 0, 1), 24);
        assert!(harness
            .send(&mut session, LeaseMessage::request_allocate(unknown, 10))
            .is_none());

        let wrong_mask = PoolEntry::new(entry(1).address, 16);
        assert!(harness
            .send(&mut session, LeaseMessage::request_allocate(wrong_mask, 10))
            .is_none());

        assert!(harness
            .send(&mut session, LeaseMessage::request_allocate(entry(1), 41))
            .is_none());

        assert_eq!(session.state(), SessionState::WaitRequest);
        assert_eq!(session.lease(), Some(entry(1)));
    }

    #[test]
    fn test_wrong_code_or_type_is_ignored() {
        let mut harness = Harness::new(2);
        let mut session = Session::new(PEER);

        assert!(harness
            .send(&mut session, LeaseMessage::request_allocate(entry(1), 10))
            .is_none());
        assert_eq!(session.state(), SessionState::WaitDiscover);

        harness.send(&mut session, LeaseMessage::discover());
        assert!(harness
            .send(&mut session, LeaseMessage::request_extend(entry(1), 10))
            .is_none());
        assert!(harness.send(&mut session, LeaseMessage::discover()).is_none());
        assert_eq!(session.state(), SessionState::WaitRequest);
        assert_eq!(harness.pool.len(), 1);
    }

    #[test]
    fn test_extend_reschedules() {
        let mut harness = Harness::new(2);
        let mut session = harness.lease(PEER, 20);

        harness.now += Duration::from_secs(10);
        let ack = harness
            .send(&mut session, LeaseMessage::request_extend(entry(1), 40))
            .unwrap();

        assert_eq!(ack, LeaseMessage::ack(entry(1), 40));
        assert_eq!(session.state(), SessionState::WaitRelease);
        assert_eq!(
            harness.scheduler.expiry_of(&PEER),
            Some(harness.now + Duration::from_secs(40))
        );
        assert_eq!(harness.scheduler.len(), 1);
    }

    #[test]
    fn test_allocate_code_ignored_while_leased() {
        let mut harness = Harness::new(2);
        let mut session = harness.lease(PEER, 20);
        let expiry = harness.scheduler.expiry_of(&PEER);

        assert!(harness
            .send(&mut session, LeaseMessage::request_allocate(entry(1), 20))
            .is_none());
        assert_eq!(harness.scheduler.expiry_of(&PEER), expiry);
    }

    #[test]
    fn test_conflict_demotes_and_returns_entry() {
        let mut harness = Harness::new(2);
        let holder = harness.lease(OTHER, 40);
        harness.registry.insert(holder);

        let mut session = Session::new(PEER);
        let offer = harness.send(&mut session, LeaseMessage::discover()).unwrap();
        assert_eq!(offer.entry(), entry(2));

        let reply = harness
            .send(&mut session, LeaseMessage::request_allocate(entry(1), 40))
            .unwrap();

        assert_eq!(reply, LeaseMessage::ack_conflict());
        assert_eq!(session.state(), SessionState::WaitDiscover);
        assert!(session.lease().is_none());
        assert!(!harness.scheduler.contains(&PEER));
        assert!(harness.scheduler.contains(&OTHER));
        assert_eq!(harness.pool.iter().copied().collect::<Vec<_>>(), vec![entry(2)]);
    }

    #[test]
    fn test_conflict_during_extend() {
        let mut harness = Harness::new(2);
        let holder = harness.lease(OTHER, 40);
        harness.registry.insert(holder);
        let mut session = harness.lease(PEER, 40);

        let reply = harness
            .send(&mut session, LeaseMessage::request_extend(entry(1), 40))
            .unwrap();

        assert_eq!(reply.code, Code::ErrAlreadyAllocated);
        assert_eq!(session.state(), SessionState::WaitDiscover);
        assert_eq!(harness.pool.len(), 1);
    }

    #[test]
    fn test_renewing_own_address_is_not_a_conflict() {
        let mut harness = Harness::new(1);
        let mut session = harness.lease(PEER, 40);

        for _ in 0..3 {
            let reply = harness
                .send(&mut session, LeaseMessage::request_extend(entry(1), 40))
                .unwrap();
            assert_eq!(reply.code, Code::Ok);
        }
        assert_eq!(session.state(), SessionState::WaitRelease);
    }

    #[test]
    fn test_terminate_returns_entry() {
        let mut harness = Harness::new(1);
        let session = harness.lease(PEER, 40);
        assert!(harness.pool.is_empty());

        session.terminate(&mut harness.pool, &mut harness.scheduler);

        assert_eq!(harness.pool.allocate(), Some(entry(1)));
        assert!(harness.scheduler.is_empty());
        assert_eq!(harness.scheduler.armed(), None);
    }

    #[test]
    fn test_terminate_without_lease() {
        let mut harness = Harness::new(1);
        Session::new(PEER).terminate(&mut harness.pool, &mut harness.scheduler);
        assert_eq!(harness.pool.len(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::WaitDiscover.to_string(), "WAIT_DISCOVER");
        assert_eq!(SessionState::WaitRequest.to_string(), "WAIT_REQUEST");
        assert_eq!(SessionState::WaitRelease.to_string(), "WAIT_RELEASE");
    }
}
