use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::message::{LeaseMessage, MessageType};
use crate::pool::AddressPool;
use crate::registry::SessionRegistry;
use crate::scheduler::{Alarm, LeaseScheduler, SleepAlarm};
use crate::session::{LeaseContext, LeasePolicy, SessionState};

const RECV_BUFFER_SIZE: usize = 512;

/// Protocol core of the server, free of any I/O.
///
/// Owns the pool, the sessions and the scheduler; every mutation goes
/// through `&mut self`, one datagram or wake-up at a time.
#[derive(Debug)]
pub struct LeaseServer<A> {
    pool: AddressPool,
    registry: SessionRegistry,
    scheduler: LeaseScheduler<Ipv4Addr, A>,
    policy: LeasePolicy,
}

impl<A: Alarm> LeaseServer<A> {
    pub fn new(config: &ServerConfig, alarm: A) -> Result<Self> {
        config.validate()?;
        let mut pool = AddressPool::new();
        pool.initialize();
        for entry in &config.resources {
            pool.add_resource(*entry)?;
        }
        pool.freeze();

        Ok(Self {
            pool,
            registry: SessionRegistry::new(),
            scheduler: LeaseScheduler::new(alarm),
            policy: LeasePolicy::from(config),
        })
    }

    /// Decodes and handles one datagram from `peer`.
    pub fn handle_datagram(
        &mut self,
        peer: Ipv4Addr,
        data: &[u8],
        now: Instant,
    ) -> Option<LeaseMessage> {
        match LeaseMessage::parse(data) {
            Ok(message) => {
                info!("Receive {} from {}", message, peer);
                self.handle_message(peer, &message, now)
            }
            Err(error) => {
                warn!("Dropping datagram from {}: {}", peer, error);
                None
            }
        }
    }

    /// Routes a message to the peer's session and returns the reply, if any.
    pub fn handle_message(
        &mut self,
        peer: Ipv4Addr,
        message: &LeaseMessage,
        now: Instant,
    ) -> Option<LeaseMessage> {
        let Some(mut session) = self.registry.resolve(peer, message.kind) else {
            warn!(
                "{}: first message must be DISCOVER, got {}. Ignore.",
                peer, message.kind
            );
            return None;
        };

        if message.kind == MessageType::Release {
            session.terminate(&mut self.pool, &mut self.scheduler);
            return None;
        }

        let mut ctx = LeaseContext {
            pool: &mut self.pool,
            scheduler: &mut self.scheduler,
            registry: &self.registry,
            policy: &self.policy,
            now,
        };
        let reply = session.handle(message, &mut ctx);

        if session.state() == SessionState::WaitDiscover && session.lease().is_none() {
            debug!("{}: dropping idle session", peer);
        } else {
            self.registry.insert(session);
        }

        reply
    }

    /// Expires every session whose deadline has passed. Returns how many.
    pub fn handle_wake(&mut self, now: Instant) -> usize {
        let expired = self.scheduler.on_wake(now);
        let count = expired.len();

        for peer in expired {
            let Some(session) = self.registry.remove(&peer) else {
                warn!("{}: expiry for unknown session", peer);
                continue;
            };
            match session.state() {
                SessionState::WaitRequest => {
                    info!("{}: timeout. No REQUEST for the offered address.", peer)
                }
                SessionState::WaitRelease => info!("{}: allocated address expired.", peer),
                SessionState::WaitDiscover => warn!("{}: unexpected expiry in WAIT_DISCOVER", peer),
            }
            session.terminate(&mut self.pool, &mut self.scheduler);
        }

        count
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &LeaseScheduler<Ipv4Addr, A> {
        &self.scheduler
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }
}

/// The lease server bound to its UDP socket.
pub struct Server {
    socket: UdpSocket,
    core: LeaseServer<SleepAlarm>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let core = LeaseServer::new(config, SleepAlarm::new())?;
        let socket = Self::create_socket(config)?;

        info!("Lease server starting on {}", config.listen_address());
        if config.resources.is_empty() {
            warn!("No address resources configured; every DISCOVER will be refused");
        }
        for entry in core.pool().iter() {
            info!("Resource {}", entry);
        }
        info!(
            "Lease ttl {}s, offer hold {}s",
            config.lease_ttl, config.offer_timeout_seconds
        );

        Ok(Self { socket, core })
    }

    fn create_socket(config: &ServerConfig) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = config.listen_address();
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn core(&self) -> &LeaseServer<SleepAlarm> {
        &self.core
    }

    /// Serves until a transport error occurs.
    pub async fn run(&mut self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("Lease server ready and listening");

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    let (size, source) = received.inspect_err(|error| {
                        error!("Error receiving datagram: {}", error);
                    })?;
                    self.dispatch(&buffer[..size], source).await?;
                }
                () = self.core.scheduler.alarm_mut().fired(), if self.core.scheduler.alarm().is_armed() => {
                    let expired = self.core.handle_wake(Instant::now());
                    debug!("Wake-up expired {} session(s)", expired);
                }
            }
        }
    }

    async fn dispatch(&mut self, data: &[u8], source: SocketAddr) -> Result<()> {
        let SocketAddr::V4(source_v4) = source else {
            warn!("Ignoring datagram from non-IPv4 peer {}", source);
            return Ok(());
        };

        let Some(reply) = self
            .core
            .handle_datagram(*source_v4.ip(), data, Instant::now())
        else {
            return Ok(());
        };

        self.socket
            .send_to(&reply.encode(), source)
            .await
            .inspect_err(|error| error!("Error sending to {}: {}", source, error))?;
        info!("Send {} to {}", reply, source);

        Ok(())
    }
}
