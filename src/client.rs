//! Requester side of the leasing protocol.
//!
//! [`ClientMachine`] holds the protocol state and decides what to send;
//! [`Client`] owns the socket and multiplexes replies, reply timeouts, the
//! renewal timer and the termination request.
//!
//! ```text
//! INITIAL --send DISCOVER--> WAIT_OFFER --OFFER/OK, send REQUEST--> WAIT_REPLY
//!    ^                          |                                    |     ^
//!    +-------- timeout ---------+---- timeout / ACK error -----------+     |
//!                                                                    |     |
//!                              WAIT_TIME <-------- ACK/OK -----------+     |
//!                                  +---- ttl/2 elapsed, send REQUEST ------+
//! ```

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{Code, LeaseMessage, MessageType};
use crate::pool::PoolEntry;

const RECV_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    WaitOffer,
    WaitReply,
    WaitTime,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "INITIAL"),
            Self::WaitOffer => write!(f, "WAIT_OFFER"),
            Self::WaitReply => write!(f, "WAIT_REPLY"),
            Self::WaitTime => write!(f, "WAIT_TIME"),
        }
    }
}

/// The address, netmask and ttl the client currently holds or was offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLease {
    pub entry: PoolEntry,
    pub ttl: u16,
    /// Wall-clock time of the last ACK/OK, `None` while only offered.
    pub granted_at: Option<DateTime<Utc>>,
}

impl ClientLease {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.granted_at
            .map(|granted| granted + TimeDelta::seconds(i64::from(self.ttl)))
    }

    /// Time after confirmation at which the lease is extended: half the ttl.
    pub fn renewal_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.ttl) * 500)
    }
}

/// What the caller should do after [`ClientMachine::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Send this message; the machine is now waiting for its reply.
    Send(LeaseMessage),
    /// The lease is confirmed; renew after the given delay.
    Confirmed(Duration),
    /// Start over with a new DISCOVER.
    Restart,
    /// Nothing to do; keep waiting.
    Ignore,
}

/// Client protocol state, with no I/O.
#[derive(Debug, Clone)]
pub struct ClientMachine {
    state: ClientState,
    lease: Option<ClientLease>,
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMachine {
    pub fn new() -> Self {
        Self {
            state: ClientState::Initial,
            lease: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn lease(&self) -> Option<&ClientLease> {
        self.lease.as_ref()
    }

    fn transition(&mut self, next: ClientState) {
        if self.state != next {
            info!("State changed from {} to {}", self.state, next);
            self.state = next;
        }
    }

    /// Starts a discovery round: returns the DISCOVER to send.
    pub fn discover(&mut self) -> LeaseMessage {
        self.lease = None;
        self.transition(ClientState::WaitOffer);
        LeaseMessage::discover()
    }

    /// No reply arrived within the wait interval.
    pub fn on_timeout(&mut self) {
        if matches!(self.state, ClientState::WaitOffer | ClientState::WaitReply) {
            warn!("Timeout in {}", self.state);
            self.lease = None;
            self.transition(ClientState::Initial);
        }
    }

    /// Handles a reply from the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoResource`] when the server answers DISCOVER with
    /// ERR_NO_RESOURCE; there is no point in retrying.
    pub fn on_message(&mut self, message: &LeaseMessage) -> Result<Reaction> {
        match (self.state, message.kind, message.code) {
            (ClientState::WaitOffer, MessageType::Offer, Code::Ok) => {
                self.lease = Some(ClientLease {
                    entry: message.entry(),
                    ttl: message.ttl,
                    granted_at: None,
                });
                self.transition(ClientState::WaitReply);
                Ok(Reaction::Send(LeaseMessage::request_allocate(
                    message.entry(),
                    message.ttl,
                )))
            }
            (ClientState::WaitOffer, MessageType::Offer, Code::ErrNoResource) => {
                Err(Error::NoResource)
            }
            (ClientState::WaitReply, MessageType::Ack, Code::Ok) => {
                let lease = ClientLease {
                    entry: message.entry(),
                    ttl: message.ttl,
                    granted_at: Some(Utc::now()),
                };
                self.lease = Some(lease);
                self.transition(ClientState::WaitTime);
                Ok(Reaction::Confirmed(lease.renewal_delay()))
            }
            (ClientState::WaitReply, MessageType::Ack, Code::ErrAlreadyAllocated) => {
                warn!("Address already allocated to another client");
                self.lease = None;
                self.transition(ClientState::Initial);
                Ok(Reaction::Restart)
            }
            (state, kind, code) => {
                warn!("Unexpected {}/{} in {}. Ignore.", kind, code, state);
                Ok(Reaction::Ignore)
            }
        }
    }

    /// The renewal timer fired: returns the REQUEST_EXTEND to send.
    pub fn renew(&mut self) -> Option<LeaseMessage> {
        if self.state != ClientState::WaitTime {
            return None;
        }
        let lease = self.lease?;
        self.transition(ClientState::WaitReply);
        Some(LeaseMessage::request_extend(lease.entry, lease.ttl))
    }

    /// Gives up the lease: returns the RELEASE to send.
    pub fn release(&mut self) -> LeaseMessage {
        self.lease = None;
        self.transition(ClientState::Initial);
        LeaseMessage::release()
    }
}

/// The lease client bound to an ephemeral UDP port.
pub struct Client {
    config: ClientConfig,
    socket: UdpSocket,
    machine: ClientMachine,
}

impl Client {
    pub async fn bind(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|error| Error::Socket(format!("Failed to bind client socket: {}", error)))?;

        info!(
            "Lease client on {} using server {}",
            socket.local_addr()?,
            config.server_address()
        );

        Ok(Self {
            config,
            socket,
            machine: ClientMachine::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn machine(&self) -> &ClientMachine {
        &self.machine
    }

    /// Runs the protocol until `shutdown` completes, then sends RELEASE.
    ///
    /// Returns early with an error on transport failure or when the server
    /// has no address to offer.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let mut renew_at = Instant::now();

        info!("State {}", self.machine.state());

        loop {
            match self.machine.state() {
                ClientState::Initial => {
                    let discover = self.machine.discover();
                    self.send(&discover).await?;
                }
                ClientState::WaitOffer | ClientState::WaitReply => {
                    let wait = self.config.reply_timeout();
                    tokio::select! {
                        () = &mut shutdown => break,
                        received = tokio::time::timeout(wait, self.socket.recv_from(&mut buffer)) => {
                            match received {
                                Err(_) => self.machine.on_timeout(),
                                Ok(result) => {
                                    let (size, source) = result?;
                                    if let Some(delay) = self.process(&buffer[..size], source).await? {
                                        renew_at = Instant::now() + delay;
                                    }
                                }
                            }
                        }
                    }
                }
                ClientState::WaitTime => {
                    tokio::select! {
                        () = &mut shutdown => break,
                        () = tokio::time::sleep_until(renew_at) => {
                            if let Some(request) = self.machine.renew() {
                                self.send(&request).await?;
                            }
                        }
                    }
                }
            }
        }

        info!("Termination requested");
        let release = self.machine.release();
        self.send(&release).await
    }

    /// Handles one received datagram. Returns the renewal delay when a
    /// lease was just confirmed.
    async fn process(&mut self, data: &[u8], source: SocketAddr) -> Result<Option<Duration>> {
        if source != SocketAddr::V4(self.config.server_address()) {
            warn!("Ignoring datagram from {}", source);
            return Ok(None);
        }

        let message = match LeaseMessage::parse(data) {
            Ok(message) => message,
            Err(error) => {
                warn!("Received invalid data: {}. Ignore.", error);
                return Ok(None);
            }
        };
        info!("Receive {}", message);

        match self.machine.on_message(&message)? {
            Reaction::Send(reply) => {
                self.send(&reply).await?;
                Ok(None)
            }
            Reaction::Confirmed(delay) => {
                if let Some(lease) = self.machine.lease() {
                    print_allocated(lease);
                }
                Ok(Some(delay))
            }
            Reaction::Restart | Reaction::Ignore => Ok(None),
        }
    }

    async fn send(&self, message: &LeaseMessage) -> Result<()> {
        self.socket
            .send_to(&message.encode(), self.config.server_address())
            .await?;
        info!("Send {}", message);
        Ok(())
    }
}

fn print_allocated(lease: &ClientLease) {
    info!("---  Allocated IP Address  ---");
    info!("IP: {}", lease.entry.address);
    info!("Netmask: {}", lease.entry.netmask);
    info!("Time to Live: {}", lease.ttl);
    if let Some(expires_at) = lease.expires_at() {
        info!("Valid until: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    info!("---           end          ---");
}
