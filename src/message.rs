//! Lease message parsing and encoding.
//!
//! Every exchange between client and server is a single fixed-size record
//! carried as one UDP datagram payload. There are no options and no
//! variable-length fields, so fields that carry no meaning for a given
//! message type are always zero.
//!
//! # Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   type (1)    |   code (1)    |            ttl (2)            |
//! +---------------+---------------+-------------------------------+
//! |                          address (4)                          |
//! +---------------------------------------------------------------+
//! |                          netmask (4)                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! All multi-byte fields are in network byte order.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::pool::PoolEntry;

const TYPE_OFFSET: usize = 0;
const CODE_OFFSET: usize = 1;
const TTL_OFFSET: usize = 2;
const ADDRESS_OFFSET: usize = 4;
const NETMASK_OFFSET: usize = 8;

/// Size of an encoded [`LeaseMessage`] in bytes.
pub const MESSAGE_SIZE: usize = 12;

/// Message types, the first byte of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client looks for an address.
    Discover = 1,
    /// Server proposes an address, or reports that none is left.
    Offer = 2,
    /// Client claims an offered address or extends a held one.
    Request = 3,
    /// Server confirms or refuses a REQUEST.
    Ack = 4,
    /// Client gives its address back.
    Release = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Ack),
            5 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Ack => write!(f, "ACK"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// Message codes, the second byte of every message.
///
/// The code is a status on OFFER and ACK and an intent on REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    /// OFFER: the pool is exhausted.
    ErrNoResource = 1,
    /// REQUEST: claim the offered address.
    RequestAllocate = 2,
    /// REQUEST: extend the held lease.
    RequestExtend = 3,
    /// ACK: the requested address is held by another peer.
    ErrAlreadyAllocated = 4,
}

impl TryFrom<u8> for Code {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ErrNoResource),
            2 => Ok(Self::RequestAllocate),
            3 => Ok(Self::RequestExtend),
            4 => Ok(Self::ErrAlreadyAllocated),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::ErrNoResource => write!(f, "ERR_NO_RESOURCE"),
            Self::RequestAllocate => write!(f, "REQUEST_ALLOCATE"),
            Self::RequestExtend => write!(f, "REQUEST_EXTEND"),
            Self::ErrAlreadyAllocated => write!(f, "ERR_ALREADY_ALLOCATED"),
        }
    }
}

/// A decoded lease message.
///
/// Prefer the named constructors ([`discover`](Self::discover),
/// [`offer`](Self::offer), ...) over building the struct by hand; they
/// guarantee that fields without meaning for the message type are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseMessage {
    pub kind: MessageType,
    pub code: Code,
    pub address: Ipv4Addr,
    /// Netmask exactly as configured on the server (an integer, usually a
    /// prefix length).
    pub netmask: u32,
    /// Lease duration in seconds.
    pub ttl: u16,
}

impl LeaseMessage {
    fn bare(kind: MessageType, code: Code) -> Self {
        Self {
            kind,
            code,
            address: Ipv4Addr::UNSPECIFIED,
            netmask: 0,
            ttl: 0,
        }
    }

    fn with_entry(kind: MessageType, code: Code, entry: PoolEntry, ttl: u16) -> Self {
        Self {
            kind,
            code,
            address: entry.address,
            netmask: entry.netmask,
            ttl,
        }
    }

    pub fn discover() -> Self {
        Self::bare(MessageType::Discover, Code::Ok)
    }

    pub fn offer(entry: PoolEntry, ttl: u16) -> Self {
        Self::with_entry(MessageType::Offer, Code::Ok, entry, ttl)
    }

    pub fn offer_exhausted() -> Self {
        Self::bare(MessageType::Offer, Code::ErrNoResource)
    }

    pub fn request_allocate(entry: PoolEntry, ttl: u16) -> Self {
        Self::with_entry(MessageType::Request, Code::RequestAllocate, entry, ttl)
    }

    pub fn request_extend(entry: PoolEntry, ttl: u16) -> Self {
        Self::with_entry(MessageType::Request, Code::RequestExtend, entry, ttl)
    }

    pub fn ack(entry: PoolEntry, ttl: u16) -> Self {
        Self::with_entry(MessageType::Ack, Code::Ok, entry, ttl)
    }

    pub fn ack_conflict() -> Self {
        Self::bare(MessageType::Ack, Code::ErrAlreadyAllocated)
    }

    pub fn release() -> Self {
        Self::bare(MessageType::Release, Code::Ok)
    }

    /// The (address, netmask) pair carried by this message.
    pub fn entry(&self) -> PoolEntry {
        PoolEntry::new(self.address, self.netmask)
    }

    /// Parses a lease message from a received datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the datagram is not exactly
    /// [`MESSAGE_SIZE`] bytes long or carries an unknown type or code.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != MESSAGE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "Message is {} bytes (expected {})",
                data.len(),
                MESSAGE_SIZE
            )));
        }

        let kind = MessageType::try_from(data[TYPE_OFFSET])
            .map_err(|value| Error::InvalidMessage(format!("Unknown message type {}", value)))?;
        let code = Code::try_from(data[CODE_OFFSET])
            .map_err(|value| Error::InvalidMessage(format!("Unknown message code {}", value)))?;

        let ttl = u16::from_be_bytes([data[TTL_OFFSET], data[TTL_OFFSET + 1]]);
        let address = Ipv4Addr::new(
            data[ADDRESS_OFFSET],
            data[ADDRESS_OFFSET + 1],
            data[ADDRESS_OFFSET + 2],
            data[ADDRESS_OFFSET + 3],
        );
        let netmask = u32::from_be_bytes([
            data[NETMASK_OFFSET],
            data[NETMASK_OFFSET + 1],
            data[NETMASK_OFFSET + 2],
            data[NETMASK_OFFSET + 3],
        ]);

        Ok(Self {
            kind,
            code,
            address,
            netmask,
            ttl,
        })
    }

    /// Encodes the message into its 12-byte wire form.
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buffer = [0u8; MESSAGE_SIZE];
        buffer[TYPE_OFFSET] = self.kind as u8;
        buffer[CODE_OFFSET] = self.code as u8;
        buffer[TTL_OFFSET..ADDRESS_OFFSET].copy_from_slice(&self.ttl.to_be_bytes());
        buffer[ADDRESS_OFFSET..NETMASK_OFFSET].copy_from_slice(&self.address.octets());
        buffer[NETMASK_OFFSET..].copy_from_slice(&self.netmask.to_be_bytes());
        buffer
    }
}

impl std::fmt::Display for LeaseMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} address={} netmask={} ttl={}",
            self.kind, self.code, self.address, self.netmask, self.ttl
        )
    }
}
