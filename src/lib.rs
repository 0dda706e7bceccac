//! # minidhcp
//!
//! A minimal DHCP-like address leasing protocol: a server hands out IPv4
//! addresses with a time-to-live from a configured pool, and a client
//! acquires, renews and releases one lease.
//!
//! ## Quick Start
//!
//! ```no_run
//! use minidhcp::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> minidhcp::Result<()> {
//!     let config = ServerConfig::load("pool.conf")?;
//!     let mut server = Server::bind(&config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`AddressPool`] - FIFO of free (address, netmask) resources
//! - [`LeaseScheduler`] - ordered expiries driving a single [`Alarm`]
//! - [`Session`] - per-peer server state machine
//! - [`SessionRegistry`] - sessions keyed by peer address
//! - [`LeaseServer`] / [`Server`] - protocol core and its UDP event loop
//! - [`ClientMachine`] / [`Client`] - requester state machine and its event loop
//! - [`LeaseMessage`] - the fixed 12-byte wire record

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;

pub use client::{Client, ClientLease, ClientMachine, ClientState, Reaction};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use message::{Code, LeaseMessage, MessageType};
pub use pool::{AddressPool, PoolEntry};
pub use registry::SessionRegistry;
pub use scheduler::{Alarm, LeaseScheduler, SleepAlarm};
pub use server::{LeaseServer, Server};
pub use session::{LeaseContext, LeasePolicy, Session, SessionState};
