use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::PoolEntry;

/// Well-known UDP port the server listens on.
pub const DEFAULT_PORT: u16 = 51230;

/// Lease duration offered by the server, and the longest one it grants.
pub const DEFAULT_LEASE_TTL: u16 = 40;

/// How long an OFFER reserves its address.
pub const DEFAULT_OFFER_TIMEOUT_SECONDS: u64 = 10;

/// Longest offer hold accepted, the same range as a lease ttl.
pub const MAX_OFFER_TIMEOUT_SECONDS: u64 = u16::MAX as u64;

/// How long the client waits for each OFFER or ACK.
pub const DEFAULT_REPLY_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: Ipv4Addr,
    pub port: u16,
    pub lease_ttl: u16,
    pub offer_timeout_seconds: u64,
    pub resources: Vec<PoolEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            lease_ttl: DEFAULT_LEASE_TTL,
            offer_timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECONDS,
            resources: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Reads the resource file at `path`; everything else keeps its default.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| {
            Error::InvalidConfig(format!("cannot open {}: {}", path.display(), error))
        })?;

        let config = Self {
            resources: Self::parse_resources(&content)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses resource lines of the form `<ipv4-address> <netmask-integer>`.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse_resources(content: &str) -> Result<Vec<PoolEntry>> {
        let mut resources = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let number = index + 1;
            let mut fields = line.split_whitespace();
            let (Some(address), Some(netmask), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::InvalidConfig(format!(
                    "line {}: expected `<address> <netmask>`, got {:?}",
                    number, line
                )));
            };

            let address: Ipv4Addr = address.parse().map_err(|_| {
                Error::InvalidConfig(format!("line {}: invalid address {:?}", number, address))
            })?;
            let netmask: u32 = netmask.parse().map_err(|_| {
                Error::InvalidConfig(format!("line {}: invalid netmask {:?}", number, netmask))
            })?;

            resources.push(PoolEntry::new(address, netmask));
        }

        Ok(resources)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl == 0 {
            return Err(Error::InvalidConfig(
                "lease_ttl must be greater than 0".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.offer_timeout_seconds > MAX_OFFER_TIMEOUT_SECONDS {
            return Err(Error::InvalidConfig(format!(
                "offer_timeout_seconds must be at most {}",
                MAX_OFFER_TIMEOUT_SECONDS
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.resources {
            if entry.address.is_unspecified() {
                return Err(Error::InvalidConfig(
                    "0.0.0.0 cannot be leased".to_string(),
                ));
            }
            if !seen.insert(entry.address) {
                return Err(Error::InvalidConfig(format!(
                    "address {} is listed more than once",
                    entry.address
                )));
            }
        }

        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_seconds)
    }

    pub fn listen_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: Ipv4Addr,
    pub port: u16,
    pub reply_timeout_millis: u64,
}

impl ClientConfig {
    pub fn new(server: Ipv4Addr) -> Self {
        Self {
            server,
            port: DEFAULT_PORT,
            reply_timeout_millis: DEFAULT_REPLY_TIMEOUT_SECONDS * 1000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.is_unspecified() || self.server.is_broadcast() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a usable server address",
                self.server
            )));
        }

        if self.reply_timeout_millis == 0 {
            return Err(Error::InvalidConfig(
                "reply timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.server, self.port)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_millis)
    }
}
