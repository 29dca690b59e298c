//! VM-socket plumbing: stream types, managed links, and host-side proxies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

mod manager;
mod proxy;

pub use manager::{ManagedConnection, RetryPolicy, VsockManager, VsockState};
pub use proxy::{ProxyHandle, connect_guest_port, expose_guest_port, listen_guest_port};

/// Byte stream over a VM socket.
pub trait VsockIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> VsockIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased VM-socket stream.
pub type VsockStream = Box<dyn VsockIo>;

/// Host-side listener for connections the guest initiates.
#[async_trait]
pub trait VsockListener: Send {
    fn port(&self) -> u32;

    async fn accept(&mut self) -> io::Result<VsockStream>;
}

/// How the host side of a proxied VM socket is exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientConnectionType {
    /// A listening Unix socket file callers connect to.
    UnixSocketFile { path: PathBuf },
    /// An in-process socket pair; the caller holds one end.
    UnixSocketPair,
    /// A loopback TCP listener.
    Tcp { port: u16 },
    /// A UDP socket.
    Udp { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Stream,
    Datagram,
}

/// Bookkeeping for a proxy where the guest listens and the host connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockClientConnection {
    pub guest_port: u32,
    pub connection_type: ClientConnectionType,
    pub transfer_type: TransferType,
    pub created_at: DateTime<Utc>,
}

/// Bookkeeping for a proxy where the host listens and the guest connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockServerListener {
    pub guest_port: u32,
    pub connection_type: ClientConnectionType,
    pub transfer_type: TransferType,
    pub created_at: DateTime<Utc>,
}

/// Which side of a proxy dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum ProxyInfo {
    HostConnects(VsockClientConnection),
    GuestConnects(VsockServerListener),
}

impl ProxyInfo {
    pub fn guest_port(&self) -> u32 {
        match self {
            ProxyInfo::HostConnects(c) => c.guest_port,
            ProxyInfo::GuestConnects(l) => l.guest_port,
        }
    }

    pub fn connection_type(&self) -> &ClientConnectionType {
        match self {
            ProxyInfo::HostConnects(c) => &c.connection_type,
            ProxyInfo::GuestConnects(l) => &l.connection_type,
        }
    }
}
