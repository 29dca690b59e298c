//! Network attachment for VMs.
//!
//! A [`NetworkAttachment`] hands the hypervisor an endpoint to plug the
//! guest NIC into and reports when the backend behind it is ready. Backends
//! run outside this crate (gvproxy, passt, socket_vmnet); the attachment only
//! knows how to reach them.

use crate::constants::network::GUEST_MAC;
use crate::vmm::{Device, NetworkDevice};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

mod ports;

pub use ports::{PortAllocator, PortReservation};

/// How the VM connects to the network backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NetworkEndpoint {
    /// Path to a Unix socket to connect to.
    UnixSocket {
        path: PathBuf,
        connection_type: ConnectionType,
        /// Must match the static DHCP lease configured in the backend
        mac_address: [u8; 6],
    },
}

/// The protocol type for network connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionType {
    /// Unix stream socket (SOCK_STREAM) - passt, socket_vmnet, gvproxy (Linux)
    UnixStream,

    /// Unix datagram socket (SOCK_DGRAM) - gvproxy (macOS)
    UnixDgram,
}

/// Network attachment a VM is created with.
#[async_trait]
pub trait NetworkAttachment: Send + Sync + std::fmt::Debug {
    /// Human-readable backend name, for logs.
    fn name(&self) -> &'static str;

    fn endpoint(&self) -> VmshimResult<NetworkEndpoint>;

    /// Network device to attach to the VM.
    fn device(&self) -> VmshimResult<Device> {
        Ok(Device::Network(NetworkDevice {
            endpoint: self.endpoint()?,
        }))
    }

    /// Resolve once the backend is ready to carry guest traffic.
    async fn wait(&self, cancel: &CancellationToken) -> VmshimResult<()>;
}

/// A backend reachable through a Unix socket on the host.
///
/// Readiness means the socket file exists (and, for stream sockets, accepts
/// a connection).
#[derive(Debug, Clone)]
pub struct UnixSocketNetwork {
    path: PathBuf,
    connection_type: ConnectionType,
    mac_address: [u8; 6],
    poll_interval: Duration,
    timeout: Duration,
}

impl UnixSocketNetwork {
    pub fn new(path: impl Into<PathBuf>, connection_type: ConnectionType) -> Self {
        Self {
            path: path.into(),
            connection_type,
            mac_address: GUEST_MAC,
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_mac_address(mut self, mac: [u8; 6]) -> Self {
        self.mac_address = mac;
        self
    }

    async fn is_ready(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        match self.connection_type {
            ConnectionType::UnixStream => tokio::net::UnixStream::connect(&self.path).await.is_ok(),
            ConnectionType::UnixDgram => true,
        }
    }
}

#[async_trait]
impl NetworkAttachment for UnixSocketNetwork {
    fn name(&self) -> &'static str {
        "unix-socket"
    }

    fn endpoint(&self) -> VmshimResult<NetworkEndpoint> {
        Ok(NetworkEndpoint::UnixSocket {
            path: self.path.clone(),
            connection_type: self.connection_type,
            mac_address: self.mac_address,
        })
    }

    async fn wait(&self, cancel: &CancellationToken) -> VmshimResult<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if self.is_ready().await {
                tracing::debug!(socket = %self.path.display(), "Network backend ready");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmshimError::Network(format!(
                    "network backend socket {} not ready after {:?}",
                    self.path.display(),
                    self.timeout
                )));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(VmshimError::Cancelled("waiting for network backend".into()));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_socket_becomes_ready() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("net.sock");
        let net = UnixSocketNetwork::new(&path, ConnectionType::UnixStream)
            .with_poll_interval(Duration::from_millis(5));

        let bind_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let listener = tokio::net::UnixListener::bind(&bind_path).unwrap();
            loop {
                let _ = listener.accept().await;
            }
        });

        net.wait(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let net = UnixSocketNetwork::new(dir.path().join("none.sock"), ConnectionType::UnixDgram)
            .with_poll_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(30));

        let err = net.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VmshimError::Network(_)));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let net = UnixSocketNetwork::new(dir.path().join("none.sock"), ConnectionType::UnixStream);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = net.wait(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_device_carries_endpoint() {
        let net = UnixSocketNetwork::new("/tmp/n.sock", ConnectionType::UnixDgram);
        match net.device().unwrap() {
            Device::Network(dev) => match dev.endpoint {
                NetworkEndpoint::UnixSocket {
                    path, mac_address, ..
                } => {
                    assert_eq!(path, PathBuf::from("/tmp/n.sock"));
                    assert_eq!(mac_address, GUEST_MAC);
                }
            },
            other => panic!("unexpected device {other:?}"),
        }
    }
}
