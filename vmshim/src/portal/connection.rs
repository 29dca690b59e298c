//! Connection management.
//!
//! Dials the guest service over a VM socket, retrying while the guest boots,
//! and caches the resulting client.

use super::interfaces::{GuestInterface, GuestService};
use crate::constants::timeouts;
use crate::options::DialPolicy;
use crate::vmm::VirtualMachine;
use crate::vsock::VsockStream;
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Wraps an established VM-socket stream in a guest service client.
#[async_trait]
pub trait GuestConnector: Send + Sync {
    async fn connect(&self, stream: VsockStream) -> VmshimResult<Arc<dyn GuestService>>;
}

/// gRPC over the given stream.
///
/// `timeout` bounds the HTTP/2 handshake and every call made on the
/// resulting channel.
#[derive(Debug, Clone, Copy)]
pub struct GrpcConnector {
    timeout: Duration,
}

impl GrpcConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(timeouts::RPC)
    }
}

#[async_trait]
impl GuestConnector for GrpcConnector {
    async fn connect(&self, stream: VsockStream) -> VmshimResult<Arc<dyn GuestService>> {
        // The channel's connector runs once; the stream is handed over on that call.
        let stream = Arc::new(Mutex::new(Some(stream)));

        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let stream = Arc::clone(&stream);
                async move {
                    let stream = stream.lock().take().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotConnected, "guest stream already used")
                    })?;
                    Ok::<_, io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        tracing::debug!("Connected to guest service over vsock");
        Ok(Arc::new(GuestInterface::new(channel)))
    }
}

/// Lazily-established guest service client.
///
/// The first [`session`](Self::session) call dials; later calls return the
/// cached client. A failed dial leaves nothing cached, so the next call
/// dials again.
pub struct GuestTransport<VM: ?Sized> {
    vm: Arc<VM>,
    port: u32,
    policy: DialPolicy,
    connector: Arc<dyn GuestConnector>,
    service: OnceCell<Arc<dyn GuestService>>,
}

impl<VM> GuestTransport<VM>
where
    VM: VirtualMachine + ?Sized,
{
    pub fn new(
        vm: Arc<VM>,
        port: u32,
        policy: DialPolicy,
        connector: Arc<dyn GuestConnector>,
    ) -> Self {
        Self {
            vm,
            port,
            policy,
            connector,
            service: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.service.initialized()
    }

    /// Get or establish the guest service client.
    pub async fn session(&self, cancel: &CancellationToken) -> VmshimResult<Arc<dyn GuestService>> {
        let service = self
            .service
            .get_or_try_init(|| async { self.dial(cancel).await })
            .await?;
        Ok(Arc::clone(service))
    }

    /// Poll the guest port until it accepts, the budget runs out, or `cancel` fires.
    async fn dial(&self, cancel: &CancellationToken) -> VmshimResult<Arc<dyn GuestService>> {
        let deadline = Instant::now() + self.policy.timeout();
        let mut attempts = 0u32;
        let mut last_error: Option<io::Error> = None;

        loop {
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                r = self.vm.vsock_connect(self.port) => r,
            };
            match attempt {
                Ok(stream) => {
                    tracing::debug!(
                        vm_id = %self.vm.id(),
                        port = self.port,
                        attempts,
                        "Guest service reachable"
                    );
                    // The handshake shares the dial budget, with at least one
                    // interval of slack for a guest found at the last attempt.
                    let budget = deadline.max(Instant::now() + self.policy.interval());
                    return tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(self.cancelled()),
                        r = tokio::time::timeout_at(budget, self.connector.connect(stream)) => {
                            r.unwrap_or_else(|_| {
                                Err(VmshimError::Timeout(format!(
                                    "guest service on vsock port {} accepted but never answered",
                                    self.port
                                )))
                            })
                        }
                    };
                }
                Err(e) => {
                    tracing::trace!(vm_id = %self.vm.id(), port = self.port, attempts, "Guest dial failed: {}", e);
                    last_error = Some(e);
                }
            }

            if Instant::now() + self.policy.interval() > deadline {
                return Err(VmshimError::Portal(format!(
                    "guest service on vsock port {} unreachable after {} attempts in {:?}: {}",
                    self.port,
                    attempts,
                    self.policy.timeout(),
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(self.policy.interval()) => {}
            }
        }
    }

    fn cancelled(&self) -> VmshimError {
        VmshimError::Cancelled(format!(
            "dialing guest service of vm {} on port {}",
            self.vm.id(),
            self.port
        ))
    }
}
