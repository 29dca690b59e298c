//! Network attachment double.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmshim::constants::network::GUEST_MAC;
use vmshim::net::{ConnectionType, NetworkAttachment, NetworkEndpoint};
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Becomes ready after `delay`, or fails with `failure`.
#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    pub delay: Duration,
    pub failure: Option<String>,
}

impl FakeNetwork {
    pub fn ready() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            delay: Duration::from_millis(5),
            failure: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl NetworkAttachment for FakeNetwork {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn endpoint(&self) -> VmshimResult<NetworkEndpoint> {
        Ok(NetworkEndpoint::UnixSocket {
            path: "/tmp/vmshim-fake-net.sock".into(),
            connection_type: ConnectionType::UnixStream,
            mac_address: GUEST_MAC,
        })
    }

    async fn wait(&self, cancel: &CancellationToken) -> VmshimResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VmshimError::Cancelled("fake network".into())),
            _ = tokio::time::sleep(self.delay) => {}
        }
        match &self.failure {
            Some(reason) => Err(VmshimError::Network(reason.clone())),
            None => Ok(()),
        }
    }
}
