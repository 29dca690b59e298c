//! Host TCP port reservations.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use vmshim_shared::errors::{VmshimError, VmshimResult};

const MAX_ATTEMPTS: usize = 32;

/// Hands out free loopback TCP ports, never the same one twice while a
/// reservation is alive.
///
/// Ports are discovered by binding port 0 and reading back what the kernel
/// picked; the listener is closed right away, so the reservation only
/// guarantees uniqueness among holders of this allocator.
#[derive(Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self) -> VmshimResult<PortReservation> {
        for _ in 0..MAX_ATTEMPTS {
            let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?
                .local_addr()?
                .port();
            if self.reserved.lock().insert(port) {
                tracing::trace!(port, "Reserved host port");
                return Ok(PortReservation {
                    port,
                    allocator: self.clone(),
                });
            }
        }
        Err(VmshimError::Network(format!(
            "no free host port after {} attempts",
            MAX_ATTEMPTS
        )))
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("reserved", &self.reserved.lock().len())
            .finish()
    }
}

/// A reserved port, released on drop.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    allocator: PortAllocator,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
