//! Hypervisor and virtual machine abstractions.
//!
//! A [`Hypervisor`] creates [`VirtualMachine`]s from a validated
//! [`NewVmOptions`] and a [`Bootloader`]. Everything above this layer
//! (provisioning, orchestration, vsock plumbing) works against these traits,
//! so backends can be swapped and faked in tests.

use super::state::{VirtualMachineStateChange, VirtualMachineStateType};
use super::{Bootloader, Device, Platform};
use crate::vsock::{VsockListener, VsockStream};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Everything a hypervisor needs to create a VM.
#[derive(Debug, Clone)]
pub struct NewVmOptions {
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub devices: Vec<Device>,
    pub platform: Platform,
}

impl NewVmOptions {
    pub fn new(vcpus: u32, memory_bytes: u64, platform: Platform) -> Self {
        Self {
            vcpus,
            memory_bytes,
            devices: Vec::new(),
            platform,
        }
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    /// Reject resource settings no hypervisor can honor.
    pub fn validate(&self) -> VmshimResult<()> {
        validate_resources(self.vcpus, self.memory_bytes)
    }
}

pub(crate) fn validate_resources(vcpus: u32, memory_bytes: u64) -> VmshimResult<()> {
    if vcpus == 0 {
        return Err(VmshimError::Config("vcpus must be at least 1".into()));
    }
    if memory_bytes == 0 {
        return Err(VmshimError::Config("memory must be greater than zero".into()));
    }
    Ok(())
}

/// A created virtual machine.
///
/// Lifecycle operations only request transitions; completion is observed
/// through [`state_changes`](Self::state_changes) (see
/// [`wait_for_vm_state`](super::wait_for_vm_state)).
#[async_trait]
pub trait VirtualMachine: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn current_state(&self) -> VirtualMachineStateType;

    /// Subscribe to future transitions.
    fn state_changes(&self) -> broadcast::Receiver<VirtualMachineStateChange>;

    /// Devices the VM was created with.
    fn devices(&self) -> &[Device];

    async fn start(&self) -> VmshimResult<()>;

    async fn stop(&self) -> VmshimResult<()>;

    async fn pause(&self) -> VmshimResult<()>;

    async fn resume(&self) -> VmshimResult<()>;

    fn can_start(&self) -> bool {
        self.current_state().can_start()
    }

    fn can_stop(&self) -> bool {
        self.current_state().can_stop()
    }

    fn can_pause(&self) -> bool {
        self.current_state().can_pause()
    }

    fn can_resume(&self) -> bool {
        self.current_state().can_resume()
    }

    /// Open a stream to a port the guest listens on.
    async fn vsock_connect(&self, port: u32) -> io::Result<VsockStream>;

    /// Listen on a port the guest connects to.
    async fn vsock_listen(&self, port: u32) -> io::Result<Box<dyn VsockListener>>;

    /// Drive backend housekeeping until `cancel` fires.
    async fn run_background_tasks(&self, cancel: CancellationToken) -> VmshimResult<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn save_snapshot(&self, _path: &Path) -> VmshimResult<()> {
        Err(VmshimError::Unsupported("snapshots are not supported".into()))
    }

    async fn restore_snapshot(&self, _path: &Path) -> VmshimResult<()> {
        Err(VmshimError::Unsupported("snapshots are not supported".into()))
    }

    /// Current memory balloon target in bytes.
    async fn balloon_target(&self) -> VmshimResult<u64> {
        Err(VmshimError::Unsupported("memory balloon is not supported".into()))
    }

    async fn set_balloon_target(&self, _bytes: u64) -> VmshimResult<()> {
        Err(VmshimError::Unsupported("memory balloon is not supported".into()))
    }
}

/// A backend able to create VMs.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    type Vm: VirtualMachine;

    /// Create (but do not start) a VM.
    async fn create(
        &self,
        id: &str,
        options: NewVmOptions,
        bootloader: Bootloader,
    ) -> VmshimResult<Arc<Self::Vm>>;

    /// Every VM this hypervisor creates, as it is created.
    fn on_create(&self) -> broadcast::Receiver<Arc<Self::Vm>>;
}

/// Validate `options` and create a VM through `hv`.
pub async fn create_vm<H>(
    hv: &H,
    id: &str,
    options: NewVmOptions,
    bootloader: Bootloader,
) -> VmshimResult<Arc<H::Vm>>
where
    H: Hypervisor + ?Sized,
{
    options.validate()?;
    tracing::debug!(
        vm_id = %id,
        vcpus = options.vcpus,
        memory_bytes = options.memory_bytes,
        devices = options.devices.len(),
        platform = %options.platform,
        "Creating VM"
    );
    hv.create(id, options, bootloader).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resources() {
        let ok = NewVmOptions::new(1, 1 << 20, Platform::linux_arm64());
        assert!(ok.validate().is_ok());

        let no_cpu = NewVmOptions::new(0, 1 << 20, Platform::linux_arm64());
        assert!(matches!(no_cpu.validate(), Err(VmshimError::Config(_))));

        let no_mem = NewVmOptions::new(2, 0, Platform::linux_arm64());
        assert!(matches!(no_mem.validate(), Err(VmshimError::Config(_))));
    }
}
