//! Ordered device list with virtiofs tag bookkeeping.

use crate::vmm::{Device, FsShare};
use std::collections::HashMap;
use std::path::PathBuf;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Collects the devices of one VM.
///
/// Virtiofs tags are unique: adding the same share twice (same tag, same
/// host path) is a no-op, while reusing a tag for another path is an error.
#[derive(Debug, Default)]
pub struct DeviceSet {
    devices: Vec<Device>,
    share_paths: HashMap<String, PathBuf>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a share; returns whether a new device was added.
    pub fn add_share(&mut self, share: FsShare) -> VmshimResult<bool> {
        if let Some(existing) = self.share_paths.get(&share.tag) {
            if *existing == share.host_path {
                return Ok(false);
            }
            return Err(VmshimError::Provision(format!(
                "virtiofs tag {} already shares {}, cannot also share {}",
                share.tag,
                existing.display(),
                share.host_path.display()
            )));
        }
        self.share_paths
            .insert(share.tag.clone(), share.host_path.clone());
        self.devices.push(Device::FsShare(share));
        Ok(true)
    }

    pub fn add(&mut self, device: Device) -> VmshimResult<()> {
        match device {
            Device::FsShare(share) => self.add_share(share).map(|_| ()),
            other => {
                self.devices.push(other);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }
}
