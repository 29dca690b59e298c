//! Device and mount provisioning.
//!
//! Turns an OCI container description into everything a VM needs to boot
//! it: the ordered device list, the guest mount table, the bootloader, and
//! the runtime-data share the guest init reads on startup.
//!
//! Validation happens before anything touches the filesystem, so a rejected
//! request leaves no files behind and adds no devices.

mod devices;
mod mounts;
mod runtime_data;

pub use devices::DeviceSet;
pub use mounts::{GuestMount, MountPlan, RootfsMount, VIRTIOFS, bind_tag, plan_mount, plan_rootfs};
pub use runtime_data::{TimeSyncWriter, now_sample, write_runtime_data};

use crate::constants::mount_tags;
use crate::vmm::{Bootloader, Device, FsShare, Platform};
use oci_spec::runtime::Spec;
use std::path::Path;
use vmshim_shared::errors::{VmshimError, VmshimResult};
use vmshim_shared::layout::WorkdirLayout;

/// Inputs of one provisioning call.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub container_id: &'a str,
    pub spec: &'a Spec,
    pub rootfs: &'a [RootfsMount],
    pub platform: &'a Platform,
    pub workdir: &'a WorkdirLayout,
    pub build_dir: Option<&'a Path>,
    /// Network device from the attachment, if the VM gets one.
    pub network: Option<&'a Device>,
}

/// Result of provisioning.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub devices: Vec<Device>,
    pub guest_mounts: Vec<GuestMount>,
    pub bootloader: Bootloader,
}

/// Run the provisioning pipeline.
///
/// Device order: rootfs share, runtime-data share, bind shares, network,
/// vsock, entropy, memory balloon, console log.
pub fn provision(req: ProvisionRequest<'_>) -> VmshimResult<Provisioned> {
    let mut bind_shares = Vec::new();
    let mut guest_mounts = Vec::new();
    if let Some(mounts) = req.spec.mounts() {
        for mount in mounts {
            match plan_mount(mount, req.container_id)? {
                MountPlan::Share { share, guest } => {
                    bind_shares.push(share);
                    guest_mounts.push(guest);
                }
                MountPlan::Guest(guest) => guest_mounts.push(guest),
                MountPlan::Skip => {}
            }
        }
    }

    let rootfs = plan_rootfs(req.rootfs)?;
    let bootloader = Bootloader::for_platform(req.platform, req.build_dir)?;

    let wants_terminal = req
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.terminal())
        .unwrap_or(false);
    if wants_terminal {
        return Err(VmshimError::Unsupported(
            "terminal (tty) containers are not implemented".into(),
        ));
    }

    let mut devices = DeviceSet::new();
    devices.add_share(rootfs)?;

    req.workdir.prepare()?;
    let runtime = req.workdir.runtime_data();
    write_runtime_data(&runtime, req.spec, &guest_mounts)?;
    devices.add_share(FsShare {
        tag: mount_tags::RUNTIME_DATA.to_string(),
        host_path: runtime.base().to_path_buf(),
        read_only: false,
    })?;

    for share in bind_shares {
        devices.add_share(share)?;
    }

    if let Some(network) = req.network {
        devices.add(network.clone())?;
    }
    devices.add(Device::Vsock)?;
    devices.add(Device::Entropy)?;
    devices.add(Device::MemoryBalloon)?;
    devices.add(Device::console_log(req.workdir.console_log_path()))?;

    tracing::debug!(
        container_id = %req.container_id,
        devices = devices.len(),
        guest_mounts = guest_mounts.len(),
        "Provisioned VM devices"
    );

    Ok(Provisioned {
        devices: devices.into_devices(),
        guest_mounts,
        bootloader,
    })
}
