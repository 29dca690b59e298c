//! Hypervisor abstraction: VMs, devices, boot configuration, and lifecycle state.

mod bootloader;
mod device;
mod engine;
mod registry;
mod state;

pub use bootloader::{Bootloader, Platform};
pub use device::{
    BlockDevice, ConsoleLogDevice, Device, DiskFormat, FsShare, GpuDevice, InputKind,
    NetworkDevice,
};
pub use engine::{Hypervisor, NewVmOptions, VirtualMachine, create_vm};
pub(crate) use engine::validate_resources;
pub use registry::VmRegistry;
pub use state::{
    META_ERROR, StateNotifier, VirtualMachineStateChange, VirtualMachineStateType,
    wait_for_vm_state,
};
