//! vmshim: run OCI containers inside ephemeral virtual machines.
//!
//! The host side of a VM-per-container runtime. A container runtime hands
//! over an OCI spec plus rootfs mounts; vmshim turns them into a device
//! list and guest mount table ([`provision`]), creates and boots the VM
//! through a pluggable [`vmm::Hypervisor`], dials the guest service over
//! vsock ([`portal`]), and supervises the VM until it exits ([`vm`]).

pub mod constants;
pub mod net;
pub mod options;
pub mod portal;
pub mod provision;
pub mod util;
pub mod vm;
pub mod vmm;
pub mod vsock;

pub use options::VmshimOptions;
pub use vm::{OciVmConfig, RunningVm, VmContext, VmExit};
pub use vmm::{Hypervisor, VirtualMachine};
pub use vmshim_shared::errors::{VmshimError, VmshimResult};
