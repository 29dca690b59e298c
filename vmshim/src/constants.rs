//! Constants for the vmshim host runtime.
//!
//! Centralized location for hardcoded values, paths, and tuning knobs.

// Re-export the constants shared with the guest
pub use vmshim_shared::constants::{guest_paths, mount_tags, ports};

pub mod envs {
    /// Overrides the home directory (default: ~/.vmshim).
    pub const VMSHIM_HOME: &str = "VMSHIM_HOME";

    /// Directory holding guest kernels and initrds, laid out per architecture.
    pub const VMSHIM_BUILD_DIR: &str = "VMSHIM_BUILD_DIR";
}

pub mod dirs {
    /// Home directory name under the user's home.
    pub const VMSHIM_DIR: &str = ".vmshim";

    /// Per-VM working directories live here.
    pub const VMS_DIR: &str = "vms";

    /// Host log files.
    pub const LOGS_DIR: &str = "logs";
}

/// Virtual machine resource defaults
pub mod vm_defaults {
    pub const DEFAULT_CPUS: u32 = 1;

    pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;
}

/// Guest boot artifacts, relative to the build directory.
pub mod boot {
    /// Kernel command line handed to every guest.
    pub const CMDLINE: &str = "console=hvc0 quiet panic=-1 init=/init";

    pub const ARM64_DIR: &str = "arm64";
    pub const ARM64_KERNEL: &str = "Image";

    pub const AMD64_DIR: &str = "amd64";
    pub const AMD64_KERNEL: &str = "vmlinux";

    pub const INITRD: &str = "initramfs.cpio.gz";
}

pub mod timeouts {
    use std::time::Duration;

    /// Upper bound for the VM to reach the running state.
    pub const BOOT: Duration = Duration::from_secs(30);

    /// Pause between dials of the guest service port.
    pub const DIAL_INTERVAL: Duration = Duration::from_millis(100);

    /// Overall budget for the guest service to become reachable.
    pub const DIAL: Duration = Duration::from_secs(5);

    /// Deadline for a single control-channel RPC.
    pub const RPC: Duration = Duration::from_secs(10);

    /// Rewrite cadence of the timesync file after boot.
    pub const TIMESYNC_INTERVAL: Duration = Duration::from_millis(10);

    /// How long the timesync file keeps being rewritten.
    pub const TIMESYNC_DURATION: Duration = Duration::from_secs(1);

    /// Pause between reconnect attempts of a managed vsock link.
    pub const VSOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);

    /// Grace period for a VM to stop during shutdown.
    pub const VM_STOP: Duration = Duration::from_secs(10);

    /// How long a proxy close waits for its forwarding task.
    pub const PROXY_CLOSE: Duration = Duration::from_secs(2);

    /// Poll cadence when following the console log.
    pub const CONSOLE_POLL: Duration = Duration::from_millis(100);
}

/// Attempts for a managed vsock link before giving up.
pub const VSOCK_MAX_RETRIES: u32 = 10;

/// Regular files that may be bind-mounted into the guest.
///
/// Accepted only when the source sits under a directory named after the
/// container id (runtime-generated per-container state).
pub const PASSTHROUGH_FILES: &[&str] = &["resolv.conf", "hosts", "hostname"];

pub mod network {
    /// Guest MAC address (locally administered).
    pub const GUEST_MAC: [u8; 6] = [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee];
}

