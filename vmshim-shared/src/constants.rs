//! Shared constants between host and guest
//!
//! These constants must be identical on both sides of the host-guest boundary.

/// Well-known vsock ports.
pub mod ports {
    /// Guest control-channel (gRPC) server port.
    pub const GUEST_SERVICE: u32 = 2695;

    /// Guest connects here to stream container stdin from the host.
    pub const STDIN: u32 = 2701;

    /// Guest connects here to stream container stdout to the host.
    pub const STDOUT: u32 = 2702;

    /// Guest connects here to stream container stderr to the host.
    pub const STDERR: u32 = 2703;
}

/// Virtiofs mount tags
///
/// These tags identify shared filesystems mounted via virtiofs.
/// They must match between host (when creating shares) and guest (when mounting).
pub mod mount_tags {
    /// Tag for the container rootfs share.
    pub const ROOTFS: &str = "vmshim-rootfs";

    /// Tag for the runtime-data share (spec, mounts, timesync).
    pub const RUNTIME_DATA: &str = "vmshim-runtime";

    /// Prefix of tags generated for directory bind mounts.
    pub const BIND_PREFIX: &str = "bind-";

    /// Number of hex characters of the source digest kept in a bind tag.
    pub const BIND_DIGEST_LEN: usize = 16;

    /// Maximum virtiofs tag length accepted by the Linux driver.
    pub const MAX_TAG_LEN: usize = 36;
}

/// Guest mount points (paths inside the guest).
pub mod guest_paths {
    /// Where the guest init mounts the runtime-data share.
    pub const RUNTIME_DATA: &str = "/run/vmshim";

    /// Where the guest init mounts the container rootfs share.
    pub const ROOTFS: &str = "/run/vmshim/rootfs";
}
