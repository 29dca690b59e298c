//! Virtual devices attached to a VM.

use crate::net::NetworkEndpoint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A filesystem share from host to guest.
///
/// Exposes a host directory to the guest as a virtiofs share. The guest
/// mounts it using the tag as identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsShare {
    /// Virtiofs tag (guest uses this to identify the share)
    pub tag: String,
    /// Host directory to share
    pub host_path: PathBuf,
    /// Whether the share is read-only
    pub read_only: bool,
}

/// Disk image format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

/// A disk image attached via virtio-blk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Block device ID (e.g., "vda").
    pub block_id: String,
    pub disk_path: PathBuf,
    pub read_only: bool,
    pub format: DiskFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub endpoint: NetworkEndpoint,
}

/// Serial console whose output is appended to a host file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLogDevice {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Keyboard,
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub width: u32,
    pub height: u32,
}

/// A device attached to a VM at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Device {
    Network(NetworkDevice),
    Block(BlockDevice),
    FsShare(FsShare),
    Vsock,
    Entropy,
    MemoryBalloon,
    ConsoleLog(ConsoleLogDevice),
    Input { input: InputKind },
    Gpu(GpuDevice),
}

impl Device {
    pub fn fs_share(tag: impl Into<String>, host_path: impl Into<PathBuf>, read_only: bool) -> Self {
        Device::FsShare(FsShare {
            tag: tag.into(),
            host_path: host_path.into(),
            read_only,
        })
    }

    pub fn console_log(path: impl Into<PathBuf>) -> Self {
        Device::ConsoleLog(ConsoleLogDevice { path: path.into() })
    }

    pub fn as_fs_share(&self) -> Option<&FsShare> {
        match self {
            Device::FsShare(share) => Some(share),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Device::Network(_) => "network",
            Device::Block(_) => "block",
            Device::FsShare(_) => "fs_share",
            Device::Vsock => "vsock",
            Device::Entropy => "entropy",
            Device::MemoryBalloon => "memory_balloon",
            Device::ConsoleLog(_) => "console_log",
            Device::Input { .. } => "input",
            Device::Gpu(_) => "gpu",
        }
    }
}
