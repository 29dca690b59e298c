//! Guest platform and boot artifact selection.

use crate::constants::boot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Target guest platform, written `os/arch` (e.g. `linux/arm64`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn linux_arm64() -> Self {
        Self::new("linux", "arm64")
    }

    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = VmshimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() && !arch.contains('/') => {
                Ok(Self::new(os, arch))
            }
            _ => Err(VmshimError::InvalidArgument(format!(
                "invalid platform '{}': expected os/arch",
                s
            ))),
        }
    }
}

/// Linux direct-kernel boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootloader {
    pub kernel_path: PathBuf,
    pub initrd_path: Option<PathBuf>,
    pub cmdline: String,
}

impl Bootloader {
    /// Pick the kernel and initrd for `platform` from `build_dir`.
    ///
    /// Fails with `Unsupported` for platforms other than linux/arm64 and
    /// linux/amd64, and with `Config` when the build directory or one of
    /// its artifacts is missing.
    pub fn for_platform(platform: &Platform, build_dir: Option<&Path>) -> VmshimResult<Self> {
        let (arch_dir, kernel) = match (platform.os.as_str(), platform.arch.as_str()) {
            ("linux", "arm64") => (boot::ARM64_DIR, boot::ARM64_KERNEL),
            ("linux", "amd64") => (boot::AMD64_DIR, boot::AMD64_KERNEL),
            _ => {
                return Err(VmshimError::Unsupported(format!(
                    "platform {} is not supported (supported: linux/arm64, linux/amd64)",
                    platform
                )));
            }
        };

        let build_dir = build_dir.ok_or_else(|| {
            VmshimError::Config(format!(
                "no build directory configured for {} guests (set {})",
                platform,
                crate::constants::envs::VMSHIM_BUILD_DIR
            ))
        })?;

        let base = build_dir.join(arch_dir);
        let kernel_path = base.join(kernel);
        let initrd_path = base.join(boot::INITRD);
        for path in [&kernel_path, &initrd_path] {
            if !path.is_file() {
                return Err(VmshimError::Config(format!(
                    "missing boot artifact {}",
                    path.display()
                )));
            }
        }

        Ok(Self {
            kernel_path,
            initrd_path: Some(initrd_path),
            cmdline: boot::CMDLINE.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_dir_with(arch_dir: &str, kernel: &str) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join(arch_dir);
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join(kernel), b"kernel").unwrap();
        std::fs::write(base.join(boot::INITRD), b"initrd").unwrap();
        dir
    }

    #[test]
    fn test_platform_parse() {
        let p: Platform = "linux/arm64".parse().unwrap();
        assert_eq!(p, Platform::linux_arm64());
        assert_eq!(p.to_string(), "linux/arm64");
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
        assert!("a/b/c".parse::<Platform>().is_err());
    }

    #[test]
    fn test_arm64_artifacts() {
        let dir = build_dir_with("arm64", "Image");
        let bl = Bootloader::for_platform(&Platform::linux_arm64(), Some(dir.path())).unwrap();
        assert_eq!(bl.kernel_path, dir.path().join("arm64/Image"));
        assert_eq!(
            bl.initrd_path.as_deref(),
            Some(dir.path().join("arm64/initramfs.cpio.gz").as_path())
        );
        assert_eq!(bl.cmdline, boot::CMDLINE);
    }

    #[test]
    fn test_amd64_artifacts() {
        let dir = build_dir_with("amd64", "vmlinux");
        let bl = Bootloader::for_platform(&Platform::linux_amd64(), Some(dir.path())).unwrap();
        assert!(bl.kernel_path.ends_with("amd64/vmlinux"));
    }

    #[test]
    fn test_unsupported_platform() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Bootloader::for_platform(&Platform::new("windows", "amd64"), Some(dir.path()))
            .unwrap_err();
        assert!(matches!(err, VmshimError::Unsupported(_)));
        let err = Bootloader::for_platform(&Platform::new("linux", "riscv64"), Some(dir.path()))
            .unwrap_err();
        assert!(matches!(err, VmshimError::Unsupported(_)));
    }

    #[test]
    fn test_missing_build_dir_or_artifacts() {
        let err = Bootloader::for_platform(&Platform::linux_arm64(), None).unwrap_err();
        assert!(matches!(err, VmshimError::Config(_)));

        let dir = tempfile::TempDir::new().unwrap();
        let err = Bootloader::for_platform(&Platform::linux_arm64(), Some(dir.path())).unwrap_err();
        assert!(matches!(err, VmshimError::Config(_)));
    }
}
