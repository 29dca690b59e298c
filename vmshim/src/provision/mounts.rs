//! Container mount classification.
//!
//! Each OCI mount ends up as one of:
//! - a virtiofs share plus a guest mount of that share (directory binds)
//! - a guest mount passed through as-is (tmpfs, proc, sysfs, ...)
//! - nothing (allow-listed per-container files the guest provides itself)

use crate::constants::{PASSTHROUGH_FILES, mount_tags};
use crate::vmm::FsShare;
use oci_spec::runtime::Mount;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Guest filesystem type for virtiofs shares.
pub const VIRTIOFS: &str = "virtiofs";

/// Options that only describe how the host bind was made.
const HOST_ONLY_OPTIONS: &[&str] = &[
    "bind", "rbind", "private", "rprivate", "shared", "rshared", "slave", "rslave",
];

/// A mount the guest init performs, serialized into `container-mounts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestMount {
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A container rootfs mount as handed over by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsMount {
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
}

impl RootfsMount {
    pub fn bind(source: impl Into<PathBuf>) -> Self {
        Self {
            mount_type: "bind".to_string(),
            source: source.into(),
            options: vec!["rbind".to_string()],
        }
    }
}

/// What to do with one OCI mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountPlan {
    /// Share a host directory and mount it in the guest.
    Share { share: FsShare, guest: GuestMount },
    /// Let the guest perform the mount itself.
    Guest(GuestMount),
    /// Skip; the guest provides its own copy.
    Skip,
}

/// Deterministic virtiofs tag for a bind source.
///
/// `bind-` followed by the first 16 hex digits of SHA-256 over the raw path
/// bytes.
pub fn bind_tag(source: &Path) -> String {
    let digest = Sha256::digest(source.as_os_str().as_bytes());
    let hex = hex::encode(digest);
    format!(
        "{}{}",
        mount_tags::BIND_PREFIX,
        &hex[..mount_tags::BIND_DIGEST_LEN]
    )
}

fn is_bind(mount: &Mount) -> bool {
    let typ_bind = matches!(mount.typ().as_deref(), Some("bind") | Some("rbind"));
    let opt_bind = mount
        .options()
        .as_ref()
        .is_some_and(|opts| opts.iter().any(|o| o == "bind" || o == "rbind"));
    typ_bind || opt_bind
}

fn guest_options(mount: &Mount) -> Vec<String> {
    mount
        .options()
        .as_ref()
        .map(|opts| {
            opts.iter()
                .filter(|o| !HOST_ONLY_OPTIONS.contains(&o.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn is_read_only(options: &[String]) -> bool {
    options.iter().any(|o| o == "ro")
}

/// Classify one OCI mount of container `container_id`.
pub fn plan_mount(mount: &Mount, container_id: &str) -> VmshimResult<MountPlan> {
    let destination = mount.destination().clone();

    if is_bind(mount) {
        let source = mount.source().as_ref().ok_or_else(|| {
            VmshimError::Provision(format!(
                "bind mount at {} has no source",
                destination.display()
            ))
        })?;
        let meta = std::fs::metadata(source).map_err(|e| {
            VmshimError::Provision(format!(
                "bind mount source {} for {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;

        if meta.is_dir() {
            let options = guest_options(mount);
            let tag = bind_tag(source);
            return Ok(MountPlan::Share {
                share: FsShare {
                    tag: tag.clone(),
                    host_path: source.clone(),
                    read_only: is_read_only(&options),
                },
                guest: GuestMount {
                    destination,
                    mount_type: VIRTIOFS.to_string(),
                    source: tag,
                    options,
                },
            });
        }

        if meta.is_file() && is_passthrough_file(source, container_id) {
            tracing::debug!(
                source = %source.display(),
                destination = %destination.display(),
                "Skipping per-container file mount"
            );
            return Ok(MountPlan::Skip);
        }

        return Err(VmshimError::Provision(format!(
            "unsupported bind mount {} -> {}: only directories can be shared",
            source.display(),
            destination.display()
        )));
    }

    let mount_type = mount.typ().clone().unwrap_or_default();
    if mount_type.is_empty() {
        return Err(VmshimError::Provision(format!(
            "mount at {} has no type",
            destination.display()
        )));
    }

    // The guest kernel populates /dev itself.
    if mount_type == "tmpfs" && destination == Path::new("/dev") {
        return Ok(MountPlan::Guest(GuestMount {
            destination,
            mount_type: "devtmpfs".to_string(),
            source: "devtmpfs".to_string(),
            options: guest_options(mount),
        }));
    }

    let source = mount
        .source()
        .as_ref()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| mount_type.clone());
    Ok(MountPlan::Guest(GuestMount {
        destination,
        mount_type,
        source,
        options: guest_options(mount),
    }))
}

/// Allow-listed file that lives under a directory named after the container.
fn is_passthrough_file(source: &Path, container_id: &str) -> bool {
    let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    PASSTHROUGH_FILES.contains(&name)
        && !container_id.is_empty()
        && source
            .ancestors()
            .skip(1)
            .any(|dir| dir.file_name().is_some_and(|n| n == container_id))
}

/// Turn the container rootfs mounts into the rootfs share.
///
/// Exactly one mount is required and its source must be a directory.
pub fn plan_rootfs(rootfs: &[RootfsMount]) -> VmshimResult<FsShare> {
    let [mount] = rootfs else {
        return Err(VmshimError::Provision(format!(
            "expected exactly one rootfs mount, got {}",
            rootfs.len()
        )));
    };
    if !mount.source.is_dir() {
        return Err(VmshimError::Provision(format!(
            "rootfs source {} ({}) is not a directory",
            mount.source.display(),
            mount.mount_type
        )));
    }
    Ok(FsShare {
        tag: mount_tags::ROOTFS.to_string(),
        host_path: mount.source.clone(),
        read_only: is_read_only(&mount.options),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::MountBuilder;

    fn mount(dest: &str, typ: &str, source: Option<&Path>, options: &[&str]) -> Mount {
        let mut b = MountBuilder::default()
            .destination(dest)
            .typ(typ)
            .options(options.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        if let Some(source) = source {
            b = b.source(source);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_bind_tag_shape() {
        let tag = bind_tag(Path::new("/data"));
        assert!(tag.starts_with("bind-"));
        assert_eq!(tag.len(), 5 + 16);
        assert!(tag.len() <= mount_tags::MAX_TAG_LEN);
        assert_eq!(tag, bind_tag(Path::new("/data")));
        assert_ne!(tag, bind_tag(Path::new("/data2")));
    }

    #[test]
    fn test_directory_bind_becomes_share() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mount("/data", "bind", Some(dir.path()), &["rbind", "ro"]);
        match plan_mount(&m, "c1").unwrap() {
            MountPlan::Share { share, guest } => {
                assert_eq!(share.tag, bind_tag(dir.path()));
                assert_eq!(share.host_path, dir.path());
                assert!(share.read_only);
                assert_eq!(guest.destination, PathBuf::from("/data"));
                assert_eq!(guest.mount_type, "virtiofs");
                assert_eq!(guest.source, share.tag);
                assert_eq!(guest.options, vec!["ro".to_string()]);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_bind_by_option_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut m = mount("/data", "none", Some(dir.path()), &["bind"]);
        m.set_typ(None);
        assert!(matches!(plan_mount(&m, "c1").unwrap(), MountPlan::Share { .. }));
    }

    #[test]
    fn test_dev_tmpfs_rewritten() {
        let m = mount("/dev", "tmpfs", Some(Path::new("tmpfs")), &["nosuid"]);
        let MountPlan::Guest(g) = plan_mount(&m, "c1").unwrap() else {
            panic!("expected guest mount");
        };
        assert_eq!(g.mount_type, "devtmpfs");
        assert_eq!(g.source, "devtmpfs");
        assert_eq!(g.options, vec!["nosuid".to_string()]);

        let m = mount("/tmp", "tmpfs", Some(Path::new("tmpfs")), &[]);
        let MountPlan::Guest(g) = plan_mount(&m, "c1").unwrap() else {
            panic!("expected guest mount");
        };
        assert_eq!(g.mount_type, "tmpfs");
    }

    #[test]
    fn test_passthrough_file_skipped_only_under_container_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let cdir = root.path().join("abc123");
        std::fs::create_dir_all(&cdir).unwrap();
        let resolv = cdir.join("resolv.conf");
        std::fs::write(&resolv, "nameserver 1.1.1.1\n").unwrap();

        let m = mount("/etc/resolv.conf", "bind", Some(&resolv), &["rbind", "ro"]);
        assert_eq!(plan_mount(&m, "abc123").unwrap(), MountPlan::Skip);

        // Same file, different container: rejected.
        let err = plan_mount(&m, "other").unwrap_err();
        assert!(matches!(err, VmshimError::Provision(_)));
    }

    #[test]
    fn test_other_file_bind_rejected() {
        let root = tempfile::TempDir::new().unwrap();
        let cdir = root.path().join("abc123");
        std::fs::create_dir_all(&cdir).unwrap();
        let secret = cdir.join("secret.txt");
        std::fs::write(&secret, "x").unwrap();

        let m = mount("/secret", "bind", Some(&secret), &["rbind"]);
        assert!(matches!(
            plan_mount(&m, "abc123"),
            Err(VmshimError::Provision(_))
        ));
    }

    #[test]
    fn test_missing_bind_source_rejected() {
        let m = mount("/data", "bind", Some(Path::new("/nonexistent/vmshim/src")), &[]);
        assert!(matches!(plan_mount(&m, "c"), Err(VmshimError::Provision(_))));
    }

    #[test]
    fn test_rootfs_count() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(plan_rootfs(&[]), Err(VmshimError::Provision(_))));
        let two = vec![RootfsMount::bind(dir.path()), RootfsMount::bind(dir.path())];
        assert!(matches!(plan_rootfs(&two), Err(VmshimError::Provision(_))));

        let share = plan_rootfs(&[RootfsMount::bind(dir.path())]).unwrap();
        assert_eq!(share.tag, mount_tags::ROOTFS);
        assert!(!share.read_only);
    }
}
