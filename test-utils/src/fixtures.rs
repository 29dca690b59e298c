//! Filesystem fixtures: build dir with boot artifacts, rootfs, OCI specs.

use oci_spec::runtime::{Mount, MountBuilder, Process, Spec};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vmshim::VmshimOptions;
use vmshim::options::{DialPolicy, TimeSyncPolicy};
use vmshim::provision::RootfsMount;

/// Scratch tree for one test. Removed on drop.
pub struct Fixture {
    _dir: TempDir,
    pub home: PathBuf,
    pub build_dir: PathBuf,
    pub rootfs: PathBuf,
    pub data: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create fixture dir");
        let root = dir.path().to_path_buf();
        let build_dir = root.join("build");
        for (arch, kernel) in [("arm64", "Image"), ("amd64", "vmlinux")] {
            let base = build_dir.join(arch);
            std::fs::create_dir_all(&base).expect("create build dir");
            std::fs::write(base.join(kernel), b"kernel").expect("write kernel");
            std::fs::write(base.join("initramfs.cpio.gz"), b"initrd").expect("write initrd");
        }
        let rootfs = root.join("rootfs");
        let data = root.join("data");
        std::fs::create_dir_all(&rootfs).expect("create rootfs");
        std::fs::create_dir_all(&data).expect("create data");

        Self {
            home: root.join("home"),
            _dir: dir,
            build_dir,
            rootfs,
            data,
        }
    }

    /// Options with short timeouts suitable for tests.
    pub fn options(&self) -> VmshimOptions {
        VmshimOptions {
            home_dir: self.home.clone(),
            build_dir: Some(self.build_dir.clone()),
            boot_timeout_ms: 2_000,
            dial: DialPolicy {
                interval_ms: 5,
                timeout_ms: 1_000,
            },
            rpc_timeout_ms: 1_000,
            time_sync: TimeSyncPolicy {
                interval_ms: 2,
                duration_ms: 20,
            },
            keep_workdir: false,
        }
    }

    pub fn rootfs_mounts(&self) -> Vec<RootfsMount> {
        vec![RootfsMount::bind(&self.rootfs)]
    }

    /// Spec with proc, a tmpfs /dev, and the data dir bound at `dest`.
    pub fn spec_with_bind(&self, dest: &str) -> Spec {
        spec_with_mounts(vec![
            mount("/proc", "proc", Some(Path::new("proc")), &[]),
            mount("/dev", "tmpfs", Some(Path::new("tmpfs")), &["nosuid", "mode=755"]),
            mount(dest, "bind", Some(&self.data), &["rbind", "rw"]),
        ])
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn mount(dest: &str, typ: &str, source: Option<&Path>, options: &[&str]) -> Mount {
    let mut builder = MountBuilder::default()
        .destination(dest)
        .typ(typ)
        .options(options.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    if let Some(source) = source {
        builder = builder.source(source);
    }
    builder.build().expect("build mount")
}

pub fn spec_with_mounts(mounts: Vec<Mount>) -> Spec {
    let mut spec = Spec::default();
    spec.set_mounts(Some(mounts));
    let mut process = spec.process().clone().unwrap_or_default();
    process.set_terminal(Some(false));
    spec.set_process(Some(process));
    spec
}

/// Same as [`spec_with_mounts`] but asking for a terminal.
pub fn terminal_spec() -> Spec {
    let mut spec = spec_with_mounts(Vec::new());
    let mut process = spec.process().clone().unwrap_or_else(Process::default);
    process.set_terminal(Some(true));
    spec.set_process(Some(process));
    spec
}
