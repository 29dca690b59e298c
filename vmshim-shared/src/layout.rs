//! Filesystem layout definitions shared between host and guest.
//!
//! - `WorkdirLayout`: per-VM working directory on the host
//! - `RuntimeDataLayout`: the runtime-data share, identical on host and guest
//!
//! Lives in vmshim-shared so the guest init can locate the files the host writes.

use std::path::{Path, PathBuf};

// ============================================================================
// CONSTANTS
// ============================================================================

/// File and directory names inside the working directory.
pub mod files {
    /// Runtime-data subdirectory (shared into the guest).
    pub const RUNTIME_DATA_DIR: &str = "runtime";

    /// Serialized OCI runtime spec of the container.
    pub const OCI_SPEC: &str = "container-oci-spec.json";

    /// Serialized guest mount table.
    pub const MOUNTS: &str = "container-mounts.json";

    /// Clock bootstrap file, rewritten shortly after boot.
    pub const TIMESYNC: &str = "timesync";

    /// Guest console output.
    pub const CONSOLE_LOG: &str = "console.log";
}

/// Marker line appended to the timesync file once the host stops rewriting it.
pub const TIMESYNC_DONE: &str = "done";

// ============================================================================
// WORKDIR LAYOUT (host only)
// ============================================================================

/// Per-VM working directory on the host.
///
/// ```text
/// {root}/
/// ├── console.log
/// └── runtime/                 # RuntimeDataLayout, shared into the guest
///     ├── container-oci-spec.json
///     ├── container-mounts.json
///     └── timesync
/// ```
#[derive(Clone, Debug)]
pub struct WorkdirLayout {
    root: PathBuf,
}

impl WorkdirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Console log: {root}/console.log
    pub fn console_log_path(&self) -> PathBuf {
        self.root.join(files::CONSOLE_LOG)
    }

    /// Runtime-data share: {root}/runtime
    pub fn runtime_data(&self) -> RuntimeDataLayout {
        RuntimeDataLayout::new(self.root.join(files::RUNTIME_DATA_DIR))
    }

    /// Create the working directory tree.
    pub fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.runtime_data().base())?;
        Ok(())
    }
}

// ============================================================================
// RUNTIME DATA LAYOUT (host and guest)
// ============================================================================

/// Runtime-data share layout - identical structure on host and guest.
///
/// - Host: `{workdir}/runtime/`
/// - Guest: `/run/vmshim/`
///
/// # Example
///
/// ```
/// use vmshim_shared::layout::RuntimeDataLayout;
///
/// let host = RuntimeDataLayout::new("/var/lib/vmshim/vms/abc/runtime");
/// let guest = RuntimeDataLayout::new("/run/vmshim");
/// assert!(host.spec_path().ends_with("container-oci-spec.json"));
/// assert!(guest.spec_path().ends_with("container-oci-spec.json"));
/// ```
#[derive(Clone, Debug)]
pub struct RuntimeDataLayout {
    base: PathBuf,
}

impl RuntimeDataLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn spec_path(&self) -> PathBuf {
        self.base.join(files::OCI_SPEC)
    }

    pub fn mounts_path(&self) -> PathBuf {
        self.base.join(files::MOUNTS)
    }

    pub fn timesync_path(&self) -> PathBuf {
        self.base.join(files::TIMESYNC)
    }
}

// ============================================================================
// TIMESYNC RECORD
// ============================================================================

/// One sample of the host clock, as written to the timesync file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSample {
    /// Wall-clock time in nanoseconds since the Unix epoch.
    pub unix_nanos: i64,
    /// Local UTC offset in seconds (east positive).
    pub utc_offset_secs: i32,
}

impl TimeSample {
    /// Render as the first line of the timesync file.
    pub fn to_line(&self) -> String {
        format!("{} {}", self.unix_nanos, self.utc_offset_secs)
    }

    /// Parse the first line of a timesync file.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let unix_nanos = parts.next()?.parse().ok()?;
        let utc_offset_secs = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            unix_nanos,
            utc_offset_secs,
        })
    }

    /// Whether a timesync file's contents carry the completion marker.
    pub fn is_done(contents: &str) -> bool {
        contents.lines().any(|l| l.trim() == TIMESYNC_DONE)
    }
}
