//! Configuration for vmshim.

use crate::constants::{dirs as const_dirs, envs as const_envs, timeouts};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Runtime-wide options.
///
/// Defaults come from the environment (`VMSHIM_HOME`, `VMSHIM_BUILD_DIR`)
/// and the constants in [`crate::constants::timeouts`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmshimOptions {
    /// Root for per-VM working directories and logs.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Directory with per-architecture kernels and initrds.
    #[serde(default = "default_build_dir")]
    pub build_dir: Option<PathBuf>,

    /// Upper bound for a VM to reach the running state.
    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    /// Dial cadence for the guest service.
    #[serde(default)]
    pub dial: DialPolicy,

    /// Deadline for each control-channel call, connection setup included.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Timesync rewrite cadence after boot.
    #[serde(default)]
    pub time_sync: TimeSyncPolicy,

    /// Leave the working directory behind on shutdown (debugging).
    #[serde(default)]
    pub keep_workdir: bool,
}

/// Retry cadence for reaching the guest service over vsock.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DialPolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

/// How the timesync file is refreshed after boot.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeSyncPolicy {
    pub interval_ms: u64,
    pub duration_ms: u64,
}

fn default_home_dir() -> PathBuf {
    std::env::var(const_envs::VMSHIM_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(const_dirs::VMSHIM_DIR);
            path
        })
}

fn default_build_dir() -> Option<PathBuf> {
    std::env::var_os(const_envs::VMSHIM_BUILD_DIR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_boot_timeout_ms() -> u64 {
    timeouts::BOOT.as_millis() as u64
}

fn default_rpc_timeout_ms() -> u64 {
    timeouts::RPC.as_millis() as u64
}

impl Default for VmshimOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            build_dir: default_build_dir(),
            boot_timeout_ms: default_boot_timeout_ms(),
            dial: DialPolicy::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            time_sync: TimeSyncPolicy::default(),
            keep_workdir: false,
        }
    }
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            interval_ms: timeouts::DIAL_INTERVAL.as_millis() as u64,
            timeout_ms: timeouts::DIAL.as_millis() as u64,
        }
    }
}

impl Default for TimeSyncPolicy {
    fn default() -> Self {
        Self {
            interval_ms: timeouts::TIMESYNC_INTERVAL.as_millis() as u64,
            duration_ms: timeouts::TIMESYNC_DURATION.as_millis() as u64,
        }
    }
}

impl DialPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TimeSyncPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl VmshimOptions {
    /// Options rooted at `home_dir`, everything else default.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Self::default()
        }
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Parent of the per-VM working directories.
    pub fn vms_dir(&self) -> PathBuf {
        self.home_dir.join(const_dirs::VMS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(const_dirs::LOGS_DIR)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> VmshimResult<()> {
        if self.boot_timeout_ms == 0 {
            return Err(VmshimError::Config(
                "boot timeout must be greater than zero".into(),
            ));
        }
        if self.dial.interval_ms == 0 || self.dial.timeout_ms == 0 {
            return Err(VmshimError::Config(
                "dial interval and timeout must be greater than zero".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(VmshimError::Config(
                "rpc timeout must be greater than zero".into(),
            ));
        }
        if self.time_sync.interval_ms == 0 {
            return Err(VmshimError::Config(
                "timesync interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = VmshimOptions::with_home("/tmp/vmshim-test");
        assert_eq!(opts.boot_timeout(), Duration::from_secs(30));
        assert_eq!(opts.dial.interval(), Duration::from_millis(100));
        assert_eq!(opts.dial.timeout(), Duration::from_secs(5));
        assert_eq!(opts.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(opts.time_sync.interval(), Duration::from_millis(10));
        assert_eq!(opts.time_sync.duration(), Duration::from_secs(1));
        assert_eq!(opts.vms_dir(), PathBuf::from("/tmp/vmshim-test/vms"));
        assert!(!opts.keep_workdir);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let opts: VmshimOptions =
            serde_json::from_str(r#"{"home_dir": "/srv/vmshim", "boot_timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(opts.home_dir, PathBuf::from("/srv/vmshim"));
        assert_eq!(opts.boot_timeout(), Duration::from_millis(500));
        assert_eq!(opts.dial.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_boot_timeout_rejected() {
        let mut opts = VmshimOptions::with_home("/tmp/x");
        opts.boot_timeout_ms = 0;
        assert!(matches!(opts.validate(), Err(VmshimError::Config(_))));
    }
}
