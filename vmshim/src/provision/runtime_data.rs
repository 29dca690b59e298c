//! Runtime-data share contents and the timesync writer.

use super::GuestMount;
use chrono::{Local, Utc};
use oci_spec::runtime::Spec;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};
use vmshim_shared::layout::{RuntimeDataLayout, TIMESYNC_DONE, TimeSample};

/// Sample the host clock.
pub fn now_sample() -> VmshimResult<TimeSample> {
    let now = Utc::now();
    let unix_nanos = now
        .timestamp_nanos_opt()
        .ok_or_else(|| VmshimError::Internal("system time out of range".into()))?;
    let utc_offset_secs = Local::now().offset().local_minus_utc();
    Ok(TimeSample {
        unix_nanos,
        utc_offset_secs,
    })
}

/// Write the container spec, guest mount table, and first clock sample.
pub fn write_runtime_data(
    layout: &RuntimeDataLayout,
    spec: &Spec,
    mounts: &[GuestMount],
) -> VmshimResult<()> {
    std::fs::create_dir_all(layout.base())?;
    write_json(&layout.spec_path(), spec)?;
    write_json(&layout.mounts_path(), mounts)?;
    write_atomic(&layout.timesync_path(), format!("{}\n", now_sample()?.to_line()))?;
    tracing::debug!(dir = %layout.base().display(), mounts = mounts.len(), "Wrote runtime data");
    Ok(())
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> VmshimResult<()> {
    write_atomic(path, serde_json::to_vec_pretty(value)?)
}

/// Replace `path` in one step so the guest never reads a partial file.
fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> VmshimResult<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Keeps the timesync file fresh while the guest boots.
///
/// Rewrites the file every `interval` for `duration`, then appends the
/// completion marker.
#[derive(Debug, Clone)]
pub struct TimeSyncWriter {
    path: PathBuf,
    interval: Duration,
    duration: Duration,
}

impl TimeSyncWriter {
    pub fn new(layout: &RuntimeDataLayout, interval: Duration, duration: Duration) -> Self {
        Self {
            path: layout.timesync_path(),
            interval,
            duration,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(self, cancel: CancellationToken) -> VmshimResult<()> {
        let deadline = tokio::time::Instant::now() + self.duration;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(VmshimError::Cancelled("timesync writer".into()));
                }
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    write_atomic(&self.path, format!("{}\n", now_sample()?.to_line()))?;
                }
            }
        }

        write_atomic(
            &self.path,
            format!("{}\n{}\n", now_sample()?.to_line(), TIMESYNC_DONE),
        )?;
        tracing::trace!(path = %self.path.display(), "Timesync writer done");
        Ok(())
    }
}
