//! Scripted guest service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use vmshim::portal::{CommandOutput, CommandRequest, GuestConnector, GuestService};
use vmshim::vsock::VsockStream;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// Records calls; commands echo their argv to stdout.
#[derive(Default)]
pub struct RecordingGuest {
    pub fail_time_sync: bool,
    time_syncs: Mutex<Vec<i64>>,
    commands: Mutex<Vec<CommandRequest>>,
}

impl RecordingGuest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_time_sync() -> Self {
        Self {
            fail_time_sync: true,
            ..Self::default()
        }
    }

    pub fn time_syncs(&self) -> Vec<i64> {
        self.time_syncs.lock().clone()
    }

    pub fn commands(&self) -> Vec<CommandRequest> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl GuestService for RecordingGuest {
    async fn time_sync(&self, unix_nanos: i64) -> VmshimResult<()> {
        if self.fail_time_sync {
            return Err(VmshimError::Rpc("Unavailable: clock busy".into()));
        }
        self.time_syncs.lock().push(unix_nanos);
        Ok(())
    }

    async fn run_command(&self, request: CommandRequest) -> VmshimResult<CommandOutput> {
        let stdout = format!("{}\n", request.argv.join(" ")).into_bytes();
        let exit_code = if request.argv.first().map(String::as_str) == Some("false") {
            1
        } else {
            0
        };
        self.commands.lock().push(request);
        Ok(CommandOutput {
            stdout,
            stderr: Vec::new(),
            exit_code,
        })
    }
}

/// Hands out the same [`RecordingGuest`] for every stream.
pub struct FakeConnector {
    guest: Arc<RecordingGuest>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(guest: Arc<RecordingGuest>) -> Self {
        Self {
            guest,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuestConnector for FakeConnector {
    async fn connect(&self, _stream: VsockStream) -> VmshimResult<Arc<dyn GuestService>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.guest.clone())
    }
}
