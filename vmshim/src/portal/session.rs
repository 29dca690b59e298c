//! High-level guest session.
//!
//! Thin facade over [`GuestService`] with the calls the orchestrator makes.

use super::interfaces::{CommandOutput, CommandRequest, GuestService};
use crate::provision::now_sample;
use std::sync::Arc;
use vmshim_shared::errors::{VmshimError, VmshimResult};

/// High-level guest session.
#[derive(Clone)]
pub struct GuestSession {
    service: Arc<dyn GuestService>,
}

impl GuestSession {
    pub fn new(service: Arc<dyn GuestService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<dyn GuestService> {
        &self.service
    }

    /// Push the current host clock into the guest.
    pub async fn sync_clock(&self) -> VmshimResult<()> {
        let sample = now_sample()?;
        self.service.time_sync(sample.unix_nanos).await
    }

    pub async fn run_command(&self, request: CommandRequest) -> VmshimResult<CommandOutput> {
        self.service.run_command(request).await
    }

    /// Run a space-separated command line (no quoting) with empty stdin.
    pub async fn run_command_simple(&self, command: &str) -> VmshimResult<CommandOutput> {
        let argv = split_command(command)?;
        self.service.run_command(CommandRequest::new(argv)).await
    }
}

/// Split on single spaces; empty tokens from repeated spaces are dropped.
pub fn split_command(command: &str) -> VmshimResult<Vec<String>> {
    let argv: Vec<String> = command
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if argv.is_empty() {
        return Err(VmshimError::InvalidArgument("empty command".into()));
    }
    Ok(argv)
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<GuestSession>;
};
