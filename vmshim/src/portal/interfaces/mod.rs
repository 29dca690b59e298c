//! Service interfaces.
//!
//! What the host can ask of the guest, independent of the wire protocol.

pub mod guest;

pub use guest::GuestInterface;

use async_trait::async_trait;
use std::collections::HashMap;
use vmshim_shared::errors::VmshimResult;

/// A command to run synchronously inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

impl CommandRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }
}

/// Collected result of a guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Guest control-channel operations.
#[async_trait]
pub trait GuestService: Send + Sync {
    /// Set the guest clock.
    async fn time_sync(&self, unix_nanos: i64) -> VmshimResult<()>;

    async fn run_command(&self, request: CommandRequest) -> VmshimResult<CommandOutput>;
}
