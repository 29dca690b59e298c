//! Guest service interface.
//!
//! gRPC-backed implementation of [`GuestService`].

use super::{CommandOutput, CommandRequest, GuestService};
use async_trait::async_trait;
use tonic::transport::Channel;
use vmshim_shared::errors::VmshimResult;
use vmshim_shared::{GuestClient, RunCommandRequest, TimeSyncRequest};

/// Guest service interface over a tonic channel.
#[derive(Clone)]
pub struct GuestInterface {
    client: GuestClient<Channel>,
}

impl GuestInterface {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: GuestClient::new(channel),
        }
    }
}

#[async_trait]
impl GuestService for GuestInterface {
    async fn time_sync(&self, unix_nanos: i64) -> VmshimResult<()> {
        let mut client = self.client.clone();
        client
            .time_sync(TimeSyncRequest {
                unix_time_ns: unix_nanos,
            })
            .await?;
        tracing::debug!(unix_nanos, "Guest clock synchronized");
        Ok(())
    }

    async fn run_command(&self, request: CommandRequest) -> VmshimResult<CommandOutput> {
        let mut client = self.client.clone();
        tracing::debug!(argv = ?request.argv, "Running guest command");
        let response = client
            .run_command(RunCommandRequest {
                argv: request.argv,
                env_vars: request.env,
                stdin: request.stdin,
            })
            .await?
            .into_inner();

        Ok(CommandOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
        })
    }
}
