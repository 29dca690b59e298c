//! Guest agent speaking the real control-channel protocol.
//!
//! Serves a [`RecordingGuest`] over the fake VM's vsock so tests can drive
//! the host through its production gRPC client.

use crate::fake_vm::FakeVm;
use crate::guest::RecordingGuest;
use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use vmshim::portal::{CommandRequest, GuestService};
use vmshim_shared::constants::ports;
use vmshim_shared::{
    Guest, GuestServer, RunCommandRequest, RunCommandResponse, TimeSyncRequest, TimeSyncResponse,
};

/// gRPC front for a [`RecordingGuest`].
pub struct GuestAgent {
    guest: Arc<RecordingGuest>,
}

impl GuestAgent {
    pub fn new(guest: Arc<RecordingGuest>) -> Self {
        Self { guest }
    }

    /// Accept host dials to the guest service port of `vm` and answer them.
    pub fn serve(self, vm: &FakeVm) -> JoinHandle<()> {
        let rx = vm.guest_listen(ports::GUEST_SERVICE);
        let incoming = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|stream| (Ok::<_, io::Error>(stream), rx))
        }));

        tokio::spawn(async move {
            if let Err(e) = Server::builder()
                .add_service(GuestServer::new(self))
                .serve_with_incoming(incoming)
                .await
            {
                eprintln!("guest agent stopped: {e}");
            }
        })
    }
}

#[tonic::async_trait]
impl Guest for GuestAgent {
    async fn time_sync(
        &self,
        request: Request<TimeSyncRequest>,
    ) -> Result<Response<TimeSyncResponse>, Status> {
        self.guest
            .time_sync(request.into_inner().unix_time_ns)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(TimeSyncResponse {}))
    }

    async fn run_command(
        &self,
        request: Request<RunCommandRequest>,
    ) -> Result<Response<RunCommandResponse>, Status> {
        let request = request.into_inner();
        let output = self
            .guest
            .run_command(CommandRequest {
                argv: request.argv,
                env: request.env_vars,
                stdin: request.stdin,
            })
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RunCommandResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }))
    }
}
