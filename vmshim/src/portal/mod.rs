//! Host-side portal for talking to the guest service over vsock.

pub mod connection;
pub mod interfaces;
pub mod session;

pub use connection::{GrpcConnector, GuestConnector, GuestTransport};
pub use interfaces::{CommandOutput, CommandRequest, GuestService};
pub use session::{GuestSession, split_command};
