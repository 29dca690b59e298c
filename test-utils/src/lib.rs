//! Test doubles and fixtures for vmshim integration tests.

pub mod fake_vm;
pub mod fixtures;
pub mod grpc;
pub mod guest;
pub mod network;

pub use fake_vm::{BootOutcome, FakeBehavior, FakeHypervisor, FakeVm};
pub use fixtures::Fixture;
pub use grpc::GuestAgent;
pub use guest::{FakeConnector, RecordingGuest};
pub use network::FakeNetwork;
