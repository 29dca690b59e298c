//! vmshim shared - code for both the host runtime and the guest init
//!
//! This crate contains the error taxonomy, well-known ports and mount tags,
//! the runtime-data layout, and the guest control-channel protocol.

pub mod constants;
pub mod errors;
pub mod layout;

// Generated protobuf types
pub mod generated {
    #![allow(clippy::all, unused_qualifications)]
    tonic::include_proto!("vmshim.v1");
}

pub use errors::{VmshimError, VmshimResult};

// Guest service
pub use generated::guest_client::GuestClient;
pub use generated::guest_server::{Guest, GuestServer};

// All generated types
pub use generated::*;
