//! Data models for identities, devices, sessions and pending messages

mod types;

pub use types::*;
