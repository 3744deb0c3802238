//! Edgewarden Protocol - shared data model
//!
//! This crate defines the structures every agent component agrees on:
//! - `User`: a permitted user with protocol credentials, quota and expiry
//! - `Protocol`/`ManagementMode`: the fixed protocol and mode vocabularies
//! - `CircuitBreaker`: the node-wide kill switch
//! - `UserList`: the versioned list served by the remote manager
//! - Manager wire types (register, heartbeat, reports, certificates)
//!
//! All structures serialize with serde to the JSON shapes used on disk
//! and on the wire.

mod manager;
mod user;

pub use manager::*;
pub use user::*;
