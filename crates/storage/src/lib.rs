//! Edgewarden Storage - persisted agent state
//!
//! This crate provides:
//! - Atomic whole-file writes (tmp + rename)
//! - `LocalStore`: locally administered users and the circuit breaker,
//!   rewritten wholesale on every mutation, publishing change events
//! - `RemoteCache`: last user list fetched from the remote manager
//! - `StatsSpool`: one file per undelivered stats batch, replayed in order

mod atomic;
mod cache;
mod error;
mod local;
mod spool;

pub use atomic::*;
pub use cache::*;
pub use error::*;
pub use local::*;
pub use spool::*;
