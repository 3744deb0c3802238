//! Edgewarden node agent
//!
//! Control-plane agent for one proxy node:
//! - supervises the proxy subprocess (start, stop, reload, crash restarts)
//! - reconciles users from the local store, the remote manager, or both
//! - generates the proxy configuration and applies it atomically
//! - enforces quota and expiry by evicting live sessions
//! - reports traffic, load and connections, spooling stats while offline
//! - serves a bearer-protected management API for local administration

pub mod agent;
pub mod auth;
pub mod certs;
pub mod config;
pub mod connections;
pub mod generator;
pub mod management;
pub mod manager;
pub mod metrics;
pub mod node_load;
pub mod quota;
pub mod reconciler;
pub mod stats;
pub mod supervisor;

pub use agent::Agent;
pub use config::DaemonConfig;
