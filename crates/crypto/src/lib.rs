//! Edgewarden Crypto - node secret material
//!
//! This crate provides:
//! - X25519 reality key pair generation (URL-safe base64, unpadded)
//! - Hex short-ids
//! - Random listener port assignment
//! - Random user credentials
//! - `secrets.json` persistence with owner-only permissions

mod secrets;

pub use secrets::*;
