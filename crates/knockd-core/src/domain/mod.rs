//! Domain Layer - Pure knock protocol logic with no I/O
//!
//! This module contains:
//! - Knock sequences and the per-source sequence state machine
//! - Granted access records and the expiry queue that drives revocation
//! - Daemon configuration values and domain errors

pub mod config;
pub mod errors;
pub mod expiry;
pub mod grants;
pub mod matcher;
pub mod sequence;
/// Core value types (timestamps, knock events)
pub mod types;

pub use config::*;
pub use errors::*;
pub use expiry::*;
pub use grants::*;
pub use matcher::*;
pub use sequence::*;
pub use types::*;
