//! # Knockd Telemetry
//!
//! Structured logging for the knock daemon, configured from the environment.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knockd_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config).expect("Failed to init logging");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `KNOCKD_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter directives |
//! | `KNOCKD_JSON_LOGS` | `false` (`true` in containers) | One JSON object per line |
//! | `KNOCKD_LOG_TARGETS` | `false` | Include the module path of each event |

#![warn(missing_docs)]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The log filter directives did not parse.
    #[error("Invalid log filter {directives:?}: {reason}")]
    Filter {
        /// Directives as configured
        directives: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber was already installed.
    #[error("Failed to initialize logging: {0}")]
    Init(String),
}
