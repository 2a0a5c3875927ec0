//! Observability for the install matrix.
//!
//! Everything logs through `tracing`. Binaries call [`init_tracing`] once at
//! startup; libraries only emit events.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogFormat, TracingConfig, TracingError};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, trace, warn, Level};
