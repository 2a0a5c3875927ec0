//! Container Runtime implementations for the install matrix.
//!
//! This crate provides implementations of the `ContainerRuntime` trait:
//! - `EngineCliRuntime`: drives the Docker, Finch or Podman CLI
//! - `MockRuntime`: In-memory fake for testing (default `mock-runtime` feature)
//!
//! The `detection` module picks the engine once at startup by probing the
//! engines' sockets in priority order.

pub mod detection;
pub mod engine_cli;

#[cfg(feature = "mock-runtime")]
pub mod mock;

// Re-export common types
pub use container_runtime_interface::{
    ContainerHandle, ContainerRuntime, CreateContainerOptions, ExecOutput, ExecRequest, RuntimeError,
};

pub use detection::{detect_engine, detect_local, DetectedEngine, EngineKind, SocketCandidate};
pub use engine_cli::{EngineCliConfig, EngineCliRuntime};

#[cfg(feature = "mock-runtime")]
pub use mock::{ExecRecord, ExecRule, MockResponse, MockRuntime};
