//! Core types for the MeshLink agent bridge.
//!
//! This crate defines the data model shared by the wire protocol, the
//! process runtime and the kernel facade. It contains no I/O.

pub mod command;
pub mod config;
pub mod error;
pub mod state;

pub use command::{Command, Reply};
pub use config::{MeshLinkConfig, RestartPolicy};
pub use error::{MeshLinkError, MeshLinkResult};
pub use state::ServiceState;
