//! Process-facing runtime for MeshLink.
//!
//! Finds the agent executable, launches and supervises it, and provides the
//! backoff used for relaunches and startup connection attempts.

pub mod locator;
pub mod retry;
pub mod supervisor;

pub use locator::AgentLocator;
pub use supervisor::{LaunchSpec, OutputObserver, ProcessHandle, ProcessStatus, ProcessSupervisor};
