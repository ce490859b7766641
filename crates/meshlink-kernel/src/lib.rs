//! MeshLink kernel: the session facade over a supervised agent.
//!
//! [`MeshLink`] is the public entry point. It owns the agent process, the
//! single-flight command channel and the [`TopicRegistry`] for one session.

pub mod config;
pub mod facade;
pub mod topics;

pub use config::load_config;
pub use facade::MeshLink;
pub use topics::TopicRegistry;
