//! MeshLink wire protocol: the request/reply channel to the agent.
//!
//! The agent binds a ZeroMQ REP socket that answers exactly one reply per
//! request, with no correlation ids. Ordering is the only thing that ties a
//! reply to its command, so at most one request may be outstanding.
//!
//! ## Architecture
//!
//! - **message**: single-frame JSON codec
//! - **AgentChannel**: one request/reply exchange; `ZmqChannel` is the REQ side
//! - **CommandTransport**: single-flight gate in front of an `AgentChannel`

pub mod message;
pub mod transport;

pub use message::{decode_command, decode_reply, encode_message};
pub use transport::{AgentChannel, CommandTransport, WireError, ZmqChannel};
