//! Wire message codec.
//!
//! The agent speaks ZeroMQ REQ/REP. Every message is a single frame holding
//! one JSON document. Requests are flat command objects (`{"command":
//! "join", "topic": "news"}`); replies are arbitrary JSON objects.

use crate::transport::WireError;
use meshlink_types::{Command, Reply};
use serde::Serialize;
use zeromq::ZmqMessage;

/// Encode any serializable value as a one-frame message.
pub fn encode_message<T: Serialize + ?Sized>(msg: &T) -> Result<ZmqMessage, serde_json::Error> {
    Ok(ZmqMessage::from(serde_json::to_vec(msg)?))
}

/// The JSON body of a one-frame message.
fn single_frame<T>(
    message: ZmqMessage,
    parse: impl FnOnce(&[u8]) -> Result<T, serde_json::Error>,
) -> Result<T, WireError> {
    let frames = message.into_vec();
    match frames.as_slice() {
        [body] => Ok(parse(body)?),
        other => Err(WireError::Frames(other.len())),
    }
}

/// Parse a received message into a Command (agent side of the exchange).
pub fn decode_command(message: ZmqMessage) -> Result<Command, WireError> {
    single_frame(message, |body| serde_json::from_slice(body))
}

/// Parse a received message into a Reply. Non-object bodies are rejected.
pub fn decode_reply(message: ZmqMessage) -> Result<Reply, WireError> {
    single_frame(message, |body| serde_json::from_slice(body))
}
