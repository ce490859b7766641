//! Command and reply values exchanged with the agent.
//!
//! A request is a flat JSON object: the command name sits under the
//! `command` key and every payload field is merged alongside it, e.g.
//! `{"command": "publish", "topic": "news", "message": "hi"}`.

use crate::error::{MeshLinkError, MeshLinkResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key that carries the command name on the wire.
pub const COMMAND_FIELD: &str = "command";

/// Command names understood by the agent.
pub mod names {
    pub const CONNECT: &str = "connect";
    pub const BROADCAST: &str = "broadcast";
    pub const JOIN: &str = "join";
    pub const PUBLISH: &str = "publish";
    pub const ADDRESS: &str = "address";
    pub const PEERS: &str = "peers";
    pub const STATS: &str = "stats";
    pub const DISCONNECT_PEER: &str = "disconnect_peer";
}

/// A single request to the agent. Built per call and sent once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "command")]
    name: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl Command {
    /// A command with an empty payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field. The reserved `command` key is ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != COMMAND_FIELD {
            self.payload.insert(key, value.into());
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn connect(address: &str) -> Self {
        Self::new(names::CONNECT).with("address", address)
    }

    pub fn broadcast(message: &str) -> Self {
        Self::new(names::BROADCAST).with("message", message)
    }

    pub fn join(topic: &str) -> Self {
        Self::new(names::JOIN).with("topic", topic)
    }

    pub fn publish(topic: &str, message: &str) -> Self {
        Self::new(names::PUBLISH)
            .with("topic", topic)
            .with("message", message)
    }

    pub fn address() -> Self {
        Self::new(names::ADDRESS)
    }

    pub fn peers() -> Self {
        Self::new(names::PEERS)
    }

    pub fn stats() -> Self {
        Self::new(names::STATS)
    }

    pub fn disconnect_peer(peer_id: &str) -> Self {
        Self::new(names::DISCONNECT_PEER).with("peer_id", peer_id)
    }
}

/// The agent's answer to exactly one [`Command`].
///
/// The full reply object is kept as received. Only `error` carries
/// contractual meaning; `success`, `data` and command-specific fields
/// (`address`, `peers`, `stats`) are read through accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reply(Map<String, Value>);

impl Reply {
    /// Wrap a decoded JSON value. Anything other than an object is rejected.
    pub fn from_value(value: Value) -> MeshLinkResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(MeshLinkError::Protocol(format!(
                "reply must be a JSON object, got {other}"
            ))),
        }
    }

    /// A failure reply carrying `message` under `error`.
    pub fn failure(message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("success".to_string(), Value::Bool(false));
        map.insert("error".to_string(), Value::String(message.into()));
        Self(map)
    }

    /// The agent's error message, if present and non-empty.
    pub fn error(&self) -> Option<&str> {
        self.0
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
    }

    /// Explicit `success` flag if the agent sent one, otherwise "no error".
    pub fn success(&self) -> bool {
        self.0
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| self.error().is_none())
    }

    /// The generic `data` payload.
    pub fn data(&self) -> Option<&Value> {
        self.0.get("data")
    }

    /// Any named field of the reply.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Turn an error-bearing reply into [`MeshLinkError::RemoteError`].
    pub fn into_result(self) -> MeshLinkResult<Self> {
        match self.error() {
            Some(message) => Err(MeshLinkError::RemoteError(message.to_string())),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serializes_flat() {
        let cmd = Command::publish("news", "hello");
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({"command": "publish", "topic": "news", "message": "hello"})
        );
    }

    #[test]
    fn test_command_without_payload() {
        let value = serde_json::to_value(Command::peers()).unwrap();
        assert_eq!(value, json!({"command": "peers"}));
    }

    #[test]
    fn test_reserved_key_is_ignored() {
        let cmd = Command::new("stats").with("command", "evil");
        assert_eq!(cmd.name(), "stats");
        assert!(cmd.payload().is_empty());
    }

    #[test]
    fn test_command_parses_back() {
        let cmd: Command =
            serde_json::from_str(r#"{"command":"disconnect_peer","peer_id":"Qm1"}"#).unwrap();
        assert_eq!(cmd, Command::disconnect_peer("Qm1"));
    }

    #[test]
    fn test_reply_error_extraction() {
        let reply = Reply::from_value(json!({"error": "not subscribed"})).unwrap();
        assert_eq!(reply.error(), Some("not subscribed"));
        assert!(!reply.success());
        match reply.into_result() {
            Err(MeshLinkError::RemoteError(msg)) => assert_eq!(msg, "not subscribed"),
            other => panic!("expected RemoteError, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_error_is_success() {
        let reply = Reply::from_value(json!({"error": "", "address": "/ip4/1.2.3.4"})).unwrap();
        assert!(reply.error().is_none());
        assert!(reply.success());
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn test_explicit_success_flag_wins() {
        let reply = Reply::from_value(json!({"success": false})).unwrap();
        assert!(!reply.success());
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn test_reply_must_be_object() {
        assert!(matches!(
            Reply::from_value(json!([1, 2])),
            Err(MeshLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_failure_reply_is_remote_error() {
        let reply = Reply::failure("topic refused");
        assert!(!reply.success());
        match reply.into_result() {
            Err(MeshLinkError::RemoteError(msg)) => assert_eq!(msg, "topic refused"),
            other => panic!("expected RemoteError, got {other:?}"),
        }
    }
}
