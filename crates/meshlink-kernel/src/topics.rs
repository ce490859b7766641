//! Local record of the topics this session has joined.
//!
//! The agent is the source of truth for subscriptions; this registry only
//! remembers which `join` commands it acknowledged so repeated joins and
//! publishes don't cost a round trip. Topics are never removed.

use meshlink_types::{Command, MeshLinkError, MeshLinkResult};
use meshlink_wire::CommandTransport;
use std::collections::BTreeSet;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Topics acknowledged by the agent.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: RwLock<BTreeSet<String>>,
    /// Held while a `join` is in flight so two callers joining the same
    /// topic send it once.
    join_gate: Mutex<()>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `topic` unless it is already recorded.
    ///
    /// Returns `true` if a `join` was sent. On failure nothing is recorded
    /// and the error is returned as-is.
    pub async fn ensure_joined(
        &self,
        topic: &str,
        transport: &CommandTransport,
    ) -> MeshLinkResult<bool> {
        if self.contains(topic) {
            return Ok(false);
        }

        let _gate = self.join_gate.lock().await;
        if self.contains(topic) {
            return Ok(false);
        }

        transport.send(Command::join(topic)).await?;
        self.insert(topic);
        info!(topic, "Joined topic");
        Ok(true)
    }

    /// Send `join` for every recorded topic over a new transport.
    ///
    /// Used after the agent was relaunched and lost its subscriptions. An
    /// agent-side refusal is logged and skipped; a broken transport aborts.
    pub async fn rejoin_all(&self, transport: &CommandTransport) -> MeshLinkResult<usize> {
        let _gate = self.join_gate.lock().await;
        let mut rejoined = 0;
        for topic in self.snapshot() {
            match transport.send(Command::join(&topic)).await {
                Ok(_) => rejoined += 1,
                Err(e @ MeshLinkError::RemoteError(_)) => {
                    warn!(topic = %topic, error = %e, "Agent refused topic on rejoin");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(rejoined, "Replayed topic joins");
        Ok(rejoined)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics
            .read()
            .map(|t| t.contains(topic))
            .unwrap_or(false)
    }

    /// Copy of the recorded topics, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        self.topics
            .read()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, topic: &str) {
        match self.topics.write() {
            Ok(mut t) => {
                t.insert(topic.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(topic.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshlink_types::Reply;
    use meshlink_wire::{AgentChannel, WireError};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Agent double. Records every command; refuses joins for topics
    /// starting with `bad`.
    struct FakeAgent {
        seen: Arc<StdMutex<Vec<Value>>>,
    }

    #[async_trait]
    impl AgentChannel for FakeAgent {
        async fn exchange(&mut self, command: &Command) -> Result<Reply, WireError> {
            let topic = command
                .payload()
                .get("topic")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let reply = if topic.starts_with("bad") {
                Reply::failure(format!("cannot join {topic}"))
            } else {
                Reply::default()
            };
            self.seen
                .lock()
                .unwrap()
                .push(serde_json::to_value(command).unwrap());
            Ok(reply)
        }
    }

    fn fake_agent() -> (CommandTransport, Arc<StdMutex<Vec<Value>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let agent = FakeAgent { seen: seen.clone() };
        (CommandTransport::new(agent), seen)
    }

    #[tokio::test]
    async fn test_second_join_is_local() {
        let (transport, seen) = fake_agent();
        let registry = TopicRegistry::new();

        assert!(registry.ensure_joined("news", &transport).await.unwrap());
        assert!(!registry.ensure_joined("news", &transport).await.unwrap());

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            seen.lock().unwrap()[0],
            json!({"command": "join", "topic": "news"})
        );
        assert!(registry.contains("news"));
    }

    #[tokio::test]
    async fn test_failed_join_is_not_recorded() {
        let (transport, seen) = fake_agent();
        let registry = TopicRegistry::new();

        let err = registry.ensure_joined("bad-topic", &transport).await.unwrap_err();
        match err {
            MeshLinkError::RemoteError(msg) => assert_eq!(msg, "cannot join bad-topic"),
            other => panic!("expected RemoteError, got {other:?}"),
        }
        assert!(registry.is_empty());

        // Not recorded, so the next attempt goes to the agent again.
        let _ = registry.ensure_joined("bad-topic", &transport).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_send_once() {
        let (transport, seen) = fake_agent();
        let transport = Arc::new(transport);
        let registry = Arc::new(TopicRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let transport = transport.clone();
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.ensure_joined("chat", &transport).await.unwrap()
            }));
        }
        let mut sent = 0;
        for task in tasks {
            if task.await.unwrap() {
                sent += 1;
            }
        }

        assert_eq!(sent, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let (transport, _) = fake_agent();
        let registry = TopicRegistry::new();
        registry.ensure_joined("b", &transport).await.unwrap();
        registry.ensure_joined("a", &transport).await.unwrap();

        let mut snapshot = registry.snapshot();
        assert_eq!(snapshot, vec!["a".to_string(), "b".to_string()]);
        snapshot.clear();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_rejoin_all_replays_and_keeps_registry() {
        let (first, _) = fake_agent();
        let registry = TopicRegistry::new();
        registry.ensure_joined("a", &first).await.unwrap();
        registry.ensure_joined("b", &first).await.unwrap();

        let (second, seen) = fake_agent();
        assert_eq!(registry.rejoin_all(&second).await.unwrap(), 2);
        let topics: Vec<Value> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|r| r["topic"].clone())
            .collect();
        assert_eq!(topics, vec![json!("a"), json!("b")]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_rejoin_on_closed_transport_fails() {
        let (transport, _) = fake_agent();
        let registry = TopicRegistry::new();
        registry.ensure_joined("a", &transport).await.unwrap();
        transport.close().await;

        let err = registry.rejoin_all(&transport).await.unwrap_err();
        assert!(matches!(err, MeshLinkError::TransportClosed { .. }));
        assert!(registry.contains("a"));
    }
}
