//! The MeshLink facade: one supervised agent session.
//!
//! [`MeshLink`] ties the pieces together. `start` locates and launches the
//! agent, waits for its socket, and moves the session to `Running`. Every
//! command then goes through the single-flight transport. A background
//! watcher follows the agent's process status: when the agent goes down
//! the transport is closed so pending callers are released, and when the
//! supervisor gives up the session moves to `Error`.
//!
//! After a relaunch the next command reconnects and replays the joins
//! recorded in the [`TopicRegistry`], since a fresh agent has no
//! subscriptions.

use crate::topics::TopicRegistry;
use meshlink_runtime::retry::{retry_async, RetryConfig};
use meshlink_runtime::{
    AgentLocator, LaunchSpec, OutputObserver, ProcessHandle, ProcessStatus, ProcessSupervisor,
};
use meshlink_types::{
    Command, MeshLinkConfig, MeshLinkError, MeshLinkResult, Reply, ServiceState,
};
use meshlink_wire::CommandTransport;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lower bound for one connect attempt. The ZeroMQ handshake must fit in it.
const MIN_CONNECT_ATTEMPT: Duration = Duration::from_millis(250);

/// Live connection to one generation of the agent process.
#[derive(Clone)]
struct Session {
    transport: Arc<CommandTransport>,
    generation: u64,
}

/// Node address as reported by a given agent generation.
#[derive(Debug, Clone)]
struct CachedAddress {
    generation: u64,
    address: String,
}

struct Inner {
    config: MeshLinkConfig,
    locator: AgentLocator,
    supervisor: ProcessSupervisor,
    state: watch::Sender<ServiceState>,
    /// Serializes `start` and `stop`.
    lifecycle: AsyncMutex<()>,
    /// Serializes reconnects so concurrent callers share one new session.
    reconnect_gate: AsyncMutex<()>,
    process: Mutex<Option<ProcessHandle>>,
    session: Mutex<Option<Session>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    address: Mutex<Option<CachedAddress>>,
    topics: TopicRegistry,
    on_stdout: OutputObserver,
    on_stderr: OutputObserver,
}

/// Handle to a MeshLink session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct MeshLink {
    inner: Arc<Inner>,
}

impl MeshLink {
    /// A new session in `Init`. Agent output is logged.
    pub fn new(config: MeshLinkConfig) -> Self {
        Self::with_observers(config, log_stdout(), log_stderr())
    }

    /// A new session whose agent output goes to the given observers.
    pub fn with_observers(
        config: MeshLinkConfig,
        on_stdout: OutputObserver,
        on_stderr: OutputObserver,
    ) -> Self {
        let (state, _) = watch::channel(ServiceState::Init);
        Self {
            inner: Arc::new(Inner {
                locator: AgentLocator::new(&config.install_dir),
                config,
                supervisor: ProcessSupervisor::new(),
                state,
                lifecycle: AsyncMutex::new(()),
                reconnect_gate: AsyncMutex::new(()),
                process: Mutex::new(None),
                session: Mutex::new(None),
                watcher: Mutex::new(None),
                address: Mutex::new(None),
                topics: TopicRegistry::new(),
                on_stdout,
                on_stderr,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Launch the agent and open the command channel.
    ///
    /// A no-op when already `Running`. Any other state than `Init` is
    /// rejected; a stopped or failed session cannot be restarted. On failure
    /// whatever was acquired is released and the session moves to `Error`.
    pub async fn start(&self) -> MeshLinkResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.state() {
            ServiceState::Init => {}
            ServiceState::Running => return Ok(()),
            current => {
                return Err(MeshLinkError::InvalidState {
                    current,
                    operation: "start".to_string(),
                })
            }
        }

        self.inner.set_state(ServiceState::Starting);
        let launched = self.inner.launch().await.and_then(|()| {
            // The watcher may already have seen the agent die.
            let promoted = self.inner.state.send_if_modified(|state| {
                if *state == ServiceState::Starting {
                    *state = ServiceState::Running;
                    true
                } else {
                    false
                }
            });
            if promoted {
                Ok(())
            } else {
                Err(MeshLinkError::LaunchFailed(
                    "agent ended during startup".to_string(),
                ))
            }
        });

        match launched {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "MeshLink failed to start");
                self.inner.teardown().await;
                self.inner.set_state(ServiceState::Error);
                Err(e)
            }
        }
    }

    /// Close the command channel and terminate the agent.
    ///
    /// Always ends in `Stopped`. Teardown problems are logged, never
    /// returned. Calling it again is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == ServiceState::Stopped {
            debug!("MeshLink already stopped");
            return;
        }
        self.inner.set_state(ServiceState::Stopping);
        self.inner.teardown().await;
        self.inner.set_state(ServiceState::Stopped);
        info!("MeshLink stopped");
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    /// Status of the agent process, if one has been launched.
    pub fn agent_status(&self) -> Option<ProcessStatus> {
        self.inner.process_handle().map(|h| h.status())
    }

    /// Relaunches the supervisor has performed since this session started.
    pub fn agent_restarts(&self) -> u64 {
        self.inner.supervisor.restart_count()
    }

    pub fn config(&self) -> &MeshLinkConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Ask the agent to dial `address`. The address is not validated here.
    pub async fn connect_to_peer(&self, address: &str) -> MeshLinkResult<Reply> {
        self.request(Command::connect(address)).await
    }

    pub async fn broadcast(&self, message: &str) -> MeshLinkResult<Reply> {
        self.request(Command::broadcast(message)).await
    }

    pub async fn disconnect_peer(&self, peer_id: &str) -> MeshLinkResult<Reply> {
        self.request(Command::disconnect_peer(peer_id)).await
    }

    /// Join `topic` unless this session already did.
    pub async fn join_topic(&self, topic: &str) -> MeshLinkResult<()> {
        let session = self.inner.session_for("join").await?;
        self.inner
            .topics
            .ensure_joined(topic, &session.transport)
            .await?;
        Ok(())
    }

    /// Publish `message` on `topic`, joining it first if needed.
    pub async fn publish_to_topic(&self, topic: &str, message: &str) -> MeshLinkResult<Reply> {
        let session = self.inner.session_for("publish").await?;
        self.inner
            .topics
            .ensure_joined(topic, &session.transport)
            .await?;
        session
            .transport
            .send(Command::publish(topic, message))
            .await
    }

    /// This node's address. Asked once per agent process, then cached.
    pub async fn get_node_address(&self) -> MeshLinkResult<String> {
        let session = self.inner.session_for("address").await?;
        if let Some(address) = self.inner.cached_address(session.generation) {
            return Ok(address);
        }
        self.inner.fetch_address(&session).await
    }

    /// Connected peers as reported by the agent.
    pub async fn get_peers(&self) -> MeshLinkResult<Vec<Value>> {
        let reply = self.request(Command::peers()).await?;
        peers_from_reply(&reply)
    }

    /// Network statistics as reported by the agent.
    pub async fn get_network_stats(&self) -> MeshLinkResult<Map<String, Value>> {
        let reply = self.request(Command::stats()).await?;
        stats_from_reply(&reply)
    }

    /// Send an arbitrary command over the session.
    pub async fn request(&self, command: Command) -> MeshLinkResult<Reply> {
        let session = self.inner.session_for(command.name()).await?;
        session.transport.send(command).await
    }

    // -----------------------------------------------------------------------
    // Local state
    // -----------------------------------------------------------------------

    /// Topics this session has joined.
    pub fn active_topics(&self) -> Vec<String> {
        self.inner.topics.snapshot()
    }

    /// The cached node address, without asking the agent.
    pub fn node_address(&self) -> Option<String> {
        self.inner
            .address
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|c| c.address.clone()))
    }
}

impl Inner {
    fn set_state(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "MeshLink state changed");
        }
    }

    /// Move to `Error` unless the session is already winding down.
    fn fail(&self, reason: &str) {
        let moved = self.state.send_if_modified(|state| {
            if matches!(state, ServiceState::Starting | ServiceState::Running) {
                *state = ServiceState::Error;
                true
            } else {
                false
            }
        });
        if moved {
            error!(reason, "MeshLink session failed");
        }
    }

    fn process_handle(&self) -> Option<ProcessHandle> {
        self.process.lock().ok().and_then(|p| p.clone())
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn replace_session(&self, next: Option<Session>) -> Option<Session> {
        match self.session.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    /// Clear the session slot if it still holds `transport`.
    fn take_session_if(&self, transport: &Arc<CommandTransport>) {
        if let Ok(mut slot) = self.session.lock() {
            if slot
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(&s.transport, transport))
            {
                *slot = None;
            }
        }
    }

    fn cached_address(&self, generation: u64) -> Option<String> {
        let cache = self.address.lock().ok()?;
        cache
            .as_ref()
            .filter(|c| c.generation == generation)
            .map(|c| c.address.clone())
    }

    async fn launch(self: &Arc<Self>) -> MeshLinkResult<()> {
        let program = self.locator.resolve()?;

        let mut spec = LaunchSpec::new(program)
            .args(self.config.agent_args.iter().cloned())
            .env(self.config.agent_env.clone())
            .grace(self.config.shutdown_grace())
            .on_stdout(self.on_stdout.clone())
            .on_stderr(self.on_stderr.clone());
        if self.config.restart_on_failure {
            spec = spec.restart_on_failure(self.config.restart.clone());
        }

        let handle = self.supervisor.start(spec).await?;
        if let Ok(mut slot) = self.process.lock() {
            *slot = Some(handle.clone());
        }

        let generation = handle.status().generation().unwrap_or(1);
        let transport = self.connect("startup", Some(&handle)).await?;
        let session = Session {
            transport: Arc::new(transport),
            generation,
        };
        self.replace_session(Some(session.clone()));

        let watcher = tokio::spawn(watch_agent(Arc::downgrade(self), handle.subscribe()));
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }

        match self.fetch_address(&session).await {
            Ok(address) => info!(address = %address, "MeshLink started"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "MeshLink started, node address unavailable"),
        }
        Ok(())
    }

    /// Connect to the agent socket, polling until the startup timeout.
    ///
    /// Gives up early if the agent process ends or the session stops
    /// running while we wait.
    async fn connect(
        &self,
        phase: &str,
        handle: Option<&ProcessHandle>,
    ) -> MeshLinkResult<CommandTransport> {
        let endpoint = self.config.agent_endpoint();
        let window = self.config.startup_timeout();
        let retry = RetryConfig::polling(window, self.config.startup_poll());
        let attempt_wait = self.config.startup_poll().max(MIN_CONNECT_ATTEMPT);

        let polling = retry_async(
            &retry,
            || {
                let endpoint = endpoint.clone();
                async move {
                    if let Some(status) = handle.map(|h| h.status()).filter(|s| s.is_final()) {
                        return Err(MeshLinkError::LaunchFailed(format!(
                            "agent {status} before accepting connections"
                        )));
                    }
                    let state = self.current_state();
                    if !matches!(state, ServiceState::Starting | ServiceState::Running) {
                        return Err(MeshLinkError::NotRunning(state));
                    }
                    CommandTransport::connect(&endpoint, attempt_wait).await
                }
            },
            |e| matches!(e, MeshLinkError::TransportClosed { .. }),
        );

        let outcome = match tokio::time::timeout(window, polling).await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(MeshLinkError::transport_closed(
                phase,
                format!("no answer within {}ms", window.as_millis()),
            )),
        };

        match outcome {
            Ok(transport) => {
                debug!(endpoint = %endpoint, phase, "Connected to agent");
                Ok(transport)
            }
            Err(MeshLinkError::TransportClosed { reason, .. }) => {
                Err(MeshLinkError::transport_closed(
                    phase,
                    format!("agent unreachable at {endpoint}: {reason}"),
                ))
            }
            Err(e) => Err(e),
        }
    }

    fn current_state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// The session to send `command` on, reconnecting if the agent was
    /// relaunched or the channel broke.
    async fn session_for(&self, command: &str) -> MeshLinkResult<Session> {
        let state = self.current_state();
        if !state.accepts_commands() {
            return Err(MeshLinkError::NotRunning(state));
        }

        let generation = self.running_generation(command).await?;
        if let Some(session) = self.current_session() {
            if session.generation == generation && session.transport.is_open() {
                return Ok(session);
            }
        }

        let _gate = self.reconnect_gate.lock().await;
        if let Some(session) = self.current_session() {
            if session.generation == generation && session.transport.is_open() {
                return Ok(session);
            }
        }

        info!(generation, "Reconnecting to agent");
        let transport = Arc::new(self.connect("reconnect", self.process_handle().as_ref()).await?);
        if let Err(e) = self.topics.rejoin_all(&transport).await {
            transport.close().await;
            return Err(e);
        }
        let session = Session {
            transport,
            generation,
        };
        if let Some(old) = self.replace_session(Some(session.clone())) {
            old.transport.close().await;
        }

        // `stop` may have torn down while we were reconnecting. Teardown moves
        // the state first, so checking after the swap catches both orders.
        let state = self.current_state();
        if !state.accepts_commands() {
            self.take_session_if(&session.transport);
            session.transport.close().await;
            return Err(MeshLinkError::NotRunning(state));
        }
        Ok(session)
    }

    /// Generation of the running agent. While the supervisor is between
    /// launches this waits for the relaunch.
    async fn running_generation(&self, command: &str) -> MeshLinkResult<u64> {
        let handle = self
            .process_handle()
            .ok_or_else(|| MeshLinkError::transport_closed(command, "no agent process"))?;

        let patience = self.config.startup_timeout()
            + Duration::from_millis(self.config.restart.max_delay_ms);
        let status = tokio::time::timeout(
            patience,
            handle.wait_for(|s| !matches!(s, ProcessStatus::Restarting { .. })),
        )
        .await
        .map_err(|_| MeshLinkError::transport_closed(command, "agent did not come back after restart"))?;

        status
            .generation()
            .ok_or_else(|| MeshLinkError::transport_closed(command, format!("agent {status}")))
    }

    async fn fetch_address(&self, session: &Session) -> MeshLinkResult<String> {
        let reply = session.transport.send(Command::address()).await?;
        let address = address_from_reply(&reply)?;
        if let Ok(mut cache) = self.address.lock() {
            *cache = Some(CachedAddress {
                generation: session.generation,
                address: address.clone(),
            });
        }
        Ok(address)
    }

    /// Release the transport, then the process. Never fails.
    async fn teardown(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        if let Some(session) = self.replace_session(None) {
            session.transport.close().await;
        }

        let handle = self.process.lock().ok().and_then(|mut p| p.take());
        if let Some(handle) = handle {
            self.supervisor.stop(&handle).await;
            match handle.status() {
                ProcessStatus::Stopped => {}
                other => warn!(status = %other, "Agent had already ended before stop"),
            }
        }

        if let Ok(mut cache) = self.address.lock() {
            *cache = None;
        }
    }

    /// Close the transport if it belongs to an agent that is gone.
    async fn drop_session(&self) {
        if let Some(session) = self.current_session() {
            session.transport.close().await;
        }
    }
}

/// Follows the agent's process status for the life of the session.
async fn watch_agent(inner: Weak<Inner>, mut status_rx: watch::Receiver<ProcessStatus>) {
    loop {
        let ended = status_rx.changed().await.is_err();
        let status = status_rx.borrow_and_update().clone();
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match &status {
            ProcessStatus::Running { generation, .. } => {
                info!(generation, "Agent is back, next command reconnects");
            }
            ProcessStatus::Restarting { attempt, delay_ms } => {
                warn!(attempt, delay_ms, "Agent went down, closing transport");
                inner.drop_session().await;
            }
            ProcessStatus::Exited { .. } | ProcessStatus::Failed { .. } => {
                inner.drop_session().await;
                inner.fail(&format!("agent {status}"));
                return;
            }
            ProcessStatus::Stopped => return,
        }

        if ended {
            return;
        }
    }
}

fn log_stdout() -> OutputObserver {
    Arc::new(|line: &str| info!(target: "meshlink::agent", "{line}"))
}

fn log_stderr() -> OutputObserver {
    Arc::new(|line: &str| warn!(target: "meshlink::agent", "{line}"))
}

/// `address` must be a non-empty string.
fn address_from_reply(reply: &Reply) -> MeshLinkResult<String> {
    match reply.field("address") {
        Some(Value::String(address)) if !address.is_empty() => Ok(address.clone()),
        Some(other) => Err(MeshLinkError::Protocol(format!(
            "address reply carries {other}, expected a non-empty string"
        ))),
        None => Err(MeshLinkError::Protocol(
            "address reply has no 'address' field".to_string(),
        )),
    }
}

/// `peers`, else `data`, else none.
fn peers_from_reply(reply: &Reply) -> MeshLinkResult<Vec<Value>> {
    match reply.field("peers").or_else(|| reply.data()) {
        Some(Value::Array(peers)) => Ok(peers.clone()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(MeshLinkError::Protocol(format!(
            "peers reply carries {other}, expected an array"
        ))),
    }
}

/// `stats`, else `data`, else empty.
fn stats_from_reply(reply: &Reply) -> MeshLinkResult<Map<String, Value>> {
    match reply.field("stats").or_else(|| reply.data()) {
        Some(Value::Object(stats)) => Ok(stats.clone()),
        Some(Value::Null) | None => Ok(Map::new()),
        Some(other) => Err(MeshLinkError::Protocol(format!(
            "stats reply carries {other}, expected an object"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(value: Value) -> Reply {
        Reply::from_value(value).unwrap()
    }

    #[test]
    fn test_address_from_reply() {
        assert_eq!(
            address_from_reply(&reply(json!({"address": "/ip4/1.2.3.4/tcp/1"}))).unwrap(),
            "/ip4/1.2.3.4/tcp/1"
        );
        assert!(matches!(
            address_from_reply(&reply(json!({"address": ""}))),
            Err(MeshLinkError::Protocol(_))
        ));
        assert!(matches!(
            address_from_reply(&reply(json!({"data": "x"}))),
            Err(MeshLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_peers_from_reply() {
        assert_eq!(
            peers_from_reply(&reply(json!({"peers": ["a", "b"]}))).unwrap(),
            vec![json!("a"), json!("b")]
        );
        assert_eq!(
            peers_from_reply(&reply(json!({"data": [{"id": "a"}]}))).unwrap(),
            vec![json!({"id": "a"})]
        );
        assert!(peers_from_reply(&reply(json!({"success": true}))).unwrap().is_empty());
        assert!(matches!(
            peers_from_reply(&reply(json!({"peers": 3}))),
            Err(MeshLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_stats_from_reply() {
        let stats = stats_from_reply(&reply(json!({"stats": {"connected_peers": 2}}))).unwrap();
        assert_eq!(stats["connected_peers"], json!(2));
        let stats = stats_from_reply(&reply(json!({"data": {"bandwidth": "1kb"}}))).unwrap();
        assert_eq!(stats["bandwidth"], json!("1kb"));
        assert!(stats_from_reply(&reply(json!({}))).unwrap().is_empty());
        assert!(matches!(
            stats_from_reply(&reply(json!({"stats": "busy"}))),
            Err(MeshLinkError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_before_start_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshLinkConfig {
            install_dir: dir.path().to_path_buf(),
            ..MeshLinkConfig::default()
        };
        let mesh = MeshLink::new(config);

        assert_eq!(mesh.state(), ServiceState::Init);
        assert!(matches!(
            mesh.get_peers().await,
            Err(MeshLinkError::NotRunning(ServiceState::Init))
        ));
        assert!(matches!(
            mesh.publish_to_topic("t", "m").await,
            Err(MeshLinkError::NotRunning(ServiceState::Init))
        ));
        assert!(mesh.active_topics().is_empty());
        assert!(mesh.node_address().is_none());
    }

    #[tokio::test]
    async fn test_start_without_binary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshLinkConfig {
            install_dir: dir.path().to_path_buf(),
            ..MeshLinkConfig::default()
        };
        let mesh = MeshLink::new(config);

        let err = mesh.start().await.unwrap_err();
        assert!(matches!(err, MeshLinkError::NotFound(_)));
        assert_eq!(mesh.state(), ServiceState::Error);
        assert!(mesh.agent_status().is_none());

        let again = mesh.start().await.unwrap_err();
        assert!(matches!(
            again,
            MeshLinkError::InvalidState {
                current: ServiceState::Error,
                ..
            }
        ));

        mesh.stop().await;
        assert_eq!(mesh.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mesh = MeshLink::new(MeshLinkConfig::default());
        mesh.stop().await;
        mesh.stop().await;
        assert_eq!(mesh.state(), ServiceState::Stopped);
    }
}
