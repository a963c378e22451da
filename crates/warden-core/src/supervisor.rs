//! Connection lifecycle supervision.
//!
//! [`ConnectionSupervisor`] is a single-consumer actor: one spawned task owns
//! the connection handle, the state machine, and the unresponsiveness
//! deadline. Entry points send commands over an mpsc channel, so "reconnect
//! completes" can never race "deadline fires" — both are serialized through
//! the same loop.
//!
//! Handshakes run in their own task and report back to the actor as commands
//! carrying the connection id, which lets the actor drop acknowledgments from
//! a connection that has since been replaced.

use crate::config::SupervisorConfig;
use crate::error::{Result, WardenError};
use crate::proxy::OperationProxy;
use crate::worker::{ConnectionSource, FatalRecovery, WorkerClient, WorkerConnection};
use serde::Serialize;
use std::fmt::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};

/// Connection state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Unresponsive,
}

/// Snapshot of the supervisor's state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub connection_id: Option<u64>,
}

enum Command {
    Start,
    NotifyConnected(Arc<dyn WorkerConnection>),
    NotifyDisconnected,
    HandshakeResolved {
        connection_id: u64,
        result: Result<Arc<dyn WorkerClient>>,
    },
    Status(oneshot::Sender<SupervisorStatus>),
    Dump(oneshot::Sender<String>),
    Shutdown,
}

/// Cheaply cloneable handle for talking to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    /// Issue a bind request toward the worker service.
    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    /// The connection source delivered a fresh worker connection.
    pub async fn notify_connected(&self, connection: Arc<dyn WorkerConnection>) -> Result<()> {
        self.send(Command::NotifyConnected(connection)).await
    }

    /// The worker process died.
    pub async fn notify_disconnected(&self) -> Result<()> {
        self.send(Command::NotifyDisconnected).await
    }

    /// Current state snapshot.
    pub async fn status(&self) -> Result<SupervisorStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Status(reply_tx)).await?;
        reply_rx.await.map_err(|_| WardenError::SupervisorClosed)
    }

    /// Full diagnostic dump: supervisor state plus the proxy's sections.
    pub async fn dump(&self) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Dump(reply_tx)).await?;
        reply_rx.await.map_err(|_| WardenError::SupervisorClosed)
    }

    /// Stop the actor. Pending commands already queued are dropped.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| WardenError::SupervisorClosed)
    }
}

/// The actor. Constructed and spawned via [`ConnectionSupervisor::spawn`].
pub struct ConnectionSupervisor {
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    config: SupervisorConfig,
    source: Arc<dyn ConnectionSource>,
    proxy: Arc<OperationProxy>,
    recovery: Arc<dyn FatalRecovery>,
    state: ConnectionState,
    connection: Option<Arc<dyn WorkerConnection>>,
    deadline: Option<Pin<Box<Sleep>>>,
    escalated: bool,
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task and return the handle for talking to it.
    pub fn spawn(
        config: SupervisorConfig,
        source: Arc<dyn ConnectionSource>,
        proxy: Arc<OperationProxy>,
        recovery: Arc<dyn FatalRecovery>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(32);
        let actor = Self {
            rx,
            self_tx: tx.clone(),
            config,
            source,
            proxy,
            recovery,
            state: ConnectionState::Disconnected,
            connection: None,
            deadline: None,
            escalated: false,
        };
        tokio::spawn(actor.run());
        SupervisorHandle { tx }
    }

    async fn run(mut self) {
        debug!("connection supervisor started");
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                () = Self::expired(&mut self.deadline) => {
                    self.deadline = None;
                    self.on_deadline_expired();
                }
            }
        }
        debug!("connection supervisor stopped");
    }

    /// Resolves when the armed deadline fires; pends forever while no
    /// deadline is armed.
    async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
        match deadline {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.on_start().await,
            Command::NotifyConnected(connection) => self.on_connected(connection),
            Command::NotifyDisconnected => self.on_disconnected(),
            Command::HandshakeResolved {
                connection_id,
                result,
            } => self.on_handshake_resolved(connection_id, result).await,
            Command::Status(reply) => {
                let _ = reply.send(SupervisorStatus {
                    state: self.state,
                    connection_id: self.connection.as_ref().map(|c| c.id()),
                });
            }
            Command::Dump(reply) => {
                let _ = reply.send(self.render_dump());
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn on_start(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("start requested in state {:?}; ignoring", self.state);
            return;
        }
        self.state = ConnectionState::Connecting;
        info!("requesting bind to the worker service");
        if let Err(e) = self.source.bind().await {
            error!("bind request failed: {}", e);
            self.state = ConnectionState::Disconnected;
        }
    }

    fn on_connected(&mut self, connection: Arc<dyn WorkerConnection>) {
        if let Some(existing) = &self.connection {
            if existing.id() == connection.id() {
                debug!(
                    "duplicate connected notification for connection {}; ignoring",
                    connection.id()
                );
                return;
            }
            info!(
                "worker connection changed: {} -> {}",
                existing.id(),
                connection.id()
            );
        }

        let connection_id = connection.id();
        self.connection = Some(connection.clone());
        self.state = ConnectionState::Connected;
        info!("worker connected (connection {}); starting handshake", connection_id);

        // Any deadline armed for a previous connection is replaced, never
        // left running alongside the new one.
        self.deadline = Some(Box::pin(sleep(self.config.handshake_timeout)));

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = connection.handshake().await;
            let _ = tx
                .send(Command::HandshakeResolved {
                    connection_id,
                    result,
                })
                .await;
        });
    }

    async fn on_handshake_resolved(
        &mut self,
        connection_id: u64,
        result: Result<Arc<dyn WorkerClient>>,
    ) {
        let current = self.connection.as_ref().map(|c| c.id());
        if current != Some(connection_id) {
            debug!(
                "stale handshake result for connection {} (current: {:?}); ignoring",
                connection_id, current
            );
            return;
        }

        match result {
            Ok(client) => {
                self.deadline = None;
                info!("handshake acknowledged by connection {}", connection_id);
                self.proxy.on_reconnected(client).await;
            }
            Err(e @ WardenError::Protocol { .. }) => {
                // A worker that answers the handshake wrongly is treated like
                // one that never answers at all.
                error!("handshake protocol violation: {}", e);
                self.deadline = None;
                self.state = ConnectionState::Unresponsive;
                self.escalate("worker handshake violated the protocol");
            }
            Err(e) => {
                warn!("handshake failed in transit: {}", e);
                self.on_disconnected();
            }
        }
    }

    fn on_disconnected(&mut self) {
        self.connection = None;
        self.deadline = None;
        self.state = ConnectionState::Disconnected;
        self.proxy.handle_crash();
        if self.config.restart_on_crash {
            self.escalate("worker crashed and restart-on-crash is enabled");
        } else {
            warn!("worker disconnected; waiting for it to come back");
        }
    }

    fn on_deadline_expired(&mut self) {
        self.state = ConnectionState::Unresponsive;
        error!(
            "worker did not acknowledge the handshake within {:?}",
            self.config.handshake_timeout
        );
        self.escalate("worker service is unresponsive");
    }

    fn escalate(&mut self, reason: &str) {
        // Production recovery never returns; in tests it does, and a second
        // escalation from the same supervisor would be a bug.
        if self.escalated {
            return;
        }
        self.escalated = true;
        self.recovery.escalate(reason);
    }

    fn render_dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Connection supervisor: state={:?}, connection={:?}, restart_on_crash={}",
            self.state,
            self.connection.as_ref().map(|c| c.id()),
            self.config.restart_on_crash
        );
        out.push_str(&self.proxy.dump());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleEventType, UserId};
    use crate::worker::ResetCallback;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::advance;

    /// Let spawned tasks and queued commands run to completion.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    struct CountingRecovery {
        escalations: AtomicUsize,
    }

    impl CountingRecovery {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                escalations: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.escalations.load(Ordering::SeqCst)
        }
    }

    impl FatalRecovery for CountingRecovery {
        fn escalate(&self, _reason: &str) {
            self.escalations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockSource {
        binds: AtomicUsize,
    }

    impl MockSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                binds: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionSource for MockSource {
        async fn bind(&self) -> Result<()> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Client stub counting initBootUser calls, enough to observe replay.
    struct StubClient {
        init_calls: AtomicUsize,
    }

    impl StubClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                init_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerClient for StubClient {
        async fn init_boot_user(&self) -> Result<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_user_removed(&self, _user_id: UserId) -> Result<()> {
            Ok(())
        }

        async fn on_factory_reset(&self, _callback: ResetCallback) -> Result<()> {
            Ok(())
        }

        async fn on_user_lifecycle_event(
            &self,
            _event: LifecycleEventType,
            _from: Option<UserId>,
            _to: UserId,
        ) -> Result<()> {
            Ok(())
        }
    }

    enum HandshakeBehavior {
        Ack(Arc<StubClient>),
        NeverAck,
        FailProtocol,
        FailTransport,
        /// Acks once the held receiver resolves.
        AckWhenTriggered(Mutex<Option<oneshot::Receiver<()>>>, Arc<StubClient>),
    }

    struct MockConnection {
        id: u64,
        behavior: HandshakeBehavior,
        handshakes: AtomicUsize,
    }

    impl MockConnection {
        fn new(id: u64, behavior: HandshakeBehavior) -> Arc<Self> {
            Arc::new(Self {
                id,
                behavior,
                handshakes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerConnection for MockConnection {
        fn id(&self) -> u64 {
            self.id
        }

        async fn handshake(&self) -> Result<Arc<dyn WorkerClient>> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                HandshakeBehavior::Ack(client) => Ok(client.clone()),
                HandshakeBehavior::NeverAck => std::future::pending().await,
                HandshakeBehavior::FailProtocol => {
                    Err(WardenError::protocol("malformed handshake acknowledgment"))
                }
                HandshakeBehavior::FailTransport => {
                    Err(WardenError::transport("peer died mid-handshake"))
                }
                HandshakeBehavior::AckWhenTriggered(rx, client) => {
                    let rx = rx.lock().unwrap().take();
                    match rx {
                        Some(rx) => {
                            let _ = rx.await;
                            Ok(client.clone())
                        }
                        None => std::future::pending().await,
                    }
                }
            }
        }
    }

    struct Fixture {
        handle: SupervisorHandle,
        source: Arc<MockSource>,
        proxy: Arc<OperationProxy>,
        recovery: Arc<CountingRecovery>,
    }

    fn fixture(config: SupervisorConfig) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
        let source = MockSource::new();
        let proxy = Arc::new(OperationProxy::new());
        let recovery = CountingRecovery::new();
        let handle =
            ConnectionSupervisor::spawn(config, source.clone(), proxy.clone(), recovery.clone());
        Fixture {
            handle,
            source,
            proxy,
            recovery,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_issues_bind_and_moves_to_connecting() {
        let f = fixture(SupervisorConfig::default());
        f.handle.start().await.unwrap();

        let status = f.handle.status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(f.source.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_ack_cancels_deadline_and_replays() {
        let f = fixture(SupervisorConfig::default());
        f.proxy.request_init_boot_user().await;

        let client = StubClient::new();
        let conn = MockConnection::new(1, HandshakeBehavior::Ack(client.clone()));
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        assert_eq!(client.init_calls.load(Ordering::SeqCst), 1);
        assert!(f.proxy.status().connected);

        // Well past the deadline: the ack must have disarmed it.
        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(f.recovery.count(), 0);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_handshake_escalates_exactly_once() {
        let f = fixture(SupervisorConfig::default());
        let conn = MockConnection::new(1, HandshakeBehavior::NeverAck);
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;
        assert_eq!(f.recovery.count(), 0);

        advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(f.recovery.count(), 1);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Unresponsive
        );

        // The deadline never fires twice.
        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(f.recovery.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_connected_notification_is_ignored() {
        let f = fixture(SupervisorConfig::default());
        let client = StubClient::new();
        let conn = MockConnection::new(7, HandshakeBehavior::Ack(client));
        f.handle.notify_connected(conn.clone()).await.unwrap();
        settle().await;
        f.handle.notify_connected(conn.clone()).await.unwrap();
        settle().await;

        assert_eq!(conn.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handshake_ack_is_ignored() {
        let f = fixture(SupervisorConfig::default());
        let (trigger, triggered) = oneshot::channel();
        let old_client = StubClient::new();
        let old = MockConnection::new(
            1,
            HandshakeBehavior::AckWhenTriggered(Mutex::new(Some(triggered)), old_client),
        );
        f.handle.notify_connected(old).await.unwrap();
        settle().await;

        // The connection is replaced before the old handshake resolves.
        let replacement = MockConnection::new(2, HandshakeBehavior::NeverAck);
        f.handle.notify_connected(replacement).await.unwrap();
        settle().await;

        trigger.send(()).unwrap();
        settle().await;

        // The stale ack must not mark the proxy reconnected.
        assert!(!f.proxy.status().connected);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_connection_gets_fresh_deadline() {
        let f = fixture(SupervisorConfig::default());
        let old = MockConnection::new(1, HandshakeBehavior::NeverAck);
        f.handle.notify_connected(old).await.unwrap();
        settle().await;

        advance(Duration::from_secs(10)).await;
        settle().await;

        // Replaced 10s in: the old deadline is canceled, a new 15s one armed.
        let client = StubClient::new();
        let replacement = MockConnection::new(2, HandshakeBehavior::Ack(client));
        f.handle.notify_connected(replacement).await.unwrap();
        settle().await;

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(f.recovery.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_restart_flag_waits() {
        let f = fixture(SupervisorConfig::default());
        let client = StubClient::new();
        let conn = MockConnection::new(1, HandshakeBehavior::Ack(client));
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        f.handle.notify_disconnected().await.unwrap();
        settle().await;

        assert_eq!(f.recovery.count(), 0);
        assert!(f.proxy.status().crashed);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_restart_flag_escalates() {
        let config = SupervisorConfig {
            restart_on_crash: true,
            ..SupervisorConfig::default()
        };
        let f = fixture(config);
        let client = StubClient::new();
        let conn = MockConnection::new(1, HandshakeBehavior::Ack(client));
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        f.handle.notify_disconnected().await.unwrap();
        settle().await;
        assert_eq!(f.recovery.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_handshake_failure_escalates() {
        let f = fixture(SupervisorConfig::default());
        let conn = MockConnection::new(1, HandshakeBehavior::FailProtocol);
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        assert_eq!(f.recovery.count(), 1);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Unresponsive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_handshake_failure_takes_crash_path() {
        let f = fixture(SupervisorConfig::default());
        let conn = MockConnection::new(1, HandshakeBehavior::FailTransport);
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        assert_eq!(f.recovery.count(), 0);
        assert!(f.proxy.status().crashed);
        assert_eq!(
            f.handle.status().await.unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_crash_replays_pending() {
        let f = fixture(SupervisorConfig::default());
        let client = StubClient::new();
        let conn = MockConnection::new(1, HandshakeBehavior::Ack(client));
        f.handle.notify_connected(conn).await.unwrap();
        settle().await;

        f.handle.notify_disconnected().await.unwrap();
        settle().await;
        f.proxy.request_init_boot_user().await;

        let client2 = StubClient::new();
        let conn2 = MockConnection::new(2, HandshakeBehavior::Ack(client2.clone()));
        f.handle.notify_connected(conn2).await.unwrap();
        settle().await;

        assert_eq!(client2.init_calls.load(Ordering::SeqCst), 1);
        assert!(f.proxy.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_includes_supervisor_and_proxy_sections() {
        let f = fixture(SupervisorConfig::default());
        f.proxy.request_user_removed(9).await;

        let dump = f.handle.dump().await.unwrap();
        assert!(dump.contains("Connection supervisor: state=Disconnected"));
        assert!(dump.contains("users_removed: [9]"));
        assert!(dump.contains("User lifecycle metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_the_handle() {
        let f = fixture(SupervisorConfig::default());
        f.handle.shutdown().await.unwrap();
        settle().await;

        assert!(matches!(
            f.handle.status().await,
            Err(WardenError::SupervisorClosed)
        ));
    }
}
