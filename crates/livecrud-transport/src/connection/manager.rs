//! Connection manager: runs the state machine against real transports and
//! timers, and feeds decoded notifications into the cache.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use livecrud_core::{CacheStore, ReconnectPolicy};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use super::{
    ConnId, ConnectionEvent, ConnectionMachine, ConnectionState, Connector, Effect, Incoming,
    TimerId,
};
use crate::protocol;

/// Handle to a running connection driver.
///
/// Dropping the handle tears the connection down.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<ConnectionEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    last_error: Arc<Mutex<Option<String>>>,
    cache: Arc<CacheStore>,
    driver: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start a driver that retries forever according to `policy`.
    ///
    /// Must be called within a Tokio runtime. Nothing connects until
    /// [`set_demand(true)`](Self::set_demand).
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<CacheStore>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::with_machine(connector, cache, ConnectionMachine::new(policy))
    }

    /// Start a driver around a preconfigured machine.
    #[must_use]
    pub fn with_machine(
        connector: Arc<dyn Connector>,
        cache: Arc<CacheStore>,
        machine: ConnectionMachine,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(machine.state());
        let last_error = Arc::new(Mutex::new(None));

        let driver = Driver {
            machine,
            connector,
            cache: Arc::clone(&cache),
            events_tx,
            readers: HashMap::new(),
            timers: HashMap::new(),
            state_tx,
            last_error: Arc::clone(&last_error),
        };
        let driver = tokio::spawn(driver.run(commands_rx, events_rx));

        Self {
            commands,
            state_rx,
            last_error,
            cache,
            driver,
        }
    }

    fn send(&self, event: ConnectionEvent) {
        if self.commands.send(event).is_err() {
            tracing::debug!("Connection driver already stopped");
        }
    }

    /// Declare whether anyone consumes realtime data. Connects on `true`,
    /// tears down on `false`.
    pub fn set_demand(&self, demand: bool) {
        self.send(ConnectionEvent::Demand(demand));
    }

    /// Cancel any pending retry and reconnect now.
    pub fn reconnect(&self) {
        self.send(ConnectionEvent::ManualReconnect);
    }

    /// Close the transport and cancel any pending retry.
    pub fn teardown(&self) {
        self.send(ConnectionEvent::Teardown);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The most recent transport error since the last successful open.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The cache notifications are applied to.
    #[must_use]
    pub const fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Tear down and wait for the driver to release everything.
    pub async fn shutdown(self) {
        let Self {
            commands, driver, ..
        } = self;
        drop(commands);
        if let Err(e) = driver.await {
            tracing::warn!("Connection driver ended abnormally: {e}");
        }
    }
}

struct Reader {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Driver {
    machine: ConnectionMachine,
    connector: Arc<dyn Connector>,
    cache: Arc<CacheStore>,
    /// Events from readers and timers.
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    readers: HashMap<ConnId, Reader>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(event) => event,
                    None => break,
                },
                Some(event) = events.recv() => event,
            };
            self.dispatch(event);
        }
        self.shutdown();
    }

    fn set_last_error(&self, error: Option<String>) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = error,
            Err(poisoned) => *poisoned.into_inner() = error,
        }
    }

    fn dispatch(&mut self, event: ConnectionEvent) {
        let live = self.machine.live_transport();
        match &event {
            ConnectionEvent::TransportOpened { conn } if live == Some(*conn) => {
                tracing::info!(conn, "Realtime connection open");
                self.set_last_error(None);
            }
            ConnectionEvent::TransportError { conn, message } if live == Some(*conn) => {
                tracing::warn!(conn, "Realtime transport error: {message}");
                self.set_last_error(Some(message.clone()));
            }
            ConnectionEvent::TransportClosed { conn, was_clean } if live == Some(*conn) => {
                tracing::info!(conn, was_clean, "Realtime connection closed by peer");
            }
            ConnectionEvent::RetryElapsed { timer } => {
                self.timers.remove(timer);
            }
            _ => {}
        }

        for effect in self.machine.handle(event) {
            self.execute(effect);
        }

        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Connection transition");
            *current = state;
            true
        });
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport { conn } => {
                let (close, close_rx) = oneshot::channel();
                let task = tokio::spawn(read_loop(
                    conn,
                    Arc::clone(&self.connector),
                    Arc::clone(&self.cache),
                    self.events_tx.clone(),
                    close_rx,
                ));
                self.readers.insert(conn, Reader { close, task });
            }
            Effect::CloseTransport { conn } => {
                if let Some(reader) = self.readers.remove(&conn) {
                    // The reader closes the transport itself; a reader that
                    // already finished has nothing left to close.
                    let _ = reader.close.send(());
                }
                let _ = self.events_tx.send(ConnectionEvent::TransportClosed {
                    conn,
                    was_clean: true,
                });
            }
            Effect::ScheduleRetry { timer, delay } => {
                tracing::info!(timer, ?delay, "Scheduling reconnect");
                let events = self.events_tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(ConnectionEvent::RetryElapsed { timer });
                });
                if let Some(previous) = self.timers.insert(timer, handle) {
                    previous.abort();
                }
            }
            Effect::CancelRetry { timer } => {
                if let Some(handle) = self.timers.remove(&timer) {
                    tracing::debug!(timer, "Cancelled pending reconnect");
                    handle.abort();
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, reader) in self.readers.drain() {
            if reader.close.send(()).is_err() {
                reader.task.abort();
            }
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.state_tx.send_replace(ConnectionState::Idle);
        tracing::debug!("Connection driver stopped");
    }
}

/// Connect, then apply every decoded frame to the cache in arrival order
/// until the transport ends or the driver asks for a close.
async fn read_loop(
    conn: ConnId,
    connector: Arc<dyn Connector>,
    cache: Arc<CacheStore>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let connected = tokio::select! {
        biased;
        _ = &mut close_rx => return,
        result = connector.connect() => result,
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            let _ = events.send(ConnectionEvent::TransportError {
                conn,
                message: e.to_string(),
            });
            return;
        }
    };
    let _ = events.send(ConnectionEvent::TransportOpened { conn });

    loop {
        let incoming = tokio::select! {
            biased;
            _ = &mut close_rx => None,
            incoming = transport.recv() => Some(incoming),
        };
        let Some(incoming) = incoming else {
            transport.close().await;
            return;
        };

        let decoded = match incoming {
            Ok(Incoming::Text(text)) => protocol::decode(&text),
            Ok(Incoming::Binary(data)) => protocol::decode_bytes(&data),
            Ok(Incoming::Closed { was_clean }) => {
                let _ = events.send(ConnectionEvent::TransportClosed { conn, was_clean });
                return;
            }
            Err(e) => {
                let _ = events.send(ConnectionEvent::TransportError {
                    conn,
                    message: e.to_string(),
                });
                return;
            }
        };
        match decoded {
            Ok(notification) => {
                cache.apply(&notification);
            }
            Err(e) => tracing::warn!(conn, "Dropping realtime frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use livecrud_core::RecordId;

    use super::*;
    use crate::connection::{Transport, TransportError};

    type Script = mpsc::UnboundedReceiver<Result<Incoming, TransportError>>;
    type Server = mpsc::UnboundedSender<Result<Incoming, TransportError>>;

    struct FakeTransport {
        script: Script,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn recv(&mut self) -> Result<Incoming, TransportError> {
            self.script
                .recv()
                .await
                .unwrap_or(Ok(Incoming::Closed { was_clean: false }))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Each connect consumes one scripted outcome; `None` (or running out)
    /// refuses the connection.
    #[derive(Default)]
    struct FakeConnector {
        outcomes: Mutex<VecDeque<Option<Script>>>,
        attempts: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn new(outcomes: Vec<Option<Script>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcomes.lock().unwrap().pop_front().flatten();
            match outcome {
                Some(script) => Ok(Box::new(FakeTransport {
                    script,
                    closed: Arc::clone(&self.closed),
                })),
                None => Err(TransportError::Connect("refused".to_string())),
            }
        }
    }

    fn server() -> (Server, Option<Script>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Some(rx))
    }

    const FIVE: Duration = Duration::from_secs(5);

    fn manager(connector: &Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(
            connector.clone(),
            Arc::new(CacheStore::new()),
            ReconnectPolicy::Fixed { delay: FIVE },
        )
    }

    async fn wait_for(
        manager: &ConnectionManager,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = manager.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("driver stopped");
        *state
    }

    fn text(s: &str) -> Result<Incoming, TransportError> {
        Ok(Incoming::Text(s.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_only_on_demand() {
        let (_server, script) = server();
        let connector = FakeConnector::new(vec![script]);
        let manager = manager(&connector);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(manager.state(), ConnectionState::Idle);

        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;
        assert!(manager.is_connected());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_patch_cache_in_order() {
        let (server, script) = server();
        let connector = FakeConnector::new(vec![script]);
        let manager = manager(&connector);
        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;

        for frame in [
            r#"{"action":"created","shape":{"id":1,"name":"circle"}}"#,
            "garbage",
            r#"{"action":"created","shape":{"id":2,"name":"square"}}"#,
            r#"{"action":"updated","shape":{"id":1,"name":"oval"}}"#,
            r#"{"action":"deleted","shape_id":7}"#,
        ] {
            server.send(text(frame)).unwrap();
        }
        server.send(Ok(Incoming::Binary(vec![0xff, 0xfe]))).unwrap();
        server
            .send(Ok(Incoming::Binary(
                br#"{"action":"created","record":{"id":3,"name":"star"}}"#.to_vec(),
            )))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = manager.cache().snapshot();
        assert_eq!(
            snapshot.ids(),
            vec![RecordId::Int(3), RecordId::Int(2), RecordId::Int(1)]
        );
        assert_eq!(
            snapshot.get(&RecordId::Int(1)).unwrap().field("name"),
            Some(&serde_json::json!("oval"))
        );
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_retries_after_delay() {
        let (server, first) = server();
        let (_second_server, second) = self::server();
        let connector = FakeConnector::new(vec![first, second]);
        let manager = manager(&connector);
        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;

        drop(server);
        let state = wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(
            state,
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: FIVE
            }
        );

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(connector.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.attempts(), 2);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_while_reconnecting_cancels_retry() {
        let (server, script) = server();
        let connector = FakeConnector::new(vec![script]);
        let manager = manager(&connector);
        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;

        server.send(Err(TransportError::Io("reset".to_string()))).unwrap();
        wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(manager.last_error().as_deref(), Some("Transport error: reset"));

        manager.teardown();
        wait_for(&manager, |s| *s == ConnectionState::Idle).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_closes_transport() {
        let (_server, script) = server();
        let connector = FakeConnector::new(vec![script]);
        let manager = manager(&connector);
        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;

        manager.set_demand(false);
        wait_for(&manager, |s| *s == ConnectionState::Idle).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_skips_the_wait() {
        let (_server, script) = server();
        let connector = FakeConnector::new(vec![None, script]);
        let manager = manager(&connector);
        manager.set_demand(true);

        wait_for(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert!(manager.last_error().is_some());

        manager.reconnect();
        wait_for(&manager, |s| *s == ConnectionState::Open).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(manager.last_error(), None);

        // The cancelled timer never produces a third attempt.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_transport() {
        let (_server, script) = server();
        let connector = FakeConnector::new(vec![script]);
        let manager = manager(&connector);
        manager.set_demand(true);
        wait_for(&manager, |s| *s == ConnectionState::Open).await;

        manager.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }
}
