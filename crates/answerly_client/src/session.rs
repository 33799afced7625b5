//! Query session: state machine, reset, and the driver task that owns it.
//!
//! A [`Session`] is plain owned state. [`SessionHandle::spawn`] moves it into
//! a single task that applies [`SessionEvent`]s one at a time, in arrival
//! order, and publishes a [`SessionSnapshot`] after each one.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accumulator::ResponseAccumulator;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, Connector, WsConnector};
use crate::messages::{Citation, QueryMessage};
use crate::router::{self, Routed};

/// Wait between tearing down the old channel and opening a fresh one.
pub const RESET_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    #[default]
    Idle,
    AwaitingResults,
    StreamingAnswer,
}

/// Why a submission was not accepted. No state changes when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("query is empty")]
    EmptyQuery,
    #[error("not connected to the answer service")]
    NotConnected,
    #[error("session has shut down")]
    SessionClosed,
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub query_state: QueryState,
    pub current_query: String,
    pub citations: Vec<Citation>,
    pub answer_text: String,
    /// True while the query is still waiting for its first answer text.
    pub is_loading: bool,
}

/// Everything the driver reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Connection(ConnectionEvent),
    ResetReconnectDue { generation: u64 },
    Submit {
        text: String,
        follow_up: bool,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    Reset { reply: oneshot::Sender<()> },
    Shutdown,
}

impl From<ConnectionEvent> for SessionEvent {
    fn from(event: ConnectionEvent) -> Self {
        SessionEvent::Connection(event)
    }
}

/// One user-visible conversation.
pub struct Session {
    connection: ConnectionManager<SessionEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    query_state: QueryState,
    current_query: String,
    accumulator: ResponseAccumulator,
    reset_generation: u64,
    reset_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the query state, title or accumulator changes.
    revision: u64,
}

impl Session {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(url, connector, events.clone()),
            events,
            query_state: QueryState::Idle,
            current_query: String::new(),
            accumulator: ResponseAccumulator::new(),
            reset_generation: 0,
            reset_timer: None,
            revision: 0,
        }
    }

    pub fn connect(&mut self) {
        self.connection.connect();
    }

    pub fn submit_query(&mut self, text: &str) -> Result<(), SubmitError> {
        self.submit(text, false)
    }

    /// Same as [`submit_query`](Self::submit_query); the follow-up text also
    /// becomes the display title. No earlier turn is carried over.
    pub fn submit_follow_up(&mut self, text: &str) -> Result<(), SubmitError> {
        self.submit(text, true)
    }

    fn submit(&mut self, text: &str, follow_up: bool) -> Result<(), SubmitError> {
        if text.trim().is_empty() {
            debug!("empty query rejected");
            return Err(SubmitError::EmptyQuery);
        }
        if self.connection.state() == ConnectionState::Disconnected {
            warn!("query rejected: no channel");
            return Err(SubmitError::NotConnected);
        }

        self.query_state = QueryState::AwaitingResults;
        self.accumulator.reset_for_new_query();
        self.current_query = text.to_string();
        self.revision += 1;
        info!(follow_up, query = %text, "query submitted");

        // A dropped send leaves the query awaiting; the user resubmits or resets.
        if let Err(error) = self.connection.send(&QueryMessage::new(text)) {
            warn!(%error, "query not sent");
        }
        Ok(())
    }

    /// Start over: close the channel, clear the answer, reconnect shortly after.
    pub fn reset_session(&mut self) {
        self.connection.teardown();
        self.current_query.clear();
        self.accumulator.reset_for_new_query();
        self.query_state = QueryState::Idle;
        self.revision += 1;

        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
        self.reset_generation += 1;
        let generation = self.reset_generation;
        let events = self.events.clone();
        self.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(RESET_DELAY).await;
            let _ = events.send(SessionEvent::ResetReconnectDue { generation });
        }));
        info!("session reset");
    }

    /// Apply a report from the channel task or the reconnect timer.
    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if let Some(frame) = self.connection.handle_event(event) {
            self.on_frame(&frame);
        }
    }

    /// The reset delay has passed. Only the latest reset reconnects.
    pub fn handle_reset_reconnect(&mut self, generation: u64) {
        if generation == self.reset_generation {
            self.reset_timer = None;
            self.connection.connect();
        }
    }

    fn on_frame(&mut self, frame: &str) {
        match router::route(frame, &mut self.accumulator) {
            Ok(Routed::Text) => {
                if self.query_state == QueryState::AwaitingResults {
                    debug!("first answer text; streaming");
                    self.query_state = QueryState::StreamingAnswer;
                }
                self.revision += 1;
            }
            Ok(Routed::Citations) => {
                debug!(count = self.accumulator.citations().len(), "citations replaced");
                self.revision += 1;
            }
            Err(error) => warn!(%error, "dropping malformed frame"),
        }
    }

    /// Changes whenever [`snapshot`](Self::snapshot) would. Cheap to compare.
    pub fn version(&self) -> (u64, ConnectionState) {
        (self.revision, self.connection.state())
    }

    pub fn shutdown(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
        self.connection.teardown();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection.state(),
            query_state: self.query_state,
            current_query: self.current_query.clone(),
            citations: self.accumulator.citations().to_vec(),
            answer_text: self.accumulator.answer_text().to_string(),
            is_loading: self.query_state == QueryState::AwaitingResults,
        }
    }
}

/// Handle to a running session. Dropping it shuts the session down.
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start a session against a WebSocket endpoint (e.g. `ws://localhost:8000/ws/chat`).
    pub fn spawn(url: impl Into<String>) -> Self {
        Self::with_connector(url, Arc::new(WsConnector))
    }

    pub fn with_connector(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(url, connector, events_tx.clone());
        session.connect();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let task = tokio::spawn(drive(session, events_rx, snapshot_tx));
        Self {
            events: events_tx,
            snapshots: snapshot_rx,
            task: Some(task),
        }
    }

    pub async fn submit_query(&self, text: impl Into<String>) -> Result<(), SubmitError> {
        self.submit(text.into(), false).await
    }

    pub async fn submit_follow_up(&self, text: impl Into<String>) -> Result<(), SubmitError> {
        self.submit(text.into(), true).await
    }

    async fn submit(&self, text: String, follow_up: bool) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::Submit { text, follow_up, reply })
            .map_err(|_| SubmitError::SessionClosed)?;
        rx.await.map_err(|_| SubmitError::SessionClosed)?
    }

    pub async fn reset_session(&self) {
        let (reply, rx) = oneshot::channel();
        if self.events.send(SessionEvent::Reset { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Close the channel and wait for the driver to finish.
    pub async fn shutdown(mut self) {
        let _ = self.events.send(SessionEvent::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::Shutdown);
    }
}

async fn drive(
    mut session: Session,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
) {
    let mut published = session.version();
    // Snapshots are only rebuilt when the session actually changed.
    let mut publish = |session: &Session| {
        let version = session.version();
        if version != published {
            published = version;
            snapshots.send_replace(session.snapshot());
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            // Publish before replying so callers observe the applied command.
            SessionEvent::Submit { text, follow_up, reply } => {
                let result = session.submit(&text, follow_up);
                publish(&session);
                let _ = reply.send(result);
            }
            SessionEvent::Reset { reply } => {
                session.reset_session();
                publish(&session);
                let _ = reply.send(());
            }
            SessionEvent::Shutdown => break,
            SessionEvent::Connection(event) => {
                session.handle_connection_event(event);
                publish(&session);
            }
            SessionEvent::ResetReconnectDue { generation } => {
                session.handle_reset_reconnect(generation);
                publish(&session);
            }
        }
    }
    session.shutdown();
    publish(&session);
    info!("session closed");
}
