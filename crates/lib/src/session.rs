//! Session orchestration: resolve → verify → load history → connect.
//!
//! The orchestrator sequences the session phases, short-circuits on fatal
//! failures (missing identity, unauthorized), degrades on recoverable ones
//! (history, connection), and owns the explicit retry path that re-runs
//! everything after identity resolution.

use crate::config::{self, Config};
use crate::history::{HistoryClient, HistoryError};
use crate::host::{NoticeKind, Notifier};
use crate::identity::{IdentityError, IdentitySource, LaunchUser};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, ReconnectPolicy, SupervisorEvent};
use crate::timeline::{Message, Timeline, TimelineStore};
use crate::transport::TransportFactory;
use crate::verify::{VerifyClient, VerifyError};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Which phase of the session failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("identity unavailable: {0}")]
    Identity(#[from] IdentityError),
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),
    #[error("history load failed: {0}")]
    History(#[from] HistoryError),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Local send rejection: empty text or no live connection. The message is not
/// appended to the timeline and nothing is queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message is empty")]
    Empty,
    #[error("not connected to dispatch")]
    Offline,
}

/// Coarse orchestration phase (the fine-grained connecting/online state lives
/// in `ConnectionState`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Loading,
    Verifying,
    LoadingHistory,
    Ready,
    Fatal(String),
}

/// Capabilities injected at construction. Core logic never reads ambient
/// globals, so everything here can be a fake in tests.
pub struct SessionDeps {
    pub config: Config,
    pub identity: Arc<dyn IdentitySource>,
    pub transports: Arc<dyn TransportFactory>,
    pub notifier: Arc<dyn Notifier>,
}

/// One driver-to-dispatch conversation session.
pub struct Session {
    user: LaunchUser,
    socket_url: String,
    verify: VerifyClient,
    history: HistoryClient,
    transports: Arc<dyn TransportFactory>,
    notifier: Arc<dyn Notifier>,
    policy: ReconnectPolicy,
    timeline: TimelineStore,
    supervisor: Option<ConnectionSupervisor>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: Option<mpsc::Receiver<SupervisorEvent>>,
    phase_tx: Arc<watch::Sender<SessionPhase>>,
    phase_rx: watch::Receiver<SessionPhase>,
    degraded: Arc<Mutex<Vec<SessionError>>>,
}

impl Session {
    /// Resolve identity and build the session. Identity failures are fatal and
    /// cannot be retried within a running instance.
    pub fn new(deps: SessionDeps) -> Result<Self, SessionError> {
        let user = deps.identity.resolve()?;
        log::info!("session identity resolved: {}", user.display_name());
        let backend_url = config::resolve_backend_url(&deps.config);
        let socket_url = config::resolve_socket_url(&deps.config, &backend_url);
        let verify = VerifyClient::new(&backend_url, deps.config.backend.verify_timeout());
        let history = HistoryClient::new(
            &backend_url,
            deps.config.backend.history_timeout(),
            deps.config.backend.history_limit,
        );
        let policy = ReconnectPolicy::from_config(&deps.config.connection);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Loading);
        Ok(Self {
            user,
            socket_url,
            verify,
            history,
            transports: deps.transports,
            notifier: deps.notifier,
            policy,
            timeline: TimelineStore::new(),
            supervisor: None,
            events_tx,
            events_rx: Some(events_rx),
            phase_tx: Arc::new(phase_tx),
            phase_rx,
            degraded: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Run verify → load history → connect. Unauthorized is fatal (the host is
    /// told to close the app); verification timeouts, history failures, and
    /// connect failures degrade the session but leave it functional.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        self.run_from_verify().await
    }

    /// Explicit user retry: tear down the connection and re-run every step
    /// after identity resolution.
    pub async fn retry(&mut self) -> Result<(), SessionError> {
        log::info!("explicit retry requested");
        if let Ok(mut g) = self.degraded.lock() {
            g.clear();
        }
        if let Some(mut old) = self.supervisor.take() {
            old.shutdown().await;
        }
        self.run_from_verify().await
    }

    async fn run_from_verify(&mut self) -> Result<(), SessionError> {
        self.set_phase(SessionPhase::Verifying);
        match self.verify.verify(self.user.id).await {
            Ok(()) => {}
            Err(VerifyError::Unauthorized(reason)) => {
                self.notifier
                    .notify(
                        NoticeKind::Error,
                        "You are not authorized to use dispatch messaging.",
                    )
                    .await;
                self.notifier.close_app().await;
                let err = VerifyError::Unauthorized(reason);
                self.set_phase(SessionPhase::Fatal(err.to_string()));
                return Err(SessionError::Verification(err));
            }
            Err(e) => {
                // Recoverable; do not block the connection attempt, and never
                // retry verification silently.
                log::warn!("verification did not complete: {}", e);
                self.notifier
                    .notify(
                        NoticeKind::Warning,
                        &format!("Could not verify with dispatch yet: {}", e),
                    )
                    .await;
                self.record_degraded(SessionError::Verification(e));
            }
        }

        self.set_phase(SessionPhase::LoadingHistory);
        match self.history.load(self.user.id).await {
            Ok(messages) => {
                let count = messages.len();
                self.timeline.merge_in(messages).await;
                log::info!("loaded {} prior message(s)", count);
            }
            Err(e) => {
                log::warn!("history load failed, continuing with empty history: {}", e);
                self.notifier
                    .notify(
                        NoticeKind::Warning,
                        "Could not load earlier messages. New messages will still arrive.",
                    )
                    .await;
                self.record_degraded(SessionError::History(e));
            }
        }

        let mut supervisor = ConnectionSupervisor::new(
            self.user.id,
            self.socket_url.clone(),
            self.transports.clone(),
            self.policy.clone(),
            self.timeline.clone(),
            self.events_tx.clone(),
        );
        supervisor.start();
        self.watch_connection_errors(supervisor.state());
        self.supervisor = Some(supervisor);
        self.set_phase(SessionPhase::Ready);
        Ok(())
    }

    /// Record connection failures as degraded state; the task ends when the
    /// supervisor it watches is torn down.
    fn watch_connection_errors(&self, mut state_rx: watch::Receiver<ConnectionState>) {
        let degraded = self.degraded.clone();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let reason = match &*state_rx.borrow_and_update() {
                    ConnectionState::Error(r) => Some(r.clone()),
                    _ => None,
                };
                if let Some(r) = reason {
                    if let Ok(mut g) = degraded.lock() {
                        g.push(SessionError::Connection(r));
                    }
                }
            }
        });
    }

    fn set_phase(&self, phase: SessionPhase) {
        let _ = self.phase_tx.send(phase);
    }

    fn record_degraded(&self, err: SessionError) {
        if let Ok(mut g) = self.degraded.lock() {
            g.push(err);
        }
    }

    pub fn user(&self) -> &LaunchUser {
        &self.user
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    /// Connection state of the current supervisor. Re-acquire after `retry`,
    /// which builds a fresh connection.
    pub fn connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.supervisor.as_ref().map(|s| s.state())
    }

    pub fn is_online(&self) -> bool {
        self.supervisor
            .as_ref()
            .map(|s| *s.state().borrow() == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// Recoverable failures accumulated since the last (re)start.
    pub fn degraded(&self) -> Vec<String> {
        self.degraded
            .lock()
            .map(|g| g.iter().map(|e| e.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn timeline(&self) -> TimelineStore {
        self.timeline.clone()
    }

    pub async fn snapshot(&self) -> Timeline {
        self.timeline.snapshot().await
    }

    /// Supervisor event stream for the display layer. Yields `None` on the
    /// second call; the stream survives `retry` (the new supervisor feeds the
    /// same channel).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SupervisorEvent>> {
        self.events_rx.take()
    }

    /// Send a driver message: reject empty text and offline sends, otherwise
    /// emit over the transport and append the optimistic message with the
    /// local send time.
    pub async fn send_message(&self, text: &str) -> Result<Message, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }
        let supervisor = self.supervisor.as_ref().ok_or(SendError::Offline)?;
        supervisor.send_chat(text).await?;
        let message = Message::driver(text, Utc::now());
        self.timeline.merge_in([message.clone()]).await;
        Ok(message)
    }

    /// End the session: stop the supervisor and release the transport.
    pub async fn shutdown(&mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.shutdown().await;
        }
    }
}
