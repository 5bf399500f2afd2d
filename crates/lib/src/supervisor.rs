//! Connection supervisor: owns the realtime transport lifecycle.
//!
//! The supervisor is the only writer of `ConnectionState`. It connects with a
//! bounded, capped-backoff attempt loop, registers the identity on every
//! successful connect, pumps pushed replies into the timeline, and applies a
//! single delayed supervised reconnect when the server drops the connection.
//! A generation counter guards every continuation so late callbacks cannot
//! mutate state after teardown.

use crate::config::ConnectionConfig;
use crate::identity::Identity;
use crate::session::SendError;
use crate::timeline::{parse_server_time, Message, TimelineStore};
use crate::transport::{ClientFrame, FrameSink, FrameStream, ServerFrame, TransportEvent, TransportFactory};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Connection health, observed read-only by everything but the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Events the supervisor surfaces to the orchestrator and display layer.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Online,
    Offline,
    /// A dispatcher reply was pushed and merged into the timeline. The display
    /// layer switches to the conversation view on this.
    ReplyPushed(Message),
    /// The backend acknowledged (or rejected) a sent message.
    SendAcked {
        success: bool,
        error: Option<String>,
    },
    /// Connect attempts are exhausted; waiting for an explicit retry.
    Failed(String),
}

/// Reconnection policy: bounded attempts with capped exponential backoff, plus
/// the delay for the one supervised reconnect after a server-initiated drop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_cap: Duration,
    pub server_drop_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.backoff_initial_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            server_drop_delay: Duration::from_millis(config.server_drop_delay_ms),
        }
    }

    /// Delay after the given 1-based failed attempt: initial doubling per
    /// attempt, never above the cap.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.backoff_cap)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// Owns the persistent connection for one session. Create, `start`, and on
/// explicit retry tear down and build a fresh one.
pub struct ConnectionSupervisor {
    user_id: Identity,
    url: String,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    timeline: TimelineStore,
    events: mpsc::Sender<SupervisorEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    generation: Arc<AtomicU64>,
    outbound_tx: mpsc::Sender<ClientFrame>,
    outbound_rx: Option<mpsc::Receiver<ClientFrame>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        user_id: Identity,
        url: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        timeline: TimelineStore,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        Self {
            user_id,
            url: url.into(),
            factory,
            policy,
            timeline,
            events,
            state_tx: Arc::new(state_tx),
            state_rx,
            generation: Arc::new(AtomicU64::new(0)),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            task: None,
        }
    }

    /// Watch handle for the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Spawn the connect/pump loop. Single use; a retry builds a new supervisor.
    pub fn start(&mut self) {
        let Some(outbound_rx) = self.outbound_rx.take() else {
            log::warn!("supervisor started twice, ignoring");
            return;
        };
        let ctx = RunCtx {
            user_id: self.user_id,
            url: self.url.clone(),
            factory: self.factory.clone(),
            policy: self.policy.clone(),
            timeline: self.timeline.clone(),
            events: self.events.clone(),
            state: self.state_tx.clone(),
            generation: self.generation.clone(),
            my_generation: self.generation.load(Ordering::SeqCst),
        };
        self.task = Some(tokio::spawn(run(ctx, outbound_rx)));
    }

    /// Queue a driver message for delivery. Rejected while not connected.
    pub async fn send_chat(&self, content: impl Into<String>) -> Result<(), SendError> {
        if *self.state_rx.borrow() != ConnectionState::Connected {
            return Err(SendError::Offline);
        }
        self.outbound_tx
            .send(ClientFrame::ChatMessage {
                user_id: self.user_id,
                content: content.into(),
            })
            .await
            .map_err(|_| SendError::Offline)
    }

    /// Tear down: invalidate the generation so late callbacks are no-ops, stop
    /// the loop, release the transport. No events are delivered afterwards.
    pub async fn shutdown(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }
}

struct RunCtx {
    user_id: Identity,
    url: String,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    timeline: TimelineStore,
    events: mpsc::Sender<SupervisorEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
}

impl RunCtx {
    fn alive(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }
}

enum PumpExit {
    /// The peer sent a close frame.
    ServerClosed,
    /// Local error or dropped stream.
    LocalClosed,
    /// The supervisor side went away.
    Teardown,
}

async fn run(ctx: RunCtx, mut outbound_rx: mpsc::Receiver<ClientFrame>) {
    loop {
        ctx.set_state(ConnectionState::Connecting);
        let (mut sink, mut stream) = match connect_with_backoff(&ctx).await {
            Ok(pair) => pair,
            Err(reason) => {
                if !ctx.alive() {
                    return;
                }
                ctx.set_state(ConnectionState::Error(reason.clone()));
                let _ = ctx.events.send(SupervisorEvent::Failed(reason)).await;
                return;
            }
        };
        if !ctx.alive() {
            sink.close().await;
            return;
        }
        // Register before anything else so the backend can route pushes here.
        if let Err(e) = sink
            .send(ClientFrame::Register {
                user_id: ctx.user_id,
            })
            .await
        {
            log::warn!("registration failed, reconnecting: {}", e);
            sink.close().await;
            continue;
        }
        ctx.set_state(ConnectionState::Connected);
        let _ = ctx.events.send(SupervisorEvent::Online).await;
        log::info!("connected and registered as user {}", ctx.user_id);

        let exit = pump(&ctx, sink.as_mut(), stream.as_mut(), &mut outbound_rx).await;
        if !ctx.alive() {
            sink.close().await;
            return;
        }
        match exit {
            PumpExit::Teardown => {
                sink.close().await;
                ctx.set_state(ConnectionState::Disconnected);
                return;
            }
            PumpExit::ServerClosed => {
                ctx.set_state(ConnectionState::Disconnected);
                let _ = ctx.events.send(SupervisorEvent::Offline).await;
                log::info!(
                    "server closed the connection, supervised reconnect in {:?}",
                    ctx.policy.server_drop_delay
                );
                tokio::time::sleep(ctx.policy.server_drop_delay).await;
                if !ctx.alive() {
                    return;
                }
            }
            PumpExit::LocalClosed => {
                ctx.set_state(ConnectionState::Disconnected);
                let _ = ctx.events.send(SupervisorEvent::Offline).await;
                log::info!("connection lost, reconnecting");
            }
        }
    }
}

/// Bounded connect loop with capped exponential backoff. Each attempt races
/// the handshake timeout; exhausting the attempts yields an actionable reason.
async fn connect_with_backoff(
    ctx: &RunCtx,
) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), String> {
    let mut attempt: u32 = 1;
    loop {
        if !ctx.alive() {
            return Err("session torn down".to_string());
        }
        let reason = match tokio::time::timeout(
            ctx.policy.connect_timeout,
            ctx.factory.connect(&ctx.url),
        )
        .await
        {
            Ok(Ok(pair)) => return Ok(pair),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "handshake timed out after {:?}",
                ctx.policy.connect_timeout
            ),
        };
        if attempt >= ctx.policy.max_attempts {
            return Err(format!("giving up after {} attempts: {}", attempt, reason));
        }
        let delay = ctx.policy.backoff_for(attempt);
        log::debug!(
            "connect attempt {}/{} failed ({}), retrying in {:?}",
            attempt,
            ctx.policy.max_attempts,
            reason,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Forward outbound frames and consume server events until the connection ends.
async fn pump(
    ctx: &RunCtx,
    sink: &mut dyn FrameSink,
    stream: &mut dyn FrameStream,
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
) -> PumpExit {
    loop {
        tokio::select! {
            maybe = outbound_rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::warn!("send failed, reconnecting: {}", e);
                        return PumpExit::LocalClosed;
                    }
                }
                None => return PumpExit::Teardown,
            },
            event = stream.next_event() => match event {
                TransportEvent::Frame(ServerFrame::Reply { reply, current_time }) => {
                    if !ctx.alive() {
                        return PumpExit::Teardown;
                    }
                    let at = match parse_server_time(&current_time) {
                        Ok(at) => at,
                        Err(e) => {
                            // Show the reply anyway; stamp it with the receive
                            // instant rather than dropping it.
                            log::warn!(
                                "reply with unparseable time {:?} ({}), using local receive time",
                                current_time,
                                e
                            );
                            chrono::Utc::now()
                        }
                    };
                    let message = Message::dispatcher(reply, at);
                    ctx.timeline.merge_in([message.clone()]).await;
                    let _ = ctx.events.send(SupervisorEvent::ReplyPushed(message)).await;
                }
                TransportEvent::Frame(ServerFrame::Ack { success, request, error, .. }) => {
                    if !ctx.alive() {
                        return PumpExit::Teardown;
                    }
                    if success {
                        log::debug!("send acknowledged: {:?}", request);
                    } else {
                        log::warn!("send rejected by backend: {:?}", error);
                    }
                    let _ = ctx.events.send(SupervisorEvent::SendAcked { success, error }).await;
                }
                TransportEvent::Closed { server_initiated, reason } => {
                    log::info!(
                        "transport closed (server_initiated: {}, reason: {:?})",
                        server_initiated,
                        reason
                    );
                    return if server_initiated {
                        PumpExit::ServerClosed
                    } else {
                        PumpExit::LocalClosed
                    };
                }
            }
        }
    }
}
