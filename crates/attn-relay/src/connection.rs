//! Per-relay connection lifecycle.
//!
//! A [`Connection`] is a handle to a driver task that exclusively owns the
//! socket, the [`AuthHandler`], the [`SubscriptionManager`], the
//! [`EventRouter`] and the [`ReconnectPolicy`] for one relay. Callers talk to
//! the task through a command channel and observe its state through a watch
//! channel.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──open──▶ [Authenticating ──▶] Ready
//!      ▲                        │                                      │
//!      │                   timeout/close/error                   close/error
//!      │                        ▼                                      ▼
//!      └────────disconnect──── Reconnecting ◀──────────────────────────┘
//! ```
//!
//! Every timer is a deadline stored in the phase that armed it (or in the auth
//! handler / reconnect policy it belongs to). Leaving the phase drops the
//! deadline, so no timer can fire after the state it was armed for is gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthHandler, AuthOutcome};
use crate::config::{ConnectionConfig, RelayEndpoint};
use crate::error::{Error, ErrorInfo, TransportError};
use crate::hooks::{Hook, HookEvent, HookRegistry, RelayConnectContext, RelayDisconnectContext};
use crate::message::RelayMessage;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::router::{EventRouter, SeenEvents};
use crate::subscription::SubscriptionManager;
use crate::transport::{Transport, TransportEvent, TransportHandle, CLOSE_NORMAL};

const DEFAULT_DISCONNECT_REASON: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Reconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Reconnecting)
                | (Connecting, Authenticating)
                | (Connecting, Ready)
                | (Connecting, Closing)
                | (Connecting, Disconnected)
                | (Authenticating, Ready)
                | (Authenticating, Closing)
                | (Authenticating, Disconnected)
                | (Ready, Closing)
                | (Ready, Disconnected)
                | (Closing, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }
}

/// Internal phase. Carries the connect deadline so it cannot outlive
/// `Connecting`.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Disconnected,
    Connecting { deadline: Instant },
    Authenticating,
    Ready,
    Closing,
    Reconnecting,
}

impl Phase {
    fn state(self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Authenticating => ConnectionState::Authenticating,
            Phase::Ready => ConnectionState::Ready,
            Phase::Closing => ConnectionState::Closing,
            Phase::Reconnecting => ConnectionState::Reconnecting,
        }
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Disconnect {
        reason: Option<String>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one relay's driver task. Clones share the task; it shuts down
/// once every clone is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    endpoint: RelayEndpoint,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { .. } => f.write_str("Connect"),
            Command::Disconnect { reason, .. } => {
                f.debug_struct("Disconnect").field("reason", reason).finish()
            }
        }
    }
}

impl Connection {
    /// Spawn the driver task. Must be called inside a tokio runtime.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>, hooks: HookRegistry) -> Self {
        Self::spawn(config, transport, hooks, None)
    }

    /// Like [`Connection::new`], dropping events whose id is already in `seen`.
    pub fn spawn(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        hooks: HookRegistry,
        seen: Option<Arc<SeenEvents>>,
    ) -> Self {
        let endpoint = config.endpoint.clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let dispatch = config.dispatch.clone();

        let driver = Driver::new(config, transport, hooks, seen, state_tx);
        match dispatch {
            Some(dispatch) => {
                tokio::spawn(driver.run(rx).with_subscriber(dispatch));
            }
            None => {
                tokio::spawn(driver.run(rx));
            }
        }

        Self {
            endpoint,
            commands,
            state,
        }
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn relay_url(&self) -> &str {
        self.endpoint.url()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Open, authenticate and subscribe. Resolves immediately when already
    /// ready; joins an attempt already in flight.
    pub async fn connect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| Error::SessionStopped)?;
        rx.await.map_err(|_| Error::SessionStopped)?
    }

    /// Tear down. Never fails; teardown errors go to the disconnect hook.
    pub async fn disconnect(&self, reason: Option<String>) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reason, reply })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

enum Step {
    Command(Command),
    Shutdown,
    Transport(Option<TransportEvent>),
    Deadline,
}

struct Driver {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    hooks: HookRegistry,
    socket: Option<TransportHandle>,
    phase: Phase,
    state_tx: watch::Sender<ConnectionState>,
    auth: AuthHandler,
    subscriptions: SubscriptionManager,
    router: EventRouter,
    reconnect: ReconnectPolicy,
    pending: Vec<oneshot::Sender<Result<(), Error>>>,
}

impl Driver {
    fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        hooks: HookRegistry,
        seen: Option<Arc<SeenEvents>>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let url = config.endpoint.url().to_string();
        let auth = AuthHandler::new(&url, config.signer.clone(), config.auth_timeout);
        let subscriptions = SubscriptionManager::new(
            url.clone(),
            config.filters.clone(),
            config.subscription_since,
            hooks.clone(),
        );
        let router = match seen {
            Some(seen) => EventRouter::new(url, hooks.clone()).with_dedup(seen),
            None => EventRouter::new(url, hooks.clone()),
        };
        let reconnect = ReconnectPolicy::new(
            config.auto_reconnect,
            config.reconnect_delay,
            config.max_reconnect_attempts,
        );

        Self {
            config,
            transport,
            hooks,
            socket: None,
            phase: Phase::Disconnected,
            state_tx,
            auth,
            subscriptions,
            router,
            reconnect,
            pending: Vec::new(),
        }
    }

    fn url(&self) -> &str {
        self.config.endpoint.url()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown,
                },
                event = next_socket_event(&mut self.socket) => Step::Transport(event),
                _ = sleep_until_deadline(deadline) => Step::Deadline,
            };

            match step {
                Step::Command(Command::Connect { reply }) => self.on_connect(reply),
                Step::Command(Command::Disconnect { reason, reply }) => {
                    self.disconnect(reason);
                    let _ = reply.send(());
                }
                Step::Shutdown => {
                    if self.socket.is_some() {
                        self.disconnect(Some("Connection dropped".to_string()));
                    }
                    debug!(relay_url = %self.url(), "Connection driver stopped");
                    break;
                }
                Step::Transport(Some(event)) => self.on_transport_event(event).await,
                Step::Transport(None) => self.socket = None,
                Step::Deadline => self.on_deadline(Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let phase_deadline = match self.phase {
            Phase::Connecting { deadline } => Some(deadline),
            Phase::Reconnecting => self.reconnect.pending(),
            _ => None,
        };
        phase_deadline.into_iter().chain(self.auth.deadline()).min()
    }

    fn transition(&mut self, next: Phase) -> bool {
        let from = self.phase.state();
        let to = next.state();
        if from != to && !from.can_transition_to(to) {
            warn!(relay_url = %self.url(), ?from, ?to, "Rejected invalid connection state transition");
            return false;
        }
        if matches!(self.phase, Phase::Reconnecting) && to != ConnectionState::Reconnecting {
            self.reconnect.cancel();
        }
        if matches!(
            to,
            ConnectionState::Disconnected | ConnectionState::Closing | ConnectionState::Reconnecting
        ) {
            self.auth.reset();
        }
        self.phase = next;
        self.state_tx.send_replace(to);
        true
    }

    fn on_connect(&mut self, reply: oneshot::Sender<Result<(), Error>>) {
        match self.phase {
            Phase::Ready if self.socket.as_ref().is_some_and(TransportHandle::is_open) => {
                let _ = reply.send(Ok(()));
            }
            Phase::Connecting { .. } | Phase::Authenticating => self.pending.push(reply),
            _ => {
                self.pending.push(reply);
                self.start_connect();
            }
        }
    }

    fn start_connect(&mut self) {
        if let Some(stale) = self.socket.take() {
            stale.close(None, None);
        }
        let deadline = Instant::now() + self.config.connection_timeout;
        if !self.transition(Phase::Connecting { deadline }) {
            self.fail_pending(Error::InvalidConfig(format!(
                "cannot connect while {:?}",
                self.phase.state()
            )));
            return;
        }
        info!(relay_url = %self.url(), "Connecting to relay");
        self.socket = Some(self.transport.open(self.config.endpoint.url()));
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(text) => self.on_message(&text).await,
            TransportEvent::Error(err) => self.on_transport_error(err),
            TransportEvent::Close { code, reason } => self.on_close(code, &reason),
        }
    }

    fn on_open(&mut self) {
        if !matches!(self.phase, Phase::Connecting { .. }) {
            debug!(relay_url = %self.url(), "Ignoring open outside of connect");
            return;
        }
        info!(relay_url = %self.url(), "Relay socket open");
        self.auth.reset();
        // Attempts reset on Ready, not on open.
        self.reconnect.cancel();

        if self.config.endpoint.requires_auth() {
            self.transition(Phase::Authenticating);
            self.auth.start_challenge_timeout();
        } else {
            self.auth.mark_authenticated();
            self.on_authenticated();
        }
    }

    fn on_authenticated(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if let Err(err) = self.subscriptions.subscribe_all(socket) {
            warn!(relay_url = %self.url(), error = %err, "Failed to send subscriptions");
            socket.close(None, None);
            self.fail_pending(err);
            return;
        }

        self.reconnect.reset();
        self.transition(Phase::Ready);
        info!(relay_url = %self.url(), "Relay ready");
        let context = RelayConnectContext {
            relay_url: self.url().to_string(),
        };
        self.hooks
            .emit(Hook::RelayConnect, &HookEvent::RelayConnect(context));
        for waiter in self.pending.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_message(&mut self, text: &str) {
        let message = RelayMessage::decode(text);
        let requires_auth = self.config.endpoint.requires_auth();

        match message {
            RelayMessage::Auth { challenge } if requires_auth => {
                let Some(socket) = self.socket.as_ref() else {
                    return;
                };
                debug!(relay_url = %self.url(), "Received AUTH challenge");
                if let Err(err) = self.auth.on_challenge(&challenge, socket).await {
                    self.on_auth_outcome(AuthOutcome::Failed(err));
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } if requires_auth => match self.auth.on_ok(&event_id, accepted, &message) {
                Some(outcome) => self.on_auth_outcome(outcome),
                None => debug!(relay_url = %self.url(), event_id = %event_id, "Ignoring OK for unknown event"),
            },
            RelayMessage::Notice { message } => {
                warn!(relay_url = %self.url(), notice = %message, "Relay notice");
            }
            _ if !matches!(self.phase, Phase::Ready) => {
                debug!(relay_url = %self.url(), frame = message.label(), "Ignoring frame before authentication");
            }
            RelayMessage::Event {
                subscription_id,
                event,
            } => match self.subscriptions.kind_of(&subscription_id) {
                Some(kind) => {
                    self.router.route(kind, event);
                }
                None => {
                    debug!(relay_url = %self.url(), subscription_id = %subscription_id, "Event for unknown subscription");
                }
            },
            RelayMessage::Eose { subscription_id } => {
                self.subscriptions.on_eose(&subscription_id);
            }
            other => {
                debug!(relay_url = %self.url(), frame = other.label(), "Ignoring frame");
            }
        }
    }

    fn on_auth_outcome(&mut self, outcome: AuthOutcome) {
        let authenticating = matches!(self.phase, Phase::Authenticating);
        match outcome {
            AuthOutcome::Authenticated | AuthOutcome::NotRequired if authenticating => {
                self.on_authenticated();
            }
            AuthOutcome::Authenticated | AuthOutcome::NotRequired => {}
            AuthOutcome::Failed(err) if authenticating => {
                warn!(relay_url = %self.url(), error = %err, "Authentication failed");
                if let Some(socket) = self.socket.take() {
                    socket.close(Some(CLOSE_NORMAL), Some("Authentication failed".to_string()));
                }
                self.transition(Phase::Disconnected);
                self.fail_pending(err);
                self.schedule_reconnect();
            }
            AuthOutcome::Failed(err) => {
                warn!(relay_url = %self.url(), error = %err, "Re-authentication failed");
            }
        }
    }

    fn on_transport_error(&mut self, err: TransportError) {
        let err = Error::from(err);
        warn!(relay_url = %self.url(), error = %err, "Relay transport error");
        if matches!(self.phase, Phase::Disconnected | Phase::Reconnecting) {
            return;
        }

        self.transition(Phase::Disconnected);
        self.emit_disconnect(err.to_string(), Some(ErrorInfo::from(&err)));
        self.fail_pending(err);
        self.schedule_reconnect();
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        self.socket = None;
        self.subscriptions.forget_all();
        let reason = format!(
            "Connection closed: code={code}, reason={}",
            if reason.is_empty() { "none" } else { reason }
        );
        info!(relay_url = %self.url(), %reason, "Relay connection closed");

        if matches!(self.phase, Phase::Disconnected | Phase::Reconnecting) {
            // The error path already scheduled (or gave up on) a reconnect.
            return;
        }

        let was_ready = matches!(self.phase, Phase::Ready);
        self.transition(Phase::Disconnected);
        if was_ready {
            self.emit_disconnect(reason.clone(), None);
        }
        self.fail_pending(Error::ConnectionClosed { reason });
        self.schedule_reconnect();
    }

    fn on_deadline(&mut self, now: Instant) {
        match self.phase {
            Phase::Connecting { deadline } if now >= deadline => {
                self.on_connect_timeout();
                return;
            }
            Phase::Reconnecting if self.reconnect.fire(now) => {
                info!(relay_url = %self.url(), attempt = self.reconnect.attempts(), "Reconnecting to relay");
                self.start_connect();
                return;
            }
            _ => {}
        }
        if let Some(outcome) = self.auth.on_deadline(now) {
            self.on_auth_outcome(outcome);
        }
    }

    fn on_connect_timeout(&mut self) {
        warn!(
            relay_url = %self.url(),
            timeout_ms = duration_ms(self.config.connection_timeout),
            "Connection timeout"
        );
        if let Some(socket) = self.socket.take() {
            socket.close(None, None);
        }
        self.transition(Phase::Disconnected);
        self.fail_pending(Error::ConnectionTimeout);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !matches!(self.phase, Phase::Disconnected | Phase::Reconnecting) {
            return;
        }
        match self.reconnect.schedule(Instant::now()) {
            ReconnectDecision::Scheduled { delay, attempt, .. } => {
                info!(
                    relay_url = %self.url(),
                    attempt,
                    delay_ms = duration_ms(delay),
                    "Scheduling reconnect"
                );
                self.transition(Phase::Reconnecting);
            }
            ReconnectDecision::Exhausted { attempts } => {
                error!(
                    relay_url = %self.url(),
                    attempts,
                    "Max reconnection attempts ({attempts}) reached for {}",
                    self.url()
                );
            }
            ReconnectDecision::Disabled | ReconnectDecision::AlreadyPending => {}
        }
    }

    fn disconnect(&mut self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| DEFAULT_DISCONNECT_REASON.to_string());
        let active = self.socket.is_some()
            || matches!(
                self.phase,
                Phase::Connecting { .. } | Phase::Authenticating | Phase::Ready
            );

        self.reconnect.cancel();
        self.auth.reset();

        let mut teardown_error = None;
        if let Some(socket) = self.socket.take() {
            if matches!(
                self.phase,
                Phase::Connecting { .. } | Phase::Authenticating | Phase::Ready
            ) {
                self.transition(Phase::Closing);
            }
            if socket.is_open() {
                if let Err(err) = self.subscriptions.close_all(&socket) {
                    teardown_error = Some(ErrorInfo::from(&err));
                }
            } else {
                self.subscriptions.forget_all();
            }
            socket.close(Some(CLOSE_NORMAL), Some(reason.clone()));
        }

        self.transition(Phase::Disconnected);
        self.fail_pending(Error::Disconnected(reason.clone()));
        if active {
            info!(relay_url = %self.url(), %reason, "Disconnected from relay");
            self.emit_disconnect(reason, teardown_error);
        }
    }

    fn emit_disconnect(&self, reason: String, error: Option<ErrorInfo>) {
        let context = RelayDisconnectContext {
            relay_url: self.url().to_string(),
            reason,
            error,
        };
        self.hooks
            .emit(Hook::RelayDisconnect, &HookEvent::RelayDisconnect(context));
    }

    fn fail_pending(&mut self, err: Error) {
        let mut waiters = std::mem::take(&mut self.pending);
        let Some(last) = waiters.pop() else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(Err(replicate(&err)));
        }
        let _ = last.send(Err(err));
    }
}

/// Copy of a connect failure for additional waiters on the same attempt.
fn replicate(err: &Error) -> Error {
    match err {
        Error::Transport(e) => Error::Transport(e.clone()),
        Error::ConnectionTimeout => Error::ConnectionTimeout,
        Error::ConnectionClosed { reason } => Error::ConnectionClosed {
            reason: reason.clone(),
        },
        Error::AuthRejected(reason) => Error::AuthRejected(reason.clone()),
        Error::AuthTimeout => Error::AuthTimeout,
        Error::Disconnected(reason) => Error::Disconnected(reason.clone()),
        Error::InvalidConfig(reason) => Error::InvalidConfig(reason.clone()),
        other => Error::Disconnected(other.to_string()),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn next_socket_event(socket: &mut Option<TransportHandle>) -> Option<TransportEvent> {
    match socket {
        Some(socket) => socket.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
