//! NIP-42 authentication state machine for one relay.
//!
//! The handler owns no task and no socket. It holds a single deadline (the
//! armed timer slot) that every phase transition overwrites, and the owner
//! drives it by sleeping until [`AuthHandler::deadline`] and then calling
//! [`AuthHandler::on_deadline`]. Outcomes are returned rather than delivered
//! through callbacks.
//!
//! ```text
//! Idle ─start_challenge_timeout─▶ AwaitingChallenge ─timeout─▶ AssumedNotRequired
//!                                        │
//!                                   on_challenge
//!                                        ▼
//!                                    Challenged ─OK true──▶ Authenticated
//!                                        ├──────OK false─▶ Rejected
//!                                        └──────timeout──▶ TimedOut
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::events::{unix_timestamp, EventTemplate, KIND_AUTH};
use crate::message::ClientMessage;
use crate::signer::Signer;
use crate::transport::TransportHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub challenge_received: bool,
    pub pending_auth_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    AwaitingChallenge,
    Challenged,
    Authenticated,
    AssumedNotRequired,
    Rejected(String),
    TimedOut,
}

#[derive(Debug)]
pub enum AuthOutcome {
    /// The relay accepted our AUTH event.
    Authenticated,
    /// No challenge arrived in time; treated as a relay without auth.
    NotRequired,
    Failed(Error),
}

pub struct AuthHandler {
    relay_url: String,
    signer: Arc<dyn Signer>,
    timeout: Duration,
    phase: AuthPhase,
    state: AuthState,
    deadline: Option<Instant>,
}

impl AuthHandler {
    pub fn new(relay_url: &str, signer: Arc<dyn Signer>, timeout: Duration) -> Self {
        Self {
            relay_url: normalize_relay_url(relay_url),
            signer,
            timeout,
            phase: AuthPhase::Idle,
            state: AuthState::default(),
            deadline: None,
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn phase(&self) -> &AuthPhase {
        &self.phase
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn transition(&mut self, phase: AuthPhase, deadline: Option<Instant>) {
        self.phase = phase;
        self.deadline = deadline;
    }

    /// Forget everything. Called on every new socket open.
    pub fn reset(&mut self) {
        self.state = AuthState::default();
        self.transition(AuthPhase::Idle, None);
    }

    /// For relays configured without auth.
    pub fn mark_authenticated(&mut self) {
        self.state.is_authenticated = true;
        self.transition(AuthPhase::Authenticated, None);
    }

    pub fn start_challenge_timeout(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.transition(AuthPhase::AwaitingChallenge, Some(deadline));
    }

    /// Sign and send the kind 22242 reply for `challenge`, then wait for its OK.
    pub async fn on_challenge(
        &mut self,
        challenge: &str,
        transport: &TransportHandle,
    ) -> Result<(), Error> {
        self.transition(AuthPhase::Challenged, None);
        self.state.challenge_received = true;
        self.state.pending_auth_event_id = None;

        let template = EventTemplate {
            kind: KIND_AUTH,
            created_at: unix_timestamp(),
            tags: vec![
                vec!["relay".to_string(), self.relay_url.clone()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            content: String::new(),
        };

        let signed = match self.signer.sign(template).await {
            Ok(signed) => signed,
            Err(err) => {
                self.transition(AuthPhase::Rejected(err.to_string()), None);
                return Err(err.into());
            }
        };
        let event_id = signed.id.clone();
        let frame = ClientMessage::Auth(signed).to_json()?;
        if let Err(err) = transport.send(frame) {
            self.transition(AuthPhase::Rejected(err.to_string()), None);
            return Err(err.into());
        }

        debug!(relay_url = %self.relay_url, event_id = %event_id, "Sent AUTH response");
        self.state.pending_auth_event_id = Some(event_id);
        let deadline = Instant::now() + self.timeout;
        self.transition(AuthPhase::Challenged, Some(deadline));
        Ok(())
    }

    /// Feed an OK frame. `None` means the OK was not for our auth event.
    pub fn on_ok(&mut self, event_id: &str, accepted: bool, message: &str) -> Option<AuthOutcome> {
        if self.state.pending_auth_event_id.as_deref() != Some(event_id) {
            return None;
        }
        self.state.pending_auth_event_id = None;

        if accepted {
            self.state.is_authenticated = true;
            self.transition(AuthPhase::Authenticated, None);
            info!(relay_url = %self.relay_url, "Authenticated with relay");
            Some(AuthOutcome::Authenticated)
        } else {
            let reason = if message.is_empty() {
                "Unknown reason".to_string()
            } else {
                message.to_string()
            };
            self.state.is_authenticated = false;
            self.transition(AuthPhase::Rejected(reason.clone()), None);
            warn!(relay_url = %self.relay_url, reason = %reason, "Authentication rejected");
            Some(AuthOutcome::Failed(Error::AuthRejected(reason)))
        }
    }

    /// Fire the armed timer if `now` has reached it.
    pub fn on_deadline(&mut self, now: Instant) -> Option<AuthOutcome> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }

        match self.phase {
            AuthPhase::AwaitingChallenge => {
                self.state.is_authenticated = true;
                self.transition(AuthPhase::AssumedNotRequired, None);
                info!(relay_url = %self.relay_url, "No AUTH challenge received, assuming relay does not require auth");
                Some(AuthOutcome::NotRequired)
            }
            AuthPhase::Challenged => {
                self.state.pending_auth_event_id = None;
                self.transition(AuthPhase::TimedOut, None);
                warn!(relay_url = %self.relay_url, "Authentication timed out");
                Some(AuthOutcome::Failed(Error::AuthTimeout))
            }
            _ => {
                self.deadline = None;
                None
            }
        }
    }
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandler")
            .field("relay_url", &self.relay_url)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .finish()
    }
}

/// Canonical relay identity for the `relay` tag: `scheme://host[:port]`.
/// Falls back to the trimmed input when it does not parse.
pub fn normalize_relay_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{}://{}:{}", parsed.scheme(), host, port),
        (Some(host), None) => format!("{}://{}", parsed.scheme(), host),
        _ => trimmed.to_string(),
    }
}
