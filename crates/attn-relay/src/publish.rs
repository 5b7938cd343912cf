//! One-shot event publication.
//!
//! Each publish opens its own socket, optionally runs the NIP-42 handshake,
//! sends the EVENT and waits for the matching OK. Failures are reported in the
//! returned [`PublishResult`], never as an `Err`, so a fan-out to several
//! relays always yields one result per relay.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

use crate::auth::{AuthHandler, AuthOutcome};
use crate::config::PublishOptions;
use crate::error::Error;
use crate::events::{EventTemplate, SignedEvent};
use crate::message::{ClientMessage, RelayMessage};
use crate::signer::Signer;
use crate::transport::{Transport, TransportEvent, TransportHandle, CLOSE_NORMAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub event_id: String,
    pub relay_url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResults {
    pub event_id: String,
    pub results: Vec<PublishResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl PublishResults {
    fn from_results(event_id: &str, results: Vec<PublishResult>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        Self {
            event_id: event_id.to_string(),
            results,
            success_count,
            failure_count,
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("public_key", &self.signer.public_key())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Connecting { deadline: Instant },
    Authenticating,
    AwaitingOk { deadline: Instant },
}

impl Publisher {
    /// `signer` answers AUTH challenges; `transport` opens one socket per publish.
    pub fn new(transport: Arc<dyn Transport>, signer: Arc<dyn Signer>) -> Self {
        Self { transport, signer }
    }

    /// Sign `template` and publish it. Signing errors are returned before any
    /// relay is contacted.
    pub async fn sign_and_publish(
        &self,
        template: EventTemplate,
        relay_url: &str,
        options: &PublishOptions,
    ) -> Result<PublishResult, Error> {
        let event = self.signer.sign(template).await?;
        Ok(self.publish(&event, relay_url, options).await)
    }

    pub async fn publish(
        &self,
        event: &SignedEvent,
        relay_url: &str,
        options: &PublishOptions,
    ) -> PublishResult {
        let attempt = self.attempt(event, relay_url, options);
        let outcome = match options.dispatch.clone() {
            Some(dispatch) => attempt.with_subscriber(dispatch).await,
            None => attempt.await,
        };

        PublishResult {
            event_id: event.id.clone(),
            relay_url: relay_url.to_string(),
            success: outcome.is_ok(),
            error: outcome.err(),
        }
    }

    /// Publish to every relay concurrently. One relay failing never cancels
    /// the others; results keep the order of `relay_urls`.
    pub async fn publish_to_multiple(
        &self,
        event: &SignedEvent,
        relay_urls: &[String],
        options: &PublishOptions,
    ) -> PublishResults {
        let results = join_all(
            relay_urls
                .iter()
                .map(|url| self.publish(event, url, options)),
        )
        .await;

        let aggregate = PublishResults::from_results(&event.id, results);
        info!(
            event_id = %aggregate.event_id,
            success = aggregate.success_count,
            failed = aggregate.failure_count,
            "Published nostr event"
        );
        aggregate
    }

    async fn attempt(
        &self,
        event: &SignedEvent,
        relay_url: &str,
        options: &PublishOptions,
    ) -> Result<(), String> {
        let mut socket = self.transport.open(relay_url);
        let outcome = self.drive(&mut socket, event, relay_url, options).await;
        socket.close(Some(CLOSE_NORMAL), None);

        match &outcome {
            Ok(()) => debug!(relay_url, event_id = %event.id, "Relay accepted event"),
            Err(error) => warn!(relay_url, event_id = %event.id, %error, "Publish failed"),
        }
        outcome
    }

    async fn drive(
        &self,
        socket: &mut TransportHandle,
        event: &SignedEvent,
        relay_url: &str,
        options: &PublishOptions,
    ) -> Result<(), String> {
        let mut auth = AuthHandler::new(relay_url, self.signer.clone(), options.auth_timeout);
        let mut stage = Stage::Connecting {
            deadline: Instant::now() + options.timeout,
        };

        loop {
            let deadline = match stage {
                Stage::Connecting { deadline } | Stage::AwaitingOk { deadline } => Some(deadline),
                Stage::Authenticating => auth.deadline(),
            };

            let next = tokio::select! {
                next = socket.next_event() => next,
                _ = sleep_until_deadline(deadline) => {
                    match stage {
                        Stage::Connecting { .. } => {
                            return Err(Error::ConnectionTimeout.to_string());
                        }
                        Stage::AwaitingOk { .. } => {
                            return Err("Timeout waiting for relay response".to_string());
                        }
                        Stage::Authenticating => match auth.on_deadline(Instant::now()) {
                            Some(AuthOutcome::Failed(err)) => return Err(err.to_string()),
                            Some(_) => stage = send_event(socket, event, options)?,
                            None => {}
                        },
                    }
                    continue;
                }
            };

            let sent = matches!(stage, Stage::AwaitingOk { .. });
            match next {
                Some(TransportEvent::Open) => {
                    if options.requires_auth {
                        auth.start_challenge_timeout();
                        stage = Stage::Authenticating;
                    } else {
                        stage = send_event(socket, event, options)?;
                    }
                }
                Some(TransportEvent::Message(text)) => match RelayMessage::decode(&text) {
                    RelayMessage::Auth { challenge }
                        if options.requires_auth && matches!(stage, Stage::Authenticating) =>
                    {
                        auth.on_challenge(&challenge, socket)
                            .await
                            .map_err(|err| match err {
                                Error::Signer(err) => {
                                    format!("Failed to create authentication event: {err}")
                                }
                                other => other.to_string(),
                            })?;
                    }
                    RelayMessage::Ok {
                        event_id,
                        accepted,
                        message,
                    } => {
                        if matches!(stage, Stage::Authenticating) {
                            match auth.on_ok(&event_id, accepted, &message) {
                                Some(AuthOutcome::Failed(err)) => return Err(err.to_string()),
                                Some(_) => stage = send_event(socket, event, options)?,
                                None => {}
                            }
                        } else if sent && event_id == event.id {
                            if accepted {
                                return Ok(());
                            }
                            return Err(if message.is_empty() {
                                "Event rejected by relay".to_string()
                            } else {
                                message
                            });
                        }
                    }
                    RelayMessage::Notice { message } => {
                        warn!(relay_url, notice = %message, "Relay notice");
                    }
                    _ => {}
                },
                Some(TransportEvent::Error(err)) => return Err(err.to_string()),
                Some(TransportEvent::Close { .. }) | None => {
                    return Err(if sent {
                        "Connection closed before response".to_string()
                    } else {
                        "Connection closed before event was sent".to_string()
                    });
                }
            }
        }
    }
}

fn send_event(
    socket: &TransportHandle,
    event: &SignedEvent,
    options: &PublishOptions,
) -> Result<Stage, String> {
    let frame = ClientMessage::Event(event.clone())
        .to_json()
        .map_err(|err| err.to_string())?;
    socket.send(frame).map_err(|err| err.to_string())?;
    debug!(event_id = %event.id, "Sent EVENT");
    Ok(Stage::AwaitingOk {
        deadline: Instant::now() + options.timeout,
    })
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
