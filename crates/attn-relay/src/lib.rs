//! Nostr relay session engine for the ATTN attention marketplace.
//!
//! This crate keeps long-lived subscriptions open against a set of Nostr
//! relays, answers NIP-42 AUTH challenges, routes marketplace events to typed
//! hooks, and publishes signed events to one or many relays.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Session                               │
//! │                                                                  │
//! │   ┌──────────────┐   ┌──────────────┐        ┌──────────────┐    │
//! │   │ Connection A │   │ Connection B │  ...   │  Publisher   │    │
//! │   │ (driver task)│   │ (driver task)│        │  (one-shot)  │    │
//! │   └──────┬───────┘   └──────┬───────┘        └──────┬───────┘    │
//! │          │ owns             │                       │            │
//! │   Transport + AuthHandler + SubscriptionManager     │            │
//! │   + EventRouter + ReconnectPolicy                   │            │
//! │          │                  │                       │            │
//! │          └────────┬─────────┘                       │            │
//! │                   ▼                                 │            │
//! │             HookRegistry  (shared)                  │            │
//! └───────────────────┬─────────────────────────────────┼────────────┘
//!                     ▼                                 ▼
//!             application hooks                   Nostr relays
//! ```
//!
//! # Subscriptions
//!
//! | Id prefix | Kinds | Filter |
//! |-----------|-------|--------|
//! | `attn-blocks-` | 38088 | `authors` = node pubkeys |
//! | `attn-events-` | 38188..38988 | `#p` = marketplace/billboard/advertiser, `#d` = marketplace ids |
//! | `attn-standard-` | 0, 10002 | none |
//! | `attn-standard-...-nip51` | 30000 | `#d` = ATTN list identifiers |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use attn_relay::{Session, SessionConfig, WsTransport};
//!
//! let config = SessionConfig::from_env()?;
//! let mut session = Session::new(config, Arc::new(WsTransport))?;
//! session.hooks().on_new_block(|block| println!("block {}", block.block_height));
//! session.connect().await?;
//! ```
//!
//! # Logging
//!
//! Everything logs through `tracing`. Set [`ConnectionConfig::dispatch`] or
//! [`PublishOptions::dispatch`] to route one connection's logs to a specific
//! subscriber; `tracing::Dispatch::none()` silences it.

mod auth;
mod config;
mod connection;
mod error;
mod events;
mod hooks;
mod message;
mod publish;
mod reconnect;
mod router;
mod session;
mod signer;
mod subscription;
mod transport;

pub use auth::{normalize_relay_url, AuthHandler, AuthOutcome, AuthPhase, AuthState};
pub use config::{
    parse_list, ConnectionConfig, PublishOptions, RelayEndpoint, SessionConfig,
    SubscriptionFilters, DEFAULT_AUTH_TIMEOUT, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MULTI_PUBLISH_TIMEOUT, DEFAULT_PUBLISH_AUTH_TIMEOUT,
    DEFAULT_PUBLISH_TIMEOUT, DEFAULT_RECONNECT_DELAY,
};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, ErrorInfo, SignerError, TransportError};
pub use events::{
    parse_content, tag_value, tag_values, unix_timestamp, EventTemplate, ListType, SignedEvent,
    ATTN_EVENT_KINDS, KIND_ATTENTION, KIND_ATTENTION_CONFIRMATION,
    KIND_ATTENTION_PAYMENT_CONFIRMATION, KIND_AUTH, KIND_BILLBOARD, KIND_BILLBOARD_CONFIRMATION,
    KIND_BLOCK, KIND_MARKETPLACE, KIND_MARKETPLACE_CONFIRMATION, KIND_MATCH, KIND_NIP51_LIST,
    KIND_PROFILE, KIND_PROMOTION, KIND_RELAY_LIST, LIST_BLOCKED_PROMOTERS,
    LIST_BLOCKED_PROMOTIONS, LIST_TRUSTED_BILLBOARDS, LIST_TRUSTED_MARKETPLACES, NIP51_LIST_IDS,
};
pub use hooks::{
    BlockContext, EventContext, Hook, HookEvent, HookHandle, HookRegistry, MatchPublishedContext,
    RelayConnectContext, RelayDisconnectContext, SubscriptionContext, SubscriptionStatus, Topic,
};
pub use message::{ClientMessage, Filter, RelayMessage};
pub use publish::{PublishResult, PublishResults, Publisher};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use router::{topic_for_kind, EventRouter, RouteOutcome, SeenEvents};
pub use session::Session;
pub use signer::{KeysSigner, Signer};
pub use subscription::{SubscriptionIds, SubscriptionKind, SubscriptionManager};
pub use transport::{
    channel, ChannelTransport, OutboundFrame, ReadyState, Transport, TransportEvent,
    TransportHandle, TransportPeer, WsTransport, CLOSE_ABNORMAL, CLOSE_NORMAL,
};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
