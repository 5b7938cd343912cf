//! Typed notification registry.
//!
//! Application code registers listeners against a [`Hook`]; connections emit
//! [`HookEvent`] payloads into the shared [`HookRegistry`]. Dispatch walks a
//! snapshot of the listeners in registration order, so a listener that
//! unregisters itself (or registers another) mid-dispatch does not disturb the
//! current emit. A panicking listener is caught and logged; the remaining
//! listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::error;

use crate::error::ErrorInfo;
use crate::events::{ListType, SignedEvent};
use crate::message::Filter;

/// Routable event families. Each has `Before`/`On`/`After` stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Block,
    Marketplace,
    Billboard,
    Promotion,
    Attention,
    BillboardConfirmation,
    AttentionConfirmation,
    MarketplaceConfirmation,
    AttentionPaymentConfirmation,
    Match,
    Profile,
    RelayList,
    Nip51List,
}

impl Topic {
    /// Topics whose payload is an [`EventContext`].
    pub const EVENTS: [Topic; 12] = [
        Topic::Marketplace,
        Topic::Billboard,
        Topic::Promotion,
        Topic::Attention,
        Topic::BillboardConfirmation,
        Topic::AttentionConfirmation,
        Topic::MarketplaceConfirmation,
        Topic::AttentionPaymentConfirmation,
        Topic::Match,
        Topic::Profile,
        Topic::RelayList,
        Topic::Nip51List,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    RelayConnect,
    RelayDisconnect,
    Subscription,
    MatchPublished,
    Before(Topic),
    On(Topic),
    After(Topic),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConnectContext {
    pub relay_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDisconnectContext {
    pub relay_url: String,
    pub reason: String,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// REQ sent.
    Subscribed,
    /// EOSE received.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionContext {
    pub relay_url: String,
    pub subscription_id: String,
    pub filter: Filter,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockContext {
    pub relay_url: String,
    pub block_height: u64,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
    pub data: Value,
    pub event: SignedEvent,
}

/// Payload for every application and standard event topic.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub relay_url: String,
    pub topic: Topic,
    pub event_id: String,
    pub pubkey: String,
    /// Content parsed as JSON, or the raw string.
    pub data: Value,
    /// Height from the `t` tag, when present.
    pub block_height: Option<u64>,
    /// Set for NIP-51 list events only.
    pub list_type: Option<ListType>,
    pub event: SignedEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchPublishedContext {
    pub relay_url: String,
    pub match_event_id: String,
    pub promotion_coordinate: Option<String>,
    pub attention_coordinate: Option<String>,
    pub data: Value,
    pub block_height: Option<u64>,
    pub event: SignedEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    RelayConnect(RelayConnectContext),
    RelayDisconnect(RelayDisconnectContext),
    Subscription(SubscriptionContext),
    Block(BlockContext),
    Event(EventContext),
    MatchPublished(MatchPublishedContext),
}

pub type Listener = Arc<dyn Fn(&HookEvent) + Send + Sync>;

struct Entry {
    id: u64,
    hook: Hook,
    listener: Listener,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Shared, cheaply cloneable listener registry.
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<Mutex<Listeners>>,
}

/// Returned by [`HookRegistry::register`]; drop it to keep the listener.
#[derive(Debug)]
pub struct HookHandle {
    id: u64,
    hook: Hook,
    registry: Weak<Mutex<Listeners>>,
}

impl HookHandle {
    pub fn hook(&self) -> Hook {
        self.hook
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unregister(self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut listeners = lock(&inner);
        let before = listeners.entries.len();
        listeners.entries.retain(|entry| entry.id != self.id);
        listeners.entries.len() != before
    }
}

fn lock(inner: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, hook: Hook, listener: F) -> HookHandle
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push(Entry {
            id,
            hook,
            listener: Arc::new(listener),
        });
        HookHandle {
            id,
            hook,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn has_handlers(&self, hook: Hook) -> bool {
        self.handler_count(hook) > 0
    }

    pub fn handler_count(&self, hook: Hook) -> usize {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|entry| entry.hook == hook)
            .count()
    }

    pub fn clear(&self, hook: Hook) {
        lock(&self.inner).entries.retain(|entry| entry.hook != hook);
    }

    pub fn clear_all(&self) {
        lock(&self.inner).entries.clear();
    }

    /// Run every listener for `hook`. Returns how many completed without
    /// panicking.
    pub fn emit(&self, hook: Hook, event: &HookEvent) -> usize {
        let snapshot: Vec<Listener> = lock(&self.inner)
            .entries
            .iter()
            .filter(|entry| entry.hook == hook)
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        let mut completed = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(?hook, error = %message, "Hook listener panicked");
                }
            }
        }
        completed
    }

    /// Emit `Before` (if anyone listens), `On`, then `After` (if anyone
    /// listens) for a topic, sharing one payload.
    pub fn emit_lifecycle(&self, topic: Topic, event: &HookEvent) {
        if self.has_handlers(Hook::Before(topic)) {
            self.emit(Hook::Before(topic), event);
        }
        self.emit(Hook::On(topic), event);
        if self.has_handlers(Hook::After(topic)) {
            self.emit(Hook::After(topic), event);
        }
    }

    pub fn on_relay_connect<F>(&self, f: F) -> HookHandle
    where
        F: Fn(&RelayConnectContext) + Send + Sync + 'static,
    {
        self.register(Hook::RelayConnect, move |event| {
            if let HookEvent::RelayConnect(ctx) = event {
                f(ctx)
            }
        })
    }

    pub fn on_relay_disconnect<F>(&self, f: F) -> HookHandle
    where
        F: Fn(&RelayDisconnectContext) + Send + Sync + 'static,
    {
        self.register(Hook::RelayDisconnect, move |event| {
            if let HookEvent::RelayDisconnect(ctx) = event {
                f(ctx)
            }
        })
    }

    pub fn on_subscription<F>(&self, f: F) -> HookHandle
    where
        F: Fn(&SubscriptionContext) + Send + Sync + 'static,
    {
        self.register(Hook::Subscription, move |event| {
            if let HookEvent::Subscription(ctx) = event {
                f(ctx)
            }
        })
    }

    pub fn on_new_block<F>(&self, f: F) -> HookHandle
    where
        F: Fn(&BlockContext) + Send + Sync + 'static,
    {
        self.register(Hook::On(Topic::Block), move |event| {
            if let HookEvent::Block(ctx) = event {
                f(ctx)
            }
        })
    }

    /// Listen to the `On` stage of an event topic.
    pub fn on_event<F>(&self, topic: Topic, f: F) -> HookHandle
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        self.register(Hook::On(topic), move |event| {
            if let HookEvent::Event(ctx) = event {
                f(ctx)
            }
        })
    }

    pub fn on_match_published<F>(&self, f: F) -> HookHandle
    where
        F: Fn(&MatchPublishedContext) + Send + Sync + 'static,
    {
        self.register(Hook::MatchPublished, move |event| {
            if let HookEvent::MatchPublished(ctx) = event {
                f(ctx)
            }
        })
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("listeners", &lock(&self.inner).entries.len())
            .finish()
    }
}
