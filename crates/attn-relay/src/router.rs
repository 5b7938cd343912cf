//! Inbound EVENT routing.
//!
//! The subscription an event arrived on picks the handling path (blocks,
//! marketplace events, standard events); the event kind then picks the topic
//! whose `Before`/`On`/`After` hooks fire.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{
    parse_content, tag_values, ListType, SignedEvent, ATTN_EVENT_KINDS, KIND_ATTENTION,
    KIND_ATTENTION_CONFIRMATION, KIND_ATTENTION_PAYMENT_CONFIRMATION, KIND_BILLBOARD,
    KIND_BILLBOARD_CONFIRMATION, KIND_BLOCK, KIND_MARKETPLACE, KIND_MARKETPLACE_CONFIRMATION,
    KIND_MATCH, KIND_NIP51_LIST, KIND_PROFILE, KIND_PROMOTION, KIND_RELAY_LIST,
};
use crate::hooks::{
    BlockContext, EventContext, Hook, HookEvent, HookRegistry, MatchPublishedContext, Topic,
};
use crate::subscription::SubscriptionKind;

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Bounded set of event ids already routed, shared across relays.
#[derive(Debug)]
pub struct SeenEvents {
    capacity: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record `id`; false if it was already present.
    pub fn insert(&self, id: &str) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let (set, order) = &mut *guard;
        if set.contains(id) {
            return false;
        }
        if order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        set.insert(id.to_string());
        order.push_back(id.to_string());
        true
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed(Topic),
    Duplicate,
    /// Event reached a handler but was invalid or of an unexpected kind.
    Dropped(String),
}

pub fn topic_for_kind(kind: u16) -> Option<Topic> {
    Some(match kind {
        KIND_BLOCK => Topic::Block,
        KIND_MARKETPLACE => Topic::Marketplace,
        KIND_BILLBOARD => Topic::Billboard,
        KIND_PROMOTION => Topic::Promotion,
        KIND_ATTENTION => Topic::Attention,
        KIND_BILLBOARD_CONFIRMATION => Topic::BillboardConfirmation,
        KIND_ATTENTION_CONFIRMATION => Topic::AttentionConfirmation,
        KIND_MARKETPLACE_CONFIRMATION => Topic::MarketplaceConfirmation,
        KIND_ATTENTION_PAYMENT_CONFIRMATION => Topic::AttentionPaymentConfirmation,
        KIND_MATCH => Topic::Match,
        KIND_PROFILE => Topic::Profile,
        KIND_RELAY_LIST => Topic::RelayList,
        KIND_NIP51_LIST => Topic::Nip51List,
        _ => return None,
    })
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    relay_url: String,
    hooks: HookRegistry,
    seen: Option<Arc<SeenEvents>>,
}

impl EventRouter {
    pub fn new(relay_url: impl Into<String>, hooks: HookRegistry) -> Self {
        Self {
            relay_url: relay_url.into(),
            hooks,
            seen: None,
        }
    }

    pub fn with_dedup(mut self, seen: Arc<SeenEvents>) -> Self {
        self.seen = Some(seen);
        self
    }

    pub fn route(&self, via: SubscriptionKind, event: SignedEvent) -> RouteOutcome {
        if let Some(seen) = &self.seen {
            if !seen.insert(&event.id) {
                debug!(relay_url = %self.relay_url, event_id = %event.id, "Duplicate event dropped");
                return RouteOutcome::Duplicate;
            }
        }

        match via {
            SubscriptionKind::Blocks => self.handle_block(event),
            SubscriptionKind::Events => self.handle_attn_event(event),
            SubscriptionKind::Standard | SubscriptionKind::Lists => self.handle_standard_event(event),
        }
    }

    fn dropped(&self, event: &SignedEvent, reason: &str) -> RouteOutcome {
        warn!(
            relay_url = %self.relay_url,
            event_id = %event.id,
            kind = event.kind,
            reason,
            "Event dropped"
        );
        RouteOutcome::Dropped(reason.to_string())
    }

    fn handle_block(&self, event: SignedEvent) -> RouteOutcome {
        if event.kind != KIND_BLOCK {
            return self.dropped(&event, "unexpected kind on block subscription");
        }
        let data = parse_content(&event.content);
        let height = match data.get("height") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .or_else(|| event.block_height())
        .filter(|h| *h > 0);

        let Some(block_height) = height else {
            return self.dropped(&event, "missing or invalid block height");
        };

        let context = BlockContext {
            relay_url: self.relay_url.clone(),
            block_height,
            block_hash: data.get("hash").and_then(Value::as_str).map(String::from),
            block_time: data.get("time").and_then(Value::as_u64),
            data,
            event,
        };
        self.hooks
            .emit_lifecycle(Topic::Block, &HookEvent::Block(context));
        RouteOutcome::Routed(Topic::Block)
    }

    fn handle_attn_event(&self, event: SignedEvent) -> RouteOutcome {
        match topic_for_kind(event.kind) {
            Some(Topic::Match) => {
                self.emit_event(Topic::Match, event.clone(), None);
                self.emit_match_published(event);
                RouteOutcome::Routed(Topic::Match)
            }
            Some(topic) if ATTN_EVENT_KINDS.contains(&event.kind) => {
                self.emit_event(topic, event, None);
                RouteOutcome::Routed(topic)
            }
            _ => self.dropped(&event, "unknown marketplace event kind"),
        }
    }

    fn handle_standard_event(&self, event: SignedEvent) -> RouteOutcome {
        match event.kind {
            KIND_PROFILE => {
                self.emit_event(Topic::Profile, event, None);
                RouteOutcome::Routed(Topic::Profile)
            }
            KIND_RELAY_LIST => {
                self.emit_event(Topic::RelayList, event, None);
                RouteOutcome::Routed(Topic::RelayList)
            }
            KIND_NIP51_LIST => {
                let list_type = ListType::from_identifier(event.tag_value("d").unwrap_or_default());
                self.emit_event(Topic::Nip51List, event, Some(list_type));
                RouteOutcome::Routed(Topic::Nip51List)
            }
            _ => self.dropped(&event, "unknown standard event kind"),
        }
    }

    fn emit_event(&self, topic: Topic, event: SignedEvent, list_type: Option<ListType>) {
        let context = EventContext {
            relay_url: self.relay_url.clone(),
            topic,
            event_id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            data: parse_content(&event.content),
            block_height: event.block_height(),
            list_type,
            event,
        };
        self.hooks.emit_lifecycle(topic, &HookEvent::Event(context));
    }

    fn emit_match_published(&self, event: SignedEvent) {
        let promotion_prefix = format!("{KIND_PROMOTION}:");
        let attention_prefix = format!("{KIND_ATTENTION}:");
        let mut promotion_coordinate = None;
        let mut attention_coordinate = None;
        for coordinate in tag_values(&event.tags, "a") {
            if coordinate.starts_with(&promotion_prefix) {
                promotion_coordinate = Some(coordinate.to_string());
            } else if coordinate.starts_with(&attention_prefix) {
                attention_coordinate = Some(coordinate.to_string());
            }
        }

        let context = MatchPublishedContext {
            relay_url: self.relay_url.clone(),
            match_event_id: event.id.clone(),
            promotion_coordinate,
            attention_coordinate,
            data: parse_content(&event.content),
            block_height: event.block_height(),
            event,
        };
        self.hooks
            .emit(Hook::MatchPublished, &HookEvent::MatchPublished(context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LIST_BLOCKED_PROMOTIONS;

    fn event(id: &str, kind: u16, content: &str, tags: Vec<Vec<&str>>) -> SignedEvent {
        SignedEvent {
            id: id.to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: content.to_string(),
            sig: "sig".to_string(),
        }
    }

    fn recorder(hooks: &HookRegistry, hook: Hook) -> Arc<Mutex<Vec<HookEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hooks.register(hook, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_block_height_from_content() {
        let hooks = HookRegistry::new();
        let blocks = recorder(&hooks, Hook::On(Topic::Block));
        let router = EventRouter::new("ws://relay", hooks);

        let outcome = router.route(
            SubscriptionKind::Blocks,
            event("b1", KIND_BLOCK, r#"{"height":"870000","hash":"00ab","time":1700}"#, vec![]),
        );
        assert_eq!(outcome, RouteOutcome::Routed(Topic::Block));

        let blocks = blocks.lock().unwrap();
        match &blocks[0] {
            HookEvent::Block(ctx) => {
                assert_eq!(ctx.block_height, 870000);
                assert_eq!(ctx.block_hash.as_deref(), Some("00ab"));
                assert_eq!(ctx.block_time, Some(1700));
            }
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn test_block_height_falls_back_to_t_tag_and_drops_invalid() {
        let hooks = HookRegistry::new();
        let blocks = recorder(&hooks, Hook::On(Topic::Block));
        let router = EventRouter::new("ws://relay", hooks);

        let via_tag = router.route(
            SubscriptionKind::Blocks,
            event("b1", KIND_BLOCK, "{}", vec![vec!["t", "12"]]),
        );
        assert_eq!(via_tag, RouteOutcome::Routed(Topic::Block));

        let invalid = router.route(
            SubscriptionKind::Blocks,
            event("b2", KIND_BLOCK, r#"{"height":"tip"}"#, vec![]),
        );
        assert!(matches!(invalid, RouteOutcome::Dropped(_)));
        assert_eq!(blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_match_emits_new_match_and_match_published() {
        let hooks = HookRegistry::new();
        let matches = recorder(&hooks, Hook::On(Topic::Match));
        let published = recorder(&hooks, Hook::MatchPublished);
        let router = EventRouter::new("ws://relay", hooks);

        router.route(
            SubscriptionKind::Events,
            event(
                "m1",
                KIND_MATCH,
                r#"{"ref":1}"#,
                vec![
                    vec!["a", "38388:pk:promo-1"],
                    vec!["a", "38488:pk:attn-1"],
                    vec!["t", "880000"],
                ],
            ),
        );

        assert_eq!(matches.lock().unwrap().len(), 1);
        match &published.lock().unwrap()[0] {
            HookEvent::MatchPublished(ctx) => {
                assert_eq!(ctx.match_event_id, "m1");
                assert_eq!(ctx.promotion_coordinate.as_deref(), Some("38388:pk:promo-1"));
                assert_eq!(ctx.attention_coordinate.as_deref(), Some("38488:pk:attn-1"));
                assert_eq!(ctx.block_height, Some(880000));
                assert_eq!(ctx.data["ref"], 1);
            }
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn test_attn_kinds_route_to_topics() {
        let hooks = HookRegistry::new();
        let router = EventRouter::new("ws://relay", hooks);
        assert_eq!(
            router.route(SubscriptionKind::Events, event("1", KIND_MARKETPLACE, "raw", vec![])),
            RouteOutcome::Routed(Topic::Marketplace)
        );
        assert_eq!(
            router.route(
                SubscriptionKind::Events,
                event("2", KIND_ATTENTION_PAYMENT_CONFIRMATION, "{}", vec![])
            ),
            RouteOutcome::Routed(Topic::AttentionPaymentConfirmation)
        );
        assert!(matches!(
            router.route(SubscriptionKind::Events, event("3", KIND_PROFILE, "{}", vec![])),
            RouteOutcome::Dropped(_)
        ));
    }

    #[test]
    fn test_nip51_list_type_from_d_tag() {
        let hooks = HookRegistry::new();
        let lists = recorder(&hooks, Hook::On(Topic::Nip51List));
        let router = EventRouter::new("ws://relay", hooks);

        router.route(
            SubscriptionKind::Lists,
            event("l1", KIND_NIP51_LIST, "", vec![vec!["d", LIST_BLOCKED_PROMOTIONS]]),
        );
        match &lists.lock().unwrap()[0] {
            HookEvent::Event(ctx) => {
                assert_eq!(ctx.list_type, Some(ListType::BlockedPromotion));
                assert_eq!(ctx.data, Value::String(String::new()));
            }
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn test_duplicates_are_dropped_across_routers() {
        let hooks = HookRegistry::new();
        let profiles = recorder(&hooks, Hook::On(Topic::Profile));
        let seen = Arc::new(SeenEvents::new(2));
        let a = EventRouter::new("ws://a", hooks.clone()).with_dedup(seen.clone());
        let b = EventRouter::new("ws://b", hooks).with_dedup(seen);

        assert_eq!(
            a.route(SubscriptionKind::Standard, event("p1", KIND_PROFILE, "{}", vec![])),
            RouteOutcome::Routed(Topic::Profile)
        );
        assert_eq!(
            b.route(SubscriptionKind::Standard, event("p1", KIND_PROFILE, "{}", vec![])),
            RouteOutcome::Duplicate
        );
        assert_eq!(profiles.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_seen_events_evicts_oldest() {
        let seen = SeenEvents::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }
}
