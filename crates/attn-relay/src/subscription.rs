//! Subscription bookkeeping for one relay.
//!
//! Four logical subscriptions are kept per connection. Their ids are fixed when
//! the manager is built and reused across reconnects, so EOSE and CLOSE keep
//! correlating with the same ids for the life of the connection.

use tracing::{debug, info};

use crate::config::SubscriptionFilters;
use crate::error::Error;
use crate::events::{
    unix_timestamp_millis, ATTN_EVENT_KINDS, KIND_BLOCK, KIND_NIP51_LIST, KIND_PROFILE,
    KIND_RELAY_LIST, NIP51_LIST_IDS,
};
use crate::hooks::{Hook, HookEvent, HookRegistry, SubscriptionContext, SubscriptionStatus};
use crate::message::{ClientMessage, Filter};
use crate::transport::TransportHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Block (time-sync) events from trusted nodes.
    Blocks,
    /// Marketplace application events.
    Events,
    /// Profiles and relay lists.
    Standard,
    /// Curated NIP-51 lists.
    Lists,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 4] = [
        SubscriptionKind::Blocks,
        SubscriptionKind::Events,
        SubscriptionKind::Standard,
        SubscriptionKind::Lists,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionIds {
    pub blocks: String,
    pub events: String,
    pub standard: String,
    pub lists: String,
}

impl SubscriptionIds {
    pub fn from_timestamp(millis: u128) -> Self {
        let standard = format!("attn-standard-{millis}");
        Self {
            blocks: format!("attn-blocks-{millis}"),
            events: format!("attn-events-{millis}"),
            lists: format!("{standard}-nip51"),
            standard,
        }
    }

    pub fn get(&self, kind: SubscriptionKind) -> &str {
        match kind {
            SubscriptionKind::Blocks => &self.blocks,
            SubscriptionKind::Events => &self.events,
            SubscriptionKind::Standard => &self.standard,
            SubscriptionKind::Lists => &self.lists,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveSubscription {
    kind: SubscriptionKind,
    id: String,
    filter: Filter,
}

#[derive(Debug)]
pub struct SubscriptionManager {
    relay_url: String,
    filters: SubscriptionFilters,
    since: Option<u64>,
    ids: SubscriptionIds,
    active: Vec<ActiveSubscription>,
    hooks: HookRegistry,
}

impl SubscriptionManager {
    pub fn new(
        relay_url: impl Into<String>,
        filters: SubscriptionFilters,
        since: Option<u64>,
        hooks: HookRegistry,
    ) -> Self {
        Self::with_ids(
            relay_url,
            filters,
            since,
            hooks,
            SubscriptionIds::from_timestamp(unix_timestamp_millis()),
        )
    }

    pub fn with_ids(
        relay_url: impl Into<String>,
        filters: SubscriptionFilters,
        since: Option<u64>,
        hooks: HookRegistry,
        ids: SubscriptionIds,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            filters,
            since,
            ids,
            active: Vec::new(),
            hooks,
        }
    }

    pub fn ids(&self) -> &SubscriptionIds {
        &self.ids
    }

    pub fn kind_of(&self, subscription_id: &str) -> Option<SubscriptionKind> {
        SubscriptionKind::ALL
            .into_iter()
            .find(|kind| self.ids.get(*kind) == subscription_id)
    }

    pub fn is_active(&self, subscription_id: &str) -> bool {
        self.active.iter().any(|sub| sub.id == subscription_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Filter for one logical subscription, built from configuration only.
    pub fn filter_for(&self, kind: SubscriptionKind) -> Filter {
        match kind {
            SubscriptionKind::Blocks => {
                let mut filter = Filter::new().kinds([KIND_BLOCK]).since(self.since);
                if !self.filters.node_pubkeys.is_empty() {
                    filter = filter.authors(self.filters.node_pubkeys.clone());
                }
                filter
            }
            SubscriptionKind::Events => {
                let mut filter = Filter::new().kinds(ATTN_EVENT_KINDS).since(self.since);
                let mut pubkeys: Vec<String> = Vec::new();
                for key in self
                    .filters
                    .marketplace_pubkeys
                    .iter()
                    .chain(&self.filters.billboard_pubkeys)
                    .chain(&self.filters.advertiser_pubkeys)
                {
                    if !pubkeys.contains(key) {
                        pubkeys.push(key.clone());
                    }
                }
                if !pubkeys.is_empty() {
                    filter = filter.tag("p", pubkeys);
                }
                if !self.filters.marketplace_d_tags.is_empty() {
                    filter = filter.tag("d", self.filters.marketplace_d_tags.clone());
                }
                filter
            }
            SubscriptionKind::Standard => Filter::new().kinds([KIND_PROFILE, KIND_RELAY_LIST]),
            SubscriptionKind::Lists => Filter::new()
                .kinds([KIND_NIP51_LIST])
                .tag("d", NIP51_LIST_IDS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Send one REQ per logical subscription. Stops at the first send failure.
    pub fn subscribe_all(&mut self, transport: &TransportHandle) -> Result<(), Error> {
        if let Some(since) = self.since {
            info!(relay_url = %self.relay_url, since, "Using since filter for subscriptions");
        }
        for kind in SubscriptionKind::ALL {
            self.subscribe(kind, transport)?;
        }
        Ok(())
    }

    fn subscribe(&mut self, kind: SubscriptionKind, transport: &TransportHandle) -> Result<(), Error> {
        let id = self.ids.get(kind).to_string();
        let filter = self.filter_for(kind);

        if let Some(pos) = self.active.iter().position(|sub| sub.id == id) {
            if self.active[pos].filter != filter {
                let close = ClientMessage::Close {
                    subscription_id: id.clone(),
                };
                transport.send(close.to_json()?)?;
            }
            self.active.remove(pos);
        }

        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: vec![filter.clone()],
        };
        transport.send(req.to_json()?)?;
        debug!(relay_url = %self.relay_url, subscription_id = %id, ?kind, "Sent REQ");

        self.active.push(ActiveSubscription {
            kind,
            id: id.clone(),
            filter: filter.clone(),
        });
        self.notify(id, filter, SubscriptionStatus::Subscribed);
        Ok(())
    }

    /// Send CLOSE for every open subscription and forget them. Bookkeeping is
    /// cleared even if a send fails; the first failure is returned.
    pub fn close_all(&mut self, transport: &TransportHandle) -> Result<(), Error> {
        let mut first_err = None;
        for sub in self.active.drain(..) {
            let close = ClientMessage::Close {
                subscription_id: sub.id.clone(),
            };
            let sent = close
                .to_json()
                .map_err(Error::from)
                .and_then(|frame| transport.send(frame).map_err(Error::from));
            if let Err(err) = sent {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop bookkeeping without sending anything; the socket is already gone.
    pub fn forget_all(&mut self) {
        self.active.clear();
    }

    /// Report EOSE as a confirmed subscription. Unknown ids are ignored.
    pub fn on_eose(&self, subscription_id: &str) -> bool {
        let Some(sub) = self.active.iter().find(|sub| sub.id == subscription_id) else {
            debug!(relay_url = %self.relay_url, subscription_id, "EOSE for unknown subscription");
            return false;
        };
        debug!(relay_url = %self.relay_url, subscription_id, kind = ?sub.kind, "Subscription confirmed");
        self.notify(sub.id.clone(), sub.filter.clone(), SubscriptionStatus::Confirmed);
        true
    }

    fn notify(&self, subscription_id: String, filter: Filter, status: SubscriptionStatus) {
        let context = SubscriptionContext {
            relay_url: self.relay_url.clone(),
            subscription_id,
            filter,
            status,
        };
        self.hooks
            .emit(Hook::Subscription, &HookEvent::Subscription(context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel, OutboundFrame, TransportPeer};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    fn manager(filters: SubscriptionFilters, hooks: HookRegistry) -> SubscriptionManager {
        SubscriptionManager::with_ids(
            "ws://relay",
            filters,
            Some(1_700_000_000),
            hooks,
            SubscriptionIds::from_timestamp(42),
        )
    }

    fn open_pair() -> (TransportHandle, TransportPeer) {
        let (handle, peer) = channel();
        peer.open();
        (handle, peer)
    }

    fn drain_json(peer: &mut TransportPeer) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(OutboundFrame::Text(text)) = peer.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn test_ids_follow_timestamp_layout() {
        let ids = SubscriptionIds::from_timestamp(42);
        assert_eq!(ids.blocks, "attn-blocks-42");
        assert_eq!(ids.events, "attn-events-42");
        assert_eq!(ids.standard, "attn-standard-42");
        assert_eq!(ids.lists, "attn-standard-42-nip51");
    }

    #[test]
    fn test_empty_allow_lists_add_no_restrictions() {
        let subs = manager(SubscriptionFilters::default(), HookRegistry::new());
        let blocks = subs.filter_for(SubscriptionKind::Blocks);
        assert_eq!(blocks.kinds, vec![KIND_BLOCK]);
        assert!(blocks.authors.is_none());
        assert_eq!(blocks.since, Some(1_700_000_000));

        let events = subs.filter_for(SubscriptionKind::Events);
        assert_eq!(events.kinds, ATTN_EVENT_KINDS.to_vec());
        assert!(events.tags.is_empty());
    }

    #[test]
    fn test_allow_lists_are_merged_and_deduplicated() {
        let filters = SubscriptionFilters {
            node_pubkeys: vec!["node".into()],
            marketplace_pubkeys: vec!["m".into(), "shared".into()],
            billboard_pubkeys: vec!["shared".into()],
            advertiser_pubkeys: vec!["a".into()],
            marketplace_d_tags: vec!["market-1".into()],
        };
        let subs = manager(filters, HookRegistry::new());

        let blocks = subs.filter_for(SubscriptionKind::Blocks);
        assert_eq!(blocks.authors, Some(vec!["node".to_string()]));

        let events = subs.filter_for(SubscriptionKind::Events);
        assert_eq!(
            events.tag_values("p").unwrap(),
            &["m".to_string(), "shared".to_string(), "a".to_string()]
        );
        assert_eq!(events.tag_values("d").unwrap(), &["market-1".to_string()]);

        let lists = subs.filter_for(SubscriptionKind::Lists);
        assert_eq!(lists.kinds, vec![KIND_NIP51_LIST]);
        assert_eq!(lists.tag_values("d").unwrap().len(), 4);
        assert!(subs.filter_for(SubscriptionKind::Standard).since.is_none());
    }

    #[test]
    fn test_subscribe_all_sends_req_and_notifies() {
        let hooks = HookRegistry::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        hooks.on_subscription(move |ctx| {
            sink.lock()
                .unwrap()
                .push((ctx.subscription_id.clone(), ctx.status))
        });

        let (handle, mut peer) = open_pair();
        let mut subs = manager(SubscriptionFilters::default(), hooks);
        subs.subscribe_all(&handle).unwrap();

        let frames = drain_json(&mut peer);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f[0] == "REQ"));
        assert_eq!(frames[0][1], "attn-blocks-42");
        assert_eq!(frames[3][1], "attn-standard-42-nip51");
        assert_eq!(subs.active_count(), 4);

        assert!(subs.on_eose("attn-events-42"));
        assert!(!subs.on_eose("stale-id"));

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 5);
        assert_eq!(
            statuses[4],
            ("attn-events-42".to_string(), SubscriptionStatus::Confirmed)
        );
    }

    #[test]
    fn test_close_all_clears_bookkeeping_but_keeps_ids() {
        let (handle, mut peer) = open_pair();
        let mut subs = manager(SubscriptionFilters::default(), HookRegistry::new());
        subs.subscribe_all(&handle).unwrap();
        drain_json(&mut peer);

        subs.close_all(&handle).unwrap();
        let frames = drain_json(&mut peer);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f[0] == "CLOSE"));
        assert_eq!(subs.active_count(), 0);
        assert!(!subs.on_eose("attn-blocks-42"));
        assert_eq!(subs.kind_of("attn-blocks-42"), Some(SubscriptionKind::Blocks));
    }

    #[test]
    fn test_subscribe_on_closed_transport_fails() {
        let (handle, _peer) = channel();
        let mut subs = manager(SubscriptionFilters::default(), HookRegistry::new());
        assert!(matches!(
            subs.subscribe_all(&handle),
            Err(Error::Transport(_))
        ));
        assert_eq!(subs.active_count(), 0);
    }

    #[test]
    fn test_resubscribe_reuses_ids() {
        let (handle, mut peer) = open_pair();
        let mut subs = manager(SubscriptionFilters::default(), HookRegistry::new());
        subs.subscribe_all(&handle).unwrap();
        subs.forget_all();
        subs.subscribe_all(&handle).unwrap();

        let frames = drain_json(&mut peer);
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[0][1], frames[4][1]);
        assert_eq!(subs.active_count(), 4);
    }
}
