use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND_PROFILE: u16 = 0;
pub const KIND_RELAY_LIST: u16 = 10002;
pub const KIND_NIP51_LIST: u16 = 30000;
pub const KIND_AUTH: u16 = 22242;

pub const KIND_BLOCK: u16 = 38088;
pub const KIND_MARKETPLACE: u16 = 38188;
pub const KIND_BILLBOARD: u16 = 38288;
pub const KIND_PROMOTION: u16 = 38388;
pub const KIND_ATTENTION: u16 = 38488;
pub const KIND_BILLBOARD_CONFIRMATION: u16 = 38588;
pub const KIND_ATTENTION_CONFIRMATION: u16 = 38688;
pub const KIND_MARKETPLACE_CONFIRMATION: u16 = 38788;
pub const KIND_MATCH: u16 = 38888;
pub const KIND_ATTENTION_PAYMENT_CONFIRMATION: u16 = 38988;

/// Application kinds requested on the events subscription, in wire order.
pub const ATTN_EVENT_KINDS: [u16; 9] = [
    KIND_MARKETPLACE,
    KIND_BILLBOARD,
    KIND_PROMOTION,
    KIND_ATTENTION,
    KIND_BILLBOARD_CONFIRMATION,
    KIND_ATTENTION_CONFIRMATION,
    KIND_MARKETPLACE_CONFIRMATION,
    KIND_ATTENTION_PAYMENT_CONFIRMATION,
    KIND_MATCH,
];

pub const LIST_BLOCKED_PROMOTIONS: &str = "org.attnprotocol:promotion:blocked";
pub const LIST_BLOCKED_PROMOTERS: &str = "org.attnprotocol:promoter:blocked";
pub const LIST_TRUSTED_BILLBOARDS: &str = "org.attnprotocol:billboard:trusted";
pub const LIST_TRUSTED_MARKETPLACES: &str = "org.attnprotocol:marketplace:trusted";

pub const NIP51_LIST_IDS: [&str; 4] = [
    LIST_BLOCKED_PROMOTIONS,
    LIST_BLOCKED_PROMOTERS,
    LIST_TRUSTED_BILLBOARDS,
    LIST_TRUSTED_MARKETPLACES,
];

/// A signed Nostr event as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    /// Block height carried in the `t` tag, if any.
    pub fn block_height(&self) -> Option<u64> {
        self.tag_value("t").and_then(|v| v.trim().parse().ok())
    }
}

/// An unsigned event, handed to a [`crate::Signer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: u16,
    #[serde(default = "unix_timestamp")]
    pub created_at: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_timestamp(),
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, name: &str, values: &[&str]) -> Self {
        let mut parts = Vec::with_capacity(1 + values.len());
        parts.push(name.to_string());
        parts.extend(values.iter().map(|v| v.to_string()));
        self.tags.push(parts);
        self
    }
}

/// Curated NIP-51 list a kind 30000 event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListType {
    TrustedBillboard,
    TrustedMarketplace,
    BlockedPromotion,
    BlockedPromoter,
    Other,
}

impl ListType {
    pub fn from_identifier(d_tag: &str) -> Self {
        match d_tag {
            LIST_TRUSTED_BILLBOARDS => ListType::TrustedBillboard,
            LIST_TRUSTED_MARKETPLACES => ListType::TrustedMarketplace,
            LIST_BLOCKED_PROMOTIONS => ListType::BlockedPromotion,
            LIST_BLOCKED_PROMOTERS => ListType::BlockedPromoter,
            _ => ListType::Other,
        }
    }
}

pub fn tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().map(String::as_str) == Some(name) && tag.len() > 1)
        .map(|tag| tag[1].as_str())
}

/// All values of tags named `name`, in order.
pub fn tag_values<'a>(tags: &'a [Vec<String>], name: &'a str) -> impl Iterator<Item = &'a str> {
    tags.iter()
        .filter(move |tag| tag.first().map(String::as_str) == Some(name))
        .filter_map(|tag| tag.get(1).map(String::as_str))
}

/// Event content as JSON, or the raw string when it is not JSON.
pub fn parse_content(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_tags(tags: Vec<Vec<String>>) -> SignedEvent {
        SignedEvent {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: KIND_MATCH,
            tags,
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_tag_helpers() {
        let template = EventTemplate::new(KIND_MATCH, "")
            .tag("a", &["38388:pk:promo"])
            .tag("a", &["38488:pk:attn"])
            .tag("t", &["880000"]);
        assert_eq!(tag_value(&template.tags, "t"), Some("880000"));
        let coords: Vec<_> = tag_values(&template.tags, "a").collect();
        assert_eq!(coords, vec!["38388:pk:promo", "38488:pk:attn"]);
        assert_eq!(tag_value(&template.tags, "d"), None);
    }

    #[test]
    fn test_block_height_from_t_tag() {
        let event = event_with_tags(vec![vec!["t".into(), "870001".into()]]);
        assert_eq!(event.block_height(), Some(870001));
        let bad = event_with_tags(vec![vec!["t".into(), "tip".into()]]);
        assert_eq!(bad.block_height(), None);
    }

    #[test]
    fn test_parse_content_falls_back_to_string() {
        assert_eq!(parse_content(r#"{"height":5}"#)["height"], 5);
        assert_eq!(parse_content("not json"), Value::String("not json".into()));
    }

    #[test]
    fn test_list_type_from_identifier() {
        assert_eq!(
            ListType::from_identifier(LIST_TRUSTED_BILLBOARDS),
            ListType::TrustedBillboard
        );
        assert_eq!(
            ListType::from_identifier(LIST_BLOCKED_PROMOTERS),
            ListType::BlockedPromoter
        );
        assert_eq!(ListType::from_identifier("mute"), ListType::Other);
    }

    #[test]
    fn test_signed_event_parses_wire_json() {
        let json = r#"{"id":"ab","pubkey":"cd","created_at":10,"kind":38088,"tags":[["t","1"]],"content":"{}","sig":"ef"}"#;
        let event: SignedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, KIND_BLOCK);
        assert_eq!(event.block_height(), Some(1));
    }
}
