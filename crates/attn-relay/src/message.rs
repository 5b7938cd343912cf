//! NIP-01 / NIP-42 envelopes exchanged with a relay.
//!
//! Outbound frames are built with [`ClientMessage::to_json`]; inbound text is
//! decoded with [`RelayMessage::decode`], which never fails: malformed or
//! unrecognised frames come back as [`RelayMessage::Unknown`] so a noisy relay
//! cannot take a connection down.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::events::SignedEvent;

/// Subscription filter sent inside a REQ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Tag queries keyed by `#<letter>`.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn since(mut self, since: Option<u64>) -> Self {
        self.since = since;
        self
    }

    /// Add a tag query. `letter` is given without the leading `#`.
    pub fn tag(mut self, letter: &str, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{letter}"), values);
        self
    }

    pub fn tag_values(&self, letter: &str) -> Option<&[String]> {
        self.tags.get(&format!("#{letter}")).map(Vec::as_slice)
    }
}

/// Frames the client sends.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Event(SignedEvent),
    Auth(SignedEvent),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(2 + filters.len());
                frame.push(Value::String("REQ".to_string()));
                frame.push(Value::String(subscription_id.clone()));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Frames the relay sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: SignedEvent,
    },
    Eose {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Auth {
        challenge: String,
    },
    Notice {
        message: String,
    },
    /// Anything else, including malformed JSON. Carries the frame type when one
    /// could be read.
    Unknown(Option<String>),
}

impl RelayMessage {
    pub fn decode(text: &str) -> Self {
        decode_frame(text).unwrap_or_else(|| {
            let label = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get(0).and_then(Value::as_str).map(String::from));
            RelayMessage::Unknown(label)
        })
    }

    pub fn label(&self) -> &str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Eose { .. } => "EOSE",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Auth { .. } => "AUTH",
            RelayMessage::Notice { .. } => "NOTICE",
            RelayMessage::Unknown(label) => label.as_deref().unwrap_or("?"),
        }
    }
}

fn decode_frame(text: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let kind = arr.first()?.as_str()?;
    match kind {
        "EVENT" => {
            let subscription_id = arr.get(1)?.as_str()?.to_string();
            let event: SignedEvent = serde_json::from_value(arr.get(2)?.clone()).ok()?;
            Some(RelayMessage::Event {
                subscription_id,
                event,
            })
        }
        "EOSE" => Some(RelayMessage::Eose {
            subscription_id: arr.get(1)?.as_str()?.to_string(),
        }),
        "OK" => {
            let event_id = arr.get(1)?.as_str()?.to_string();
            let accepted = arr.get(2)?.as_bool()?;
            let message = arr
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            })
        }
        "AUTH" => Some(RelayMessage::Auth {
            challenge: arr.get(1)?.as_str()?.to_string(),
        }),
        "NOTICE" => Some(RelayMessage::Notice {
            message: arr.get(1)?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_serializes_tag_filters() {
        let filter = Filter::new()
            .kinds([38188, 38288])
            .tag("p", vec!["aa".into()])
            .since(Some(100));
        let json = ClientMessage::Req {
            subscription_id: "attn-events-1".into(),
            filters: vec![filter],
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "attn-events-1");
        assert_eq!(value[2]["kinds"], serde_json::json!([38188, 38288]));
        assert_eq!(value[2]["#p"], serde_json::json!(["aa"]));
        assert_eq!(value[2]["since"], 100);
        assert!(value[2].get("authors").is_none());
    }

    #[test]
    fn test_close_frame() {
        let json = ClientMessage::Close {
            subscription_id: "sub".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"["CLOSE","sub"]"#);
    }

    #[test]
    fn test_decode_inbound_frames() {
        assert_eq!(
            RelayMessage::decode(r#"["AUTH","ch1"]"#),
            RelayMessage::Auth {
                challenge: "ch1".into()
            }
        );
        assert_eq!(
            RelayMessage::decode(r#"["OK","abc",false,"blocked"]"#),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: false,
                message: "blocked".into()
            }
        );
        assert_eq!(
            RelayMessage::decode(r#"["OK","abc",true]"#),
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: true,
                message: String::new()
            }
        );
        assert_eq!(
            RelayMessage::decode(r#"["EOSE","attn-blocks-1"]"#),
            RelayMessage::Eose {
                subscription_id: "attn-blocks-1".into()
            }
        );
        assert_eq!(
            RelayMessage::decode(r#"["NOTICE","slow down"]"#),
            RelayMessage::Notice {
                message: "slow down".into()
            }
        );
    }

    #[test]
    fn test_decode_event_frame() {
        let text = r#"["EVENT","s",{"id":"1","pubkey":"p","created_at":2,"kind":0,"tags":[],"content":"{}","sig":"x"}]"#;
        match RelayMessage::decode(text) {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "s");
                assert_eq!(event.id, "1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_are_unknown() {
        assert_eq!(RelayMessage::decode("not json"), RelayMessage::Unknown(None));
        assert_eq!(RelayMessage::decode("{}"), RelayMessage::Unknown(None));
        assert_eq!(
            RelayMessage::decode(r#"["CLOSED","s","bye"]"#),
            RelayMessage::Unknown(Some("CLOSED".into()))
        );
        assert_eq!(
            RelayMessage::decode(r#"["OK","abc","yes",""]"#),
            RelayMessage::Unknown(Some("OK".into()))
        );
    }
}
