use async_trait::async_trait;
use nostr_sdk::prelude::*;

use crate::error::SignerError;
use crate::events::{EventTemplate, SignedEvent};

/// Turns an unsigned template into a signed event with `id` and `sig`.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the signing identity.
    fn public_key(&self) -> String;

    async fn sign(&self, template: EventTemplate) -> Result<SignedEvent, SignerError>;
}

/// Local secret-key signer backed by nostr-sdk.
#[derive(Clone)]
pub struct KeysSigner {
    keys: Keys,
}

impl KeysSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// Accepts hex or bech32 (`nsec1...`) secret keys.
    pub fn parse(secret_key: &str) -> Result<Self, SignerError> {
        let keys = Keys::parse(secret_key.trim())
            .map_err(|err| SignerError::InvalidKey(err.to_string()))?;
        Ok(Self { keys })
    }

    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }
}

impl std::fmt::Debug for KeysSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysSigner")
            .field("public_key", &self.public_key())
            .finish()
    }
}

#[async_trait]
impl Signer for KeysSigner {
    fn public_key(&self) -> String {
        self.keys.public_key().to_hex()
    }

    async fn sign(&self, template: EventTemplate) -> Result<SignedEvent, SignerError> {
        let mut tags = Vec::with_capacity(template.tags.len());
        for parts in template.tags {
            tags.push(Tag::parse(parts).map_err(|err| SignerError::Signing(err.to_string()))?);
        }

        let event = EventBuilder::new(Kind::from(template.kind), template.content)
            .tags(tags)
            .custom_created_at(Timestamp::from(template.created_at))
            .sign_with_keys(&self.keys)
            .map_err(|err| SignerError::Signing(err.to_string()))?;

        serde_json::from_str(&event.as_json()).map_err(|err| SignerError::Signing(err.to_string()))
    }
}
