//! Multi-relay session: one [`Connection`] per configured relay sharing one
//! hook registry and one signer.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::Error;
use crate::hooks::HookRegistry;
use crate::publish::Publisher;
use crate::router::SeenEvents;
use crate::signer::{KeysSigner, Signer};
use crate::transport::Transport;

pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    hooks: HookRegistry,
    seen: Option<Arc<SeenEvents>>,
    connections: Vec<Connection>,
    dispatch: Option<tracing::Dispatch>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("connections", &self.connections)
            .finish()
    }
}

impl Session {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let signer = KeysSigner::parse(&config.secret_key)?;
        Ok(Self::with_signer(config, transport, Arc::new(signer)))
    }

    /// Use an external signer instead of `config.secret_key`.
    pub fn with_signer(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let seen = config
            .deduplicate
            .then(|| Arc::new(SeenEvents::default()));
        Self {
            config,
            transport,
            signer,
            hooks: HookRegistry::new(),
            seen,
            connections: Vec::new(),
            dispatch: None,
        }
    }

    /// Logger for every connection this session spawns.
    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.transport.clone(), self.signer.clone())
    }

    pub fn public_key(&self) -> String {
        self.signer.public_key()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, relay_url: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.relay_url() == relay_url)
    }

    /// True when at least one relay is ready.
    pub fn connected(&self) -> bool {
        self.connections.iter().any(Connection::connected)
    }

    /// Connect every relay concurrently. Waits for all of them and returns
    /// the first failure, if any.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.config.validate()?;
        if self.connections.is_empty() {
            for endpoint in &self.config.relays {
                let mut config = self
                    .config
                    .connection_config(endpoint.clone(), self.signer.clone());
                config.dispatch = self.dispatch.clone();
                self.connections.push(Connection::spawn(
                    config,
                    self.transport.clone(),
                    self.hooks.clone(),
                    self.seen.clone(),
                ));
            }
        }

        let results = join_all(self.connections.iter().map(|c| c.connect())).await;
        let mut first_error = None;
        let mut ready = 0;
        for (connection, result) in self.connections.iter().zip(results) {
            match result {
                Ok(()) => ready += 1,
                Err(err) => {
                    warn!(relay_url = %connection.relay_url(), error = %err, "Relay failed to connect");
                    first_error.get_or_insert(err);
                }
            }
        }
        info!(ready, total = self.connections.len(), "Session connect finished");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn disconnect(&self, reason: Option<String>) {
        join_all(
            self.connections
                .iter()
                .map(|connection| connection.disconnect(reason.clone())),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use tracing::Dispatch;

    use crate::config::RelayEndpoint;
    use crate::hooks::Topic;
    use crate::transport::{ChannelTransport, TransportPeer};

    const SECRET: &str = "6b911fd37cdf5c81d4c0adb1ab7fa822ed253ab0ad9aa18d77257c88b29b718e";

    fn session(relays: Vec<RelayEndpoint>) -> (Session, tokio::sync::mpsc::UnboundedReceiver<(String, TransportPeer)>) {
        let (transport, sockets) = ChannelTransport::new();
        let session = Session::new(SessionConfig::new(relays, SECRET), Arc::new(transport))
            .unwrap()
            .with_dispatch(Dispatch::none());
        (session, sockets)
    }

    async fn accept(peer: &mut TransportPeer) -> Vec<String> {
        peer.open();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let req: serde_json::Value = serde_json::from_str(&peer.recv_text().await.unwrap()).unwrap();
            ids.push(req[1].as_str().unwrap().to_string());
        }
        ids
    }

    #[test]
    fn test_new_rejects_bad_key() {
        let (transport, _sockets) = ChannelTransport::new();
        let config = SessionConfig::new(vec![RelayEndpoint::new("ws://a")], "not-a-key");
        assert!(matches!(
            Session::new(config, Arc::new(transport)),
            Err(Error::Signer(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_relays() {
        let (mut session, _sockets) = session(Vec::new());
        let err = session.connect().await.unwrap_err();
        assert!(err.to_string().contains("At least one relay URL is required"));
        assert!(!session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_and_deduplicate() {
        let (mut session, mut sockets) = session(vec![
            RelayEndpoint::new("ws://a"),
            RelayEndpoint::new("ws://b"),
        ]);
        let profiles = Arc::new(Mutex::new(Vec::new()));
        let sink = profiles.clone();
        session
            .hooks()
            .on_event(Topic::Profile, move |ctx| sink.lock().unwrap().push(ctx.relay_url.clone()));

        let relays = async {
            let (_, mut a) = sockets.recv().await.unwrap();
            let (_, mut b) = sockets.recv().await.unwrap();
            let ids_a = accept(&mut a).await;
            let ids_b = accept(&mut b).await;
            (a, b, ids_a, ids_b)
        };
        let (result, (a, b, ids_a, ids_b)) = tokio::join!(session.connect(), relays);
        result.unwrap();
        assert!(session.connected());
        assert_eq!(session.connections().len(), 2);

        let profile = json!({
            "id": "p1",
            "pubkey": "someone",
            "created_at": 1,
            "kind": 0,
            "tags": [],
            "content": "{\"name\":\"billboard\"}",
            "sig": "sig"
        });
        a.message(json!(["EVENT", ids_a[2], profile]).to_string());
        b.message(json!(["EVENT", ids_b[2], profile]).to_string());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(profiles.lock().unwrap().len(), 1);

        session.disconnect(None).await;
        assert!(!session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_first_failure_after_all_settle() {
        let (mut session, mut sockets) = session(vec![
            RelayEndpoint::new("ws://up"),
            RelayEndpoint::new("ws://down"),
        ]);

        let relays = async {
            let mut peers = Vec::new();
            for _ in 0..2 {
                let (url, mut peer) = sockets.recv().await.unwrap();
                if url == "ws://up" {
                    accept(&mut peer).await;
                } else {
                    peer.close(1006, "");
                }
                peers.push(peer);
            }
            peers
        };
        let (result, _peers) = tokio::join!(session.connect(), relays);

        assert!(matches!(result, Err(Error::ConnectionClosed { .. })));
        assert!(session.connected());
        assert!(session.connection("ws://up").unwrap().connected());
        assert!(!session.connection("ws://down").unwrap().connected());
    }
}
