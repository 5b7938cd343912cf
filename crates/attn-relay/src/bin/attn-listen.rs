use std::env;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info, warn};

use attn_relay::{RelayEndpoint, Session, SessionConfig, Topic, WsTransport};

#[derive(Debug, Parser)]
#[command(name = "attn-listen")]
#[command(about = "Subscribe to ATTN marketplace events and log hook traffic")]
struct Args {
    /// Relay URL. Overrides ATTN_RELAYS when given.
    #[arg(long)]
    relay: Vec<String>,
    /// Relay URL that requires NIP-42 auth.
    #[arg(long)]
    auth_relay: Vec<String>,
    /// Secret key (hex or nsec). Defaults to ATTN_SECRET_KEY.
    #[arg(long)]
    key: Option<String>,
    /// Only request events newer than this unix timestamp.
    #[arg(long)]
    since: Option<u64>,
    #[arg(long)]
    no_reconnect: bool,
}

fn build_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = if args.relay.is_empty() && args.auth_relay.is_empty() {
        SessionConfig::from_env()?
    } else {
        let key = args
            .key
            .clone()
            .or_else(|| env::var("ATTN_SECRET_KEY").ok())
            .ok_or("--key or ATTN_SECRET_KEY is required")?;
        let mut relays: Vec<RelayEndpoint> =
            args.auth_relay.iter().map(RelayEndpoint::with_auth).collect();
        relays.extend(args.relay.iter().map(RelayEndpoint::new));
        SessionConfig::new(relays, key)
    };

    if let Some(key) = &args.key {
        config.secret_key = key.clone();
    }
    if args.since.is_some() {
        config.subscription_since = args.since;
    }
    if args.no_reconnect {
        config.auto_reconnect = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let mut session = Session::new(config, Arc::new(WsTransport))?;
    info!(pubkey = %session.public_key(), version = attn_relay::version(), "Starting attn-listen");

    let hooks = session.hooks();
    hooks.on_relay_connect(|ctx| info!(relay_url = %ctx.relay_url, "Relay connected"));
    hooks.on_relay_disconnect(|ctx| {
        warn!(relay_url = %ctx.relay_url, reason = %ctx.reason, error = ?ctx.error, "Relay disconnected")
    });
    hooks.on_subscription(|ctx| {
        debug!(relay_url = %ctx.relay_url, subscription_id = %ctx.subscription_id, status = ?ctx.status, "Subscription")
    });
    hooks.on_new_block(|ctx| {
        info!(relay_url = %ctx.relay_url, height = ctx.block_height, hash = ?ctx.block_hash, "New block")
    });
    for topic in Topic::EVENTS {
        hooks.on_event(topic, move |ctx| {
            info!(
                relay_url = %ctx.relay_url,
                ?topic,
                event_id = %ctx.event_id,
                pubkey = %ctx.pubkey,
                block_height = ?ctx.block_height,
                "Event"
            )
        });
    }
    hooks.on_match_published(|ctx| {
        info!(
            match_event_id = %ctx.match_event_id,
            promotion = ?ctx.promotion_coordinate,
            attention = ?ctx.attention_coordinate,
            "Match published"
        )
    });

    if let Err(err) = session.connect().await {
        if !session.connected() {
            return Err(err.into());
        }
        warn!(error = %err, "Some relays failed to connect; continuing with the rest");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.disconnect(Some("shutdown".to_string())).await;
    Ok(())
}
