use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use attn_relay::{EventTemplate, KeysSigner, PublishOptions, Publisher, Signer, WsTransport};

#[derive(Debug, Parser)]
#[command(name = "attn-publish")]
#[command(about = "Sign an event template and publish it to Nostr relays")]
struct Args {
    #[arg(long, required = true)]
    relay: Vec<String>,
    /// Secret key (hex or nsec). Defaults to ATTN_SECRET_KEY.
    #[arg(long)]
    key: Option<String>,
    /// JSON file with `{"kind", "tags", "content"}` and optional `created_at`.
    #[arg(long)]
    event: PathBuf,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    /// Wait for a NIP-42 challenge before sending.
    #[arg(long)]
    auth: bool,
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
    let key = args
        .key
        .or_else(|| std::env::var("ATTN_SECRET_KEY").ok())
        .ok_or("--key or ATTN_SECRET_KEY is required")?;
    let signer = Arc::new(KeysSigner::parse(&key)?);

    let template: EventTemplate = serde_json::from_str(&std::fs::read_to_string(&args.event)?)?;
    let event = signer.sign(template).await?;
    info!(event_id = %event.id, kind = event.kind, relays = args.relay.len(), "Publishing event");

    let timeout = Duration::from_secs(args.timeout_secs);
    let mut options = PublishOptions {
        timeout,
        auth_timeout: timeout,
        ..PublishOptions::default()
    };
    if args.auth {
        options = options.with_auth();
    }

    let publisher = Publisher::new(Arc::new(WsTransport), signer);
    let results = publisher
        .publish_to_multiple(&event, &args.relay, &options)
        .await;
    println!("{}", serde_json::to_string_pretty(&results)?);

    if results.success_count == 0 {
        return Err("no relay accepted the event".into());
    }
    Ok(())
}
