use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, loopback::joined_channel, ChannelOptions, ClientEvent, ClientObserver,
    LoopbackTransport, StaticAccessManager, SyncEngine,
};
use serde_json::json;
use shared::domain::{ChannelId, Identity};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version = SyncEngine::version())]
struct Args {
    #[arg(long, default_value = "carol")]
    identity: String,
    #[arg(long, default_value = "info")]
    log_filter: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective settings after file and environment overrides.
    Settings,
    /// Run a scripted session against the in-memory loopback service.
    Demo {
        #[arg(long, default_value_t = 2)]
        channels: usize,
    },
}

struct PrintObserver;

impl ClientObserver for PrintObserver {
    fn on_event(&self, event: &ClientEvent) {
        match event.channel_id() {
            Some(channel_id) => println!("[{channel_id}] {:?}", event.kind()),
            None => println!("{event:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Settings => println!("{:#?}", load_settings()),
        Command::Demo { channels } => demo(Identity::new(args.identity), channels).await?,
    }
    Ok(())
}

async fn demo(identity: Identity, channels: usize) -> Result<()> {
    let server = Arc::new(LoopbackTransport::new());
    for index in 1..=channels {
        server.seed_channel(joined_channel(&format!("SEED{index}"), None));
    }
    let access = Arc::new(StaticAccessManager::new("demo-token", identity.clone(), None));
    let engine = SyncEngine::start(load_settings(), access, server.clone());
    let observer = Arc::new(PrintObserver);
    let _handle = engine.add_observer(&observer);
    info!(identity = %identity, version = SyncEngine::version(), "console: session started");

    let loaded = engine.load_channels().await.context("loading channels")?;
    println!("loaded {} channel(s)", loaded.len());

    let created = engine
        .create_channel(ChannelOptions {
            friendly_name: Some("Demo room".into()),
            unique_name: Some("demo-room".into()),
            ..ChannelOptions::default()
        })
        .await
        .context("creating channel")?;
    let channel_id = created.channel_id.clone();

    let draft = engine.create_message("hello from the console");
    let sent = engine
        .send_message(&channel_id, &draft)
        .await
        .context("sending message")?;
    engine
        .update_message_body(&channel_id, &sent, "hello again from the console")
        .await
        .context("editing message")?;

    let bob = Identity::new("bob");
    engine
        .add_member(&channel_id, bob.clone())
        .await
        .context("adding member")?;
    server.remote_message(&channel_id, bob, "hi there");
    engine.handle_inbound_notification(json!({
        "channel_id": channel_id.as_str(),
        "message_id": "IM9000",
    }));
    engine.typing(&channel_id);
    engine.register_push_token(b"console-device");

    // Let the remaining events drain before printing the final view.
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_channel(&engine, &channel_id).await;

    engine.shutdown().await;
    info!("console: session closed");
    Ok(())
}

async fn print_channel(engine: &SyncEngine, channel_id: &ChannelId) {
    let Some(channel) = engine.channel_by_id(channel_id).await else {
        println!("channel {channel_id} is gone");
        return;
    };
    println!(
        "{} ({:?}) status={:?} history={:?}",
        channel.channel_id,
        channel.unique_name,
        channel.status,
        channel.history
    );
    for member in engine.members(channel_id).await.unwrap_or_default() {
        println!("  member {} {:?}", member.identity, member.status);
    }
    for message in engine.messages(channel_id).await.unwrap_or_default() {
        println!(
            "  {} {}: {} [{:?}]",
            message.created_at.format("%H:%M:%S"),
            message.author,
            message.body,
            message.state
        );
    }
}
