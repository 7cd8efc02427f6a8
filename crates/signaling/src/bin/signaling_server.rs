//! MeshVoice signaling server binary

use clap::Parser;
use meshvoice_core::TurnServerConfig;
use meshvoice_signaling::{
    AllowAllAuthorizer, MembershipRegistry, MemoryBus, MemoryRegistry, MessageBus, RedisBus,
    ReplicatedRegistry, SignalingConfig, SignalingRelay, SignalingServer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "signaling_server")]
#[command(about = "MeshVoice signaling server: channel membership and negotiation relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8443", env = "MESHVOICE_PORT")]
    port: u16,

    /// Registry entry TTL in seconds (heartbeat interval is derived as ttl/5)
    #[arg(long, default_value = "30", env = "MESHVOICE_TTL_SECS")]
    ttl_secs: u64,

    /// Redis URL for the replicated registry; omit to run single-node in memory
    #[arg(long, env = "MESHVOICE_REDIS_URL")]
    redis_url: Option<String>,

    /// STUN server URLs handed to clients (repeatable)
    #[arg(long = "stun", env = "MESHVOICE_STUN")]
    stun_servers: Vec<String>,

    /// TURN server URL
    #[arg(long, requires_all = ["turn_username", "turn_credential"])]
    turn_url: Option<String>,

    /// TURN username
    #[arg(long)]
    turn_username: Option<String>,

    /// TURN credential
    #[arg(long)]
    turn_credential: Option<String>,

    /// Maximum occupants per channel (full-mesh fan-out bound)
    #[arg(long, default_value = "16")]
    max_channel_occupants: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = SignalingConfig::default().with_entry_ttl(Duration::from_secs(args.ttl_secs));
    config.bind_port = args.port;
    config.stun_servers = args.stun_servers;
    config.max_channel_occupants = args.max_channel_occupants;
    if let (Some(url), Some(username), Some(credential)) = (
        args.turn_url,
        args.turn_username,
        args.turn_credential,
    ) {
        config.turn_server = Some(TurnServerConfig {
            url,
            username,
            credential,
        });
    }
    config.validate()?;

    // Registry and bus pair up: multi-node deployments share membership
    // and cross-process delivery through the same redis instance
    let (registry, bus): (Arc<dyn MembershipRegistry>, Arc<dyn MessageBus>) = match &args.redis_url
    {
        Some(url) => {
            info!("using replicated registry and bus at {url}");
            (
                Arc::new(ReplicatedRegistry::connect(url, config.entry_ttl).await?),
                Arc::new(RedisBus::connect(url).await?),
            )
        }
        None => {
            info!("using in-memory registry");
            (
                Arc::new(MemoryRegistry::new(config.entry_ttl)),
                Arc::new(MemoryBus::new()),
            )
        }
    };

    let relay = Arc::new(SignalingRelay::new(
        &config,
        registry,
        Arc::new(AllowAllAuthorizer),
        bus,
    ));

    let handle = SignalingServer::new(&config, relay).start().await?;
    info!("signaling server running on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;

    Ok(())
}
