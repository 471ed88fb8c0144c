use clap::Parser;
use client::config::ClientConfig;
use client::network::{Client, Transport};
use client::rendering::LogRenderer;
use log::info;
use shared::{GameConfig, WanderBot};
use std::time::Duration;

/// Headless arena client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    #[arg(short, long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Room to join; any open room when omitted
    #[arg(short, long)]
    room: Option<String>,

    #[arg(short, long, default_value = "player")]
    name: String,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Seconds to play before leaving; runs until interrupted when omitted
    #[arg(short, long)]
    duration: Option<u64>,

    /// Let a wandering bot drive this player
    #[arg(short, long)]
    autopilot: bool,

    /// Log the arena every this many frames
    #[arg(long, default_value = "60")]
    render_every: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::connect(
        &args.server,
        args.transport,
        ClientConfig::default(),
        GameConfig::default(),
        args.fake_ping,
    )
    .await?;

    let player_id = client
        .join(args.room.as_deref(), &args.name, Duration::from_secs(5))
        .await?;
    info!(
        "Joined room {} as player {}",
        client.state().room_id().unwrap_or("?"),
        player_id
    );

    let autopilot = args.autopilot.then(|| WanderBot::new(shared::now_ms()));
    let mut renderer = LogRenderer::new(args.render_every);
    let duration = args.duration.map(Duration::from_secs);

    tokio::select! {
        result = client.run(duration, &mut renderer, autopilot) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, leaving");
            let _ = client.leave();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(())
}
