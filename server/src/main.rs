use clap::Parser;
use log::info;
use server::input_buffer::FallbackPolicy;
use server::{Server, ServerConfig, Transport};
use std::time::Duration;

/// Authoritative arena server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
    #[arg(short, long, value_enum, default_value = "tcp")]
    transport: Transport,
    /// Seats per room, bots included
    #[arg(short, long, default_value = "4")]
    max_players: usize,
    /// Simulation ticks per second
    #[arg(long, default_value = "60")]
    tick_rate: u32,
    /// Fill rooms with bots when a round starts
    #[arg(long)]
    ai_fill: bool,
    /// Seats to fill when --ai-fill is set
    #[arg(long, default_value = "2")]
    ai_fill_target: usize,
    /// Input used for frames a player sent nothing for
    #[arg(long, value_enum, default_value = "repeat-movement")]
    fallback: FallbackPolicy,
    /// Seconds a disconnected player's seat is held
    #[arg(long, default_value = "30")]
    reconnect_grace: u64,
    /// Frames of countdown before a round runs
    #[arg(long, default_value = "0")]
    countdown: u32,
    /// Passphrase for reconnection tokens; random per process when unset
    #[arg(long)]
    token_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ServerConfig {
        room_capacity: args.max_players.max(1),
        ai_fill: args.ai_fill,
        ai_fill_target: args.ai_fill_target,
        fallback: args.fallback,
        reconnect_grace: Duration::from_secs(args.reconnect_grace),
        ..ServerConfig::default()
    };
    config.game.tick_rate = args.tick_rate.max(1);
    config.game.countdown_frames = args.countdown;
    if let Some(secret) = &args.token_secret {
        config = config.with_secret(secret);
    }

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, args.transport, config).await?;
    let trigger = server.shutdown_trigger();

    let running = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    trigger.trigger();
    running.await?;

    Ok(())
}
