use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use client::emitter::{emit, ChatLine};
use log::info;
use tokio::net::UdpSocket;

/// Sends fake game-server log datagrams to a console relay.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay message listener, as ip:port
    #[arg(short = 't', long, default_value = "127.0.0.1:12345")]
    to: SocketAddr,

    /// Local address to send from; the relay sees this as the game server
    #[arg(short = 'f', long, default_value = "127.0.0.1:2345")]
    from: SocketAddr,

    /// Seconds between datagrams
    #[arg(short = 'd', long, default_value = "1")]
    delay: u64,

    /// Stop after this many datagrams (0 = never)
    #[arg(short = 'l', long, default_value = "0")]
    limit: u64,

    /// Chat text to send
    #[arg(short = 'm', long, default_value = "This is a test!")]
    message: String,

    /// Use say_team instead of say
    #[arg(short = 's', long)]
    say_team: bool,

    /// Speak as the server console instead of a player
    #[arg(short = 'c', long)]
    console: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let socket = UdpSocket::bind(args.from).await?;
    let line = ChatLine {
        text: args.message,
        say_team: args.say_team,
        from_console: args.console,
    };

    info!("Emitting log lines from {} to {}", args.from, args.to);
    let sent = emit(
        &socket,
        args.to,
        &line,
        Duration::from_secs(args.delay),
        args.limit,
    )
    .await?;
    info!("Sent {} datagrams", sent);
    Ok(())
}
