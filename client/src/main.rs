use std::process;

use clap::Parser;
use client::session::{format_message, RelaySession, SessionEvent};
use log::info;
use shared::ConnectionRequest;

/// Subscribes to a console relay and prints the log lines of one game server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Console relay to connect to, as ip:port
    #[arg(short = 'c', long)]
    relay: String,

    /// Game server whose log lines to request, as ip:port
    #[arg(short = 'g', long)]
    game_server: String,

    /// Relay password
    #[arg(short = 'p', long, default_value = "")]
    password: String,

    /// Stop after this many messages (0 = never)
    #[arg(short = 'l', long, default_value = "0")]
    limit: u64,

    /// Print only relayed lines and errors
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let Some((ip, port)) = args.game_server.rsplit_once(':') else {
        eprintln!("ERROR: The game server value must be an <ip>:<port> pair.");
        process::exit(1);
    };
    let request = ConnectionRequest::new(
        args.password.as_str(),
        ip.trim_start_matches('[').trim_end_matches(']'),
        port,
    );

    info!("Connecting to relay at {}", args.relay);
    let mut session = RelaySession::connect(&args.relay, request).await?;
    let mut received = 0;

    while args.limit == 0 || received < args.limit {
        match session.next_event().await? {
            SessionEvent::Identified(identity) => {
                if !args.quiet {
                    println!("--> Server identifies itself as {}", identity);
                    println!("--> Sending connection request.");
                }
            }
            SessionEvent::Connected => {
                if !args.quiet {
                    println!("--> Connected to {}.", args.relay);
                }
            }
            SessionEvent::Rejected(reason) => {
                println!("ERROR: Connection request was rejected by the server.");
                println!("Reason: {}", reason);
                process::exit(1);
            }
            SessionEvent::Message(message) => {
                received += 1;
                println!("{}", format_message(&message));
            }
        }
    }

    Ok(())
}
