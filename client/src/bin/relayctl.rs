use std::net::{Ipv4Addr, SocketAddr};
use std::process;

use clap::{Parser, Subcommand};
use client::control::{query_status, render_status, request_shutdown};

/// Queries or stops a console relay over its local control channel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control port of the relay
    #[arg(short = 'p', long, default_value = "34568")]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the relay's uptime, memory and traffic counters
    Status,
    /// Ask the relay to shut down
    Stop,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let relay = SocketAddr::from((Ipv4Addr::LOCALHOST, args.port));

    let outcome = match args.command {
        Command::Status => query_status(relay).await.map(|report| {
            println!();
            println!("{}", render_status(&report));
            println!();
        }),
        Command::Stop => request_shutdown(relay).await.map(|accepted| {
            if accepted {
                println!("Console Relay is shutting down.");
            } else {
                println!("Console Relay refused to shut down.");
            }
        }),
    };

    if let Err(e) = outcome {
        eprintln!("{}", e);
        process::exit(1);
    }
    Ok(())
}
