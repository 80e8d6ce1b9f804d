//! Syncline CLI
//!
//! Runs the sync engine against an in-process reference server.
//!
//! # Commands
//!
//! - `simulate` - Drive producers, the engine and the server, then report
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Syncline sync engine tools.
#[derive(Parser)]
#[command(name = "syncline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local sync simulation and print the engine statistics
    Simulate {
        /// Number of entities written by the producers
        #[arg(short, long, default_value = "100")]
        entities: u64,

        /// Number of concurrent producer threads
        #[arg(short, long, default_value = "4")]
        producers: u64,

        /// Number of tracked entity types
        #[arg(long, default_value = "2")]
        entity_types: u16,

        /// Entities written on the server by other clients, pulled via BriefMe
        #[arg(long, default_value = "10")]
        remote_writes: u64,

        /// Upper bound for the client batch size
        #[arg(long)]
        max_batch: Option<usize>,

        /// Messages the server processes per batch
        #[arg(long, default_value = "100")]
        server_max_batch: usize,

        /// Fail every n-th server request
        #[arg(long)]
        fail_every: Option<u64>,

        /// Artificial server latency in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,

        /// Background poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Give up if the simulation has not settled after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,

        /// Transport (http, direct)
        #[arg(short, long, default_value = "http")]
        transport: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            entities,
            producers,
            entity_types,
            remote_writes,
            max_batch,
            server_max_batch,
            fail_every,
            latency_ms,
            poll_interval_ms,
            timeout_secs,
            transport,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                entities,
                producers,
                entity_types,
                remote_writes,
                max_batch,
                server_max_batch,
                fail_every,
                latency_ms,
                poll_interval_ms,
                timeout_secs,
                transport: transport.parse()?,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Version => {
            println!("Syncline CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Syncline protocol v{}",
                syncline_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
