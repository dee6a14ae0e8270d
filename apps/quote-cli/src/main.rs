//! # quote
//!
//! Command-line collaborator for the quotation sync engine.
//!
//! ## Local Setup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  terminal 1:  quote serve            (server of record, :8765)         │
//! │  terminal 2:  quote relay            (broadcast relay, :8766)          │
//! │  terminal 3:  quote --relay ws://127.0.0.1:8766 watch                  │
//! │  terminal 4:  quote --relay ws://127.0.0.1:8766 edit --title "Roof"    │
//! │                                                                         │
//! │  Every editor process opens the same SQLite cache; the relay tells     │
//! │  siblings when to re-read it.                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use quote_core::ResolutionStrategy;
use tracing_subscriber::EnvFilter;

use crate::commands::Context;

/// Server of record used when none is configured.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8765";

/// quote - edit and sync quotations
#[derive(Parser, Debug)]
#[command(name = "quote")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the sync configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite cache file (defaults to the platform data directory)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Server of record base URL
    #[arg(long)]
    server: Option<String>,

    /// Broadcast relay URL (ws:// or wss://)
    #[arg(long)]
    relay: Option<String>,

    /// Bus session shared with sibling processes
    #[arg(long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Infrastructure ===
    /// Run the broadcast relay
    Relay {
        /// Address to listen on (defaults to the configured bus address)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run an in-memory server of record over HTTP
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: String,
    },

    // === Documents ===
    /// Create or edit a quotation, then save and push it
    Edit(EditArgs),

    /// Fetch the server copy into the cache
    Pull {
        /// Quotation id
        id: String,
    },

    /// Push local changes to the server
    Push {
        /// Quotation id
        id: String,

        /// How to settle a version conflict (keep-local, keep-server, merge, cancel)
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,
    },

    /// Push every quotation with local changes
    SyncAll {
        /// How to settle version conflicts
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,
    },

    /// Show cached quotations and their sync state
    #[command(alias = "ls")]
    Status {
        /// Only this quotation
        id: Option<String>,

        /// Print cache records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove every cached quotation
    Clear {
        /// Confirm; unsynced edits are lost
        #[arg(long)]
        yes: bool,
    },

    /// Print events from sibling processes until interrupted
    Watch {
        /// Ask siblings to re-announce unsynced work on start
        #[arg(long)]
        request_state: bool,
    },
}

#[derive(Args, Debug)]
pub struct EditArgs {
    /// Quotation id; a new quotation is created when omitted
    pub id: Option<String>,

    /// Quotation number, e.g. Q-2024-0042
    #[arg(long)]
    pub number: Option<String>,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub customer: Option<String>,

    /// ISO 4217 currency code
    #[arg(long)]
    pub currency: Option<String>,

    #[arg(long)]
    pub notes: Option<String>,

    /// Discount in basis points (100 = 1%)
    #[arg(long)]
    pub discount_bps: Option<u32>,

    /// Line item as DESCRIPTION:QUANTITY:UNIT_PRICE_CENTS (repeatable)
    #[arg(long = "item")]
    pub items: Vec<String>,

    /// Save to the cache only
    #[arg(long)]
    pub no_push: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let ctx = Context::new(
        cli.config,
        cli.database,
        cli.server,
        cli.relay,
        cli.session,
    )?;

    match cli.command {
        Commands::Relay { bind } => commands::relay(&ctx, bind).await,
        Commands::Serve { bind } => commands::serve(bind).await,
        Commands::Edit(args) => commands::edit(&ctx, args).await,
        Commands::Pull { id } => commands::pull(&ctx, &id).await,
        Commands::Push { id, strategy } => commands::push(&ctx, &id, strategy).await,
        Commands::SyncAll { strategy } => commands::sync_all(&ctx, strategy).await,
        Commands::Status { id, json } => commands::status(&ctx, id, json).await,
        Commands::Clear { yes } => commands::clear(&ctx, yes).await,
        Commands::Watch { request_state } => commands::watch(&ctx, request_state).await,
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=quote_sync=trace` - Show trace for the sync engine only
/// - Default: WARN, INFO for the quote crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,quote_sync=info,quote_store=info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
