use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "signal-flow", version, about = "Social-signal enrichment and card delivery pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator: beat scheduler plus all pipeline jobs.
    Worker,

    /// Serve the health/metrics/preview HTTP endpoints.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },

    /// One ingestion polling pass over the configured handles.
    Ingest,

    /// One enrichment pass (security + market scanners).
    Scan,

    /// One on-chain verification pass.
    Verify {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// One outbox dispatch pass.
    Dispatch,

    /// Build a card for an event key and print it as JSON.
    Card {
        event_key: String,
        #[arg(long)]
        render: bool,
    },

    /// Print the card JSON schema.
    Schema,

    /// Load and validate the rules directory.
    ValidateRules {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}
