use clap::{Parser, Subcommand};
use vellum_core::retention::RetentionMode;

#[derive(Parser, Debug)]
#[command(name = "vellum-server", about = "Secure messaging core")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/vellum.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket gateway and background sweeps (default)
    Serve,
    /// Recompute a tenant's audit chain and report the first break
    VerifyChain {
        #[arg(long)]
        tenant: i64,
        #[arg(long, default_value_t = 0)]
        from: i64,
        #[arg(long)]
        to: Option<i64>,
    },
    /// Clear a tenant's chain freeze after the break was investigated
    UnfreezeChain {
        #[arg(long)]
        tenant: i64,
    },
    /// Erase one user's messages and read state within a tenant
    AnonymizeUser {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        user: i64,
    },
    /// Set a tenant's retention policy
    SetRetention {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        days: i64,
        #[arg(long, default_value = "delete")]
        mode: RetentionMode,
    },
    /// Run one retention sweep over every tenant and print the report
    SweepRetention,
}
