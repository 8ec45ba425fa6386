use clap::{Parser, Subcommand, ValueEnum};

use crate::edge::endpoints::CacheTier;

#[derive(Parser)]
#[command(name = "betstack-sync", about = "Odds ingestion and edge propagation service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Seed the league catalog and the consensus bookmaker.
    Bootstrap,
    /// Refresh the league catalog from the provider's sports listing.
    SyncSports,
    /// Sync odds for one league now, ignoring cooldowns.
    SyncOdds {
        #[arg(long)]
        league: String,
    },
    /// Sync scores for one league now, ignoring cooldowns.
    SyncScores {
        #[arg(long)]
        league: String,
    },
    /// Propagate one cache tier to edge KV.
    Propagate {
        #[arg(long, value_enum, default_value_t = TierArg::Critical)]
        tier: TierArg,
    },
    /// Mirror api-key records into the edge key-validity namespace.
    MirrorKeys,
    /// Fold edge usage counters into the database ledger.
    ReconcileUsage,
    /// Run everything: scheduler, workers, propagation, reconciliation, api.
    Daemon,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Critical,
    Static,
}

impl From<TierArg> for CacheTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Critical => CacheTier::Critical,
            TierArg::Static => CacheTier::Static,
        }
    }
}
