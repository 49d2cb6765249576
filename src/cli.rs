use clap::{Parser, Subcommand};

use crate::config::Config;

/// Operator CLI for inspecting and controlling crawl sessions.
#[derive(Parser, Debug)]
#[command(name = "crawl-session")]
#[command(about = "Inspect and control distributed crawl sessions stored in Redis")]
#[command(version)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "REDIS_URL",
        default_value = Config::DEFAULT_REDIS_URL,
        help = "Redis connection URL"
    )]
    pub redis_url: String,

    #[arg(long, global = true, help = "Also write rotating log files to this directory")]
    pub log_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new session for a crawl hint and print its id.
    Create {
        #[arg(long, help = "Id of the crawl hint that seeded this job")]
        hint_id: String,

        #[arg(short, long, help = "Seed URL of the job")]
        url: String,
    },

    /// Print session metadata as JSON.
    Show { id: String },

    /// List session ids.
    List {
        #[arg(short, long, default_value_t = Config::DEFAULT_LIST_LIMIT)]
        limit: usize,
    },

    /// Mark a session stopped so workers stop taking work.
    Stop { id: String },

    /// Return a stopped session to normal.
    Resume { id: String },

    /// Delete all state of a session.
    Remove { id: String },

    /// Show worker heartbeats and which workers look stale.
    Workers {
        id: String,

        #[arg(long, default_value_t = Config::STALE_AFTER_SECS, help = "Seconds without a heartbeat before a worker is stale")]
        stale_after: u64,
    },

    /// Stream stats events for one session, or all sessions when no id is given.
    Watch { id: Option<String> },

    /// Check that Redis is reachable.
    Ping,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
