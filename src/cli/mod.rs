pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::crawler::collector::SearchQuery;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to the default log file
    #[arg(long, global = true)]
    pub log: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Settings a run can override on top of its profile
#[derive(Args, Debug, Default, Clone)]
pub struct CrawlOverrides {
    /// Number of parallel browsers (at most 5)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Minimum delay between items, in seconds
    #[arg(long)]
    pub delay_min: Option<u64>,

    /// Maximum delay between items, in seconds
    #[arg(long)]
    pub delay_max: Option<u64>,

    /// Stop after this many completed items per day
    #[arg(long)]
    pub daily_limit: Option<u32>,

    /// Stop dispatching after this many minutes
    #[arg(long)]
    pub session_minutes: Option<u64>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every target not yet completed, resuming from the checkpoint
    Crawl {
        /// Site profile to use
        #[arg(short, long, default_value = "general")]
        profile: String,

        /// Target list (JSON array, {"urls": [...]} or one URL per line)
        #[arg(short, long)]
        targets: Option<PathBuf>,

        /// Only take the first N targets
        #[arg(short, long)]
        limit: Option<usize>,

        #[command(flatten)]
        overrides: CrawlOverrides,
    },

    /// Collect target URLs from search result pages
    Collect {
        /// Search keywords
        #[arg(required = true)]
        keywords: String,

        /// Narrow the search to a location
        #[arg(long)]
        location: Option<String>,

        /// Site profile to use
        #[arg(short, long, default_value = "general")]
        profile: String,

        /// Maximum number of URLs to collect
        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// Ignore earlier collection progress
        #[arg(long)]
        restart: bool,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },

    /// Show checkpoint progress
    Status {
        /// Site profile to use
        #[arg(short, long, default_value = "general")]
        profile: String,
    },

    /// Delete crawl progress
    Reset {
        /// Site profile to use
        #[arg(short, long, default_value = "general")]
        profile: String,

        /// Also delete the saved login
        #[arg(long)]
        auth: bool,

        /// Also delete search collection progress
        #[arg(long)]
        collector: bool,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to show, or to create if it does not exist
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { profile, targets, limit, overrides } => {
            info!("Starting crawl with profile {}", profile);
            commands::crawl(profile, targets, limit, overrides).await
        },
        Commands::Collect { keywords, location, profile, limit, restart, headed } => {
            let query = SearchQuery::new(keywords, location);
            info!("Collecting up to {} URLs for {:?}", limit, query);
            commands::collect(query, profile, limit, restart, headed).await
        },
        Commands::Status { profile } => commands::status(profile).await,
        Commands::Reset { profile, auth, collector } => {
            info!("Resetting progress for profile {}", profile);
            commands::reset(profile, auth, collector).await
        },
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name)
            } else {
                commands::show_config()
            }
        },
    }
}
