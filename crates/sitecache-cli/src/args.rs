//! CLI argument definitions using clap derive

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use sitecache_common::LogFormat;
use url::Url;

/// sitecache - offline cache for a content site
///
/// Installs a versioned worker against a live origin, serves requests
/// through it, and keeps its partitions in a snapshot file between runs.
#[derive(Parser, Debug)]
#[command(name = "sitecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    pub log_format: LogFormat,

    /// Worker configuration file (JSON)
    #[arg(short, long, global = true, env = "SITECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the site origin from the configuration
    #[arg(long, global = true)]
    pub origin: Option<Url>,

    /// Cache snapshot file
    #[arg(short, long, global = true, env = "SITECACHE_STORE")]
    pub store: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install (or update to) the configured version and activate it
    Install(InstallArgs),

    /// Serve one request through the active worker
    Fetch(FetchArgs),

    /// Remove expired dynamic entries
    Cleanup,

    /// List partitions and their entry counts
    Status,

    /// Deliver a push message and show the resulting notification
    Push(PushArgs),
}

/// Arguments for the install command
#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Skip warming the prefetch list after activation
    #[arg(long)]
    pub no_prefetch: bool,
}

/// Arguments for the fetch command
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// URL or site-relative path
    pub url: String,

    /// Accept header to send
    #[arg(long)]
    pub accept: Option<String>,

    /// Send as a page navigation
    #[arg(long, conflicts_with = "accept")]
    pub navigate: bool,

    /// Print the response body
    #[arg(long)]
    pub body: bool,
}

/// Arguments for the push command
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Notification text
    pub text: String,

    /// Also simulate a click on the notification
    #[arg(long)]
    pub click: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_args() {
        let cli = Cli::parse_from([
            "sitecache",
            "-vv",
            "fetch",
            "/api/posts",
            "--accept",
            "application/json",
            "--store",
            "/tmp/caches.json",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/caches.json")));
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.url, "/api/posts");
                assert_eq!(args.accept.as_deref(), Some("application/json"));
                assert!(!args.navigate);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_navigate_conflicts_with_accept() {
        let result = Cli::try_parse_from([
            "sitecache",
            "fetch",
            "/",
            "--navigate",
            "--accept",
            "text/html",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_format_parses() {
        let cli = Cli::parse_from(["sitecache", "--log-format", "json", "status"]);
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
