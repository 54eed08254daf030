//! dlp-triage: the triage daemon and its operator commands.
//!
//! `run` starts the scheduler; the other subcommands inspect or act on the
//! incident store directly.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use triage_core::types::{IncidentStatus, RelevanceScore, Verdict};

/// LLM-assisted triage of DLP incidents with an analyst feedback loop
#[derive(Parser, Debug)]
#[command(name = "dlp-triage", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors to the terminal
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (process, cleanup and health jobs)
    Run {
        /// Run a single processing cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Analyse one stored incident now
    Analyze {
        incident_id: String,
    },
    /// Pull new incidents from the evidence directory
    Ingest {
        /// Look back this many hours instead of the configured window
        #[arg(long)]
        hours: Option<u64>,
    },
    /// List incidents, newest first
    Incidents {
        /// Filter by status: pending, analyzed, error
        #[arg(short, long)]
        status: Option<IncidentStatus>,
        /// Only analysed incidents nobody has reviewed yet
        #[arg(long, conflicts_with = "status")]
        unreviewed: bool,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show an incident with its latest analysis
    Show {
        incident_id: String,
    },
    /// Record an analyst review of the latest analysis
    Feedback {
        incident_id: String,
        /// Correct verdict: TRUE_POSITIVE, FALSE_POSITIVE or REQUIRES_REVIEW
        #[arg(long)]
        verdict: Verdict,
        /// Why (at least 10 characters)
        #[arg(long)]
        comment: String,
        /// high, medium, low, or a number in [0, 1]
        #[arg(long, default_value = "high")]
        relevance: RelevanceScore,
    },
    /// Recent analyst feedback in retrieval order
    History {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Store-wide statistics
    Stats,
    /// Purge records older than the retention window
    Cleanup {
        /// Override `scheduler.retention_days`
        #[arg(long)]
        days: Option<u64>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to the user config file
    Init,
    /// Print the user config file location
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Config commands work even when the current config does not validate.
    if let Commands::Config { action } = cli.command {
        return commands::handle_config(action, cli.config.as_deref());
    }

    let config = triage_core::config::load_config(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        match cli.verbose {
            0 if cli.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = config.logging.resolved_log_dir();
    let (json_layer, _guard) = match usable_log_dir(&log_dir) {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "dlp-triage.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::debug!(
        database = %config.database.path.display(),
        provider = %config.llm.provider,
        model = %config.llm.model,
        log_dir = %log_dir.display(),
        "Configuration loaded"
    );

    commands::handle_command(cli.command, config).await
}

/// Create the log directory. On failure, warn on stderr and return `None`
/// so the process runs with terminal logging only.
fn usable_log_dir(log_dir: &Path) -> Option<&Path> {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => Some(log_dir),
        Err(e) => {
            eprintln!(
                "Warning: cannot create log directory {}: {}. File logging disabled.",
                log_dir.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_log_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        assert_eq!(usable_log_dir(&logs), Some(logs.as_path()));
        assert!(logs.is_dir());
    }

    #[test]
    fn test_usable_log_dir_rejects_path_under_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        assert_eq!(usable_log_dir(&blocker.join("logs")), None);
    }
}
