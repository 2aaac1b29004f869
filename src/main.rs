//! # Tag Harvest CLI (`harvest`)
//!
//! Runs ingestion jobs for transcription-platform exports and reviews the
//! resulting tags.
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite database and run schema migrations |
//! | `harvest project load <file>` | Insert or update a project definition |
//! | `harvest dict import <file>` | Import a dictionary with entries and variations |
//! | `harvest date add <text> <edtf>` | Register a normalized date |
//! | `harvest extract <project>` | Run the full pipeline for a project |
//! | `harvest tags <project>` | Re-run tag extraction only |
//! | `harvest suggest <tag>` | Ranked dictionary candidates for a tag |
//! | `harvest assign <tag> <entry>` | Link a tag to a dictionary entry |
//! | `harvest status <job>` | Show a job record |
//! | `harvest cancel <job>` | Request cancellation of a running job |
//! | `harvest stats <project>` | Project statistics |
//! | `harvest show <project> <doc>` | Document with pages and tags |
//! | `harvest serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tag_harvest::models::JobKind;
use tag_harvest::progress::ProgressMode;
use tag_harvest::{config, jobs, migrate, pipeline, projects, resolve, server, show, stats};

/// Tag Harvest CLI: ingestion of transcription exports and tag resolution.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Tag Harvest: ingest transcription exports and resolve their tags",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage project definitions.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage dictionaries.
    Dict {
        #[command(subcommand)]
        action: DictAction,
    },

    /// Manage normalized dates.
    Date {
        #[command(subcommand)]
        action: DateAction,
    },

    /// Run archive extraction, reconciliation, parsing and tag extraction.
    Extract {
        project_id: i64,

        /// Acting user recorded on every written row.
        #[arg(long)]
        user: String,

        /// Progress output: `off`, `human` or `json` (stderr).
        /// Defaults to `human` on a terminal and `off` otherwise.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Re-run tag extraction over already parsed pages.
    Tags {
        project_id: i64,

        #[arg(long)]
        user: String,

        #[arg(long)]
        progress: Option<String>,
    },

    /// Print ranked dictionary candidates for a tag.
    Suggest { tag_id: i64 },

    /// Link a tag to a dictionary entry.
    Assign {
        tag_id: i64,
        entry_id: i64,

        #[arg(long)]
        user: String,
    },

    /// Show a job record.
    Status { job_id: String },

    /// Request cancellation of a running job.
    Cancel { job_id: String },

    /// Show project statistics.
    Stats { project_id: i64 },

    /// Show a document with its pages and tags.
    Show {
        project_id: i64,
        /// External document identifier.
        doc_id: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Insert or update a project from a TOML definition.
    Load { path: PathBuf },
}

#[derive(Subcommand)]
enum DictAction {
    /// Import a dictionary from a JSON file.
    Import { path: PathBuf },
}

#[derive(Subcommand)]
enum DateAction {
    /// Register the EDTF form of a raw date text.
    Add { text: String, edtf: String },
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => ProgressMode::parse(s).ok_or_else(|| {
            anyhow::anyhow!("Unknown --progress value: '{}'. Use off, human or json.", s)
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project {
            action: ProjectAction::Load { path },
        } => {
            projects::run_load_project(&cfg, &path).await?;
        }
        Commands::Dict {
            action: DictAction::Import { path },
        } => {
            projects::run_import_dictionary(&cfg, &path).await?;
        }
        Commands::Date {
            action: DateAction::Add { text, edtf },
        } => {
            projects::run_add_date(&cfg, &text, &edtf).await?;
        }
        Commands::Extract {
            project_id,
            user,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            pipeline::run_cli_job(&cfg, project_id, &user, JobKind::Extract, mode).await?;
        }
        Commands::Tags {
            project_id,
            user,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            pipeline::run_cli_job(&cfg, project_id, &user, JobKind::Tags, mode).await?;
        }
        Commands::Suggest { tag_id } => {
            resolve::run_suggest(&cfg, tag_id).await?;
        }
        Commands::Assign {
            tag_id,
            entry_id,
            user,
        } => {
            resolve::run_assign(&cfg, tag_id, entry_id, &user).await?;
        }
        Commands::Status { job_id } => {
            jobs::run_status(&cfg, &job_id).await?;
        }
        Commands::Cancel { job_id } => {
            jobs::run_cancel(&cfg, &job_id).await?;
        }
        Commands::Stats { project_id } => {
            stats::run_stats(&cfg, project_id).await?;
        }
        Commands::Show { project_id, doc_id } => {
            show::run_show(&cfg, project_id, &doc_id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
