//! # Progress Tracker CLI (`ptrack`)
//!
//! ## Usage
//!
//! ```bash
//! ptrack --config ./config/ptrack.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ptrack init` | Create the SQLite database and run schema migrations |
//! | `ptrack refresh <project> --kind <kind>` | Run one incremental update in the foreground |
//! | `ptrack entities <project> --kind <kind>` | List extracted entities |
//! | `ptrack details <entity_id>` | Show an entity's per-document detail records |
//! | `ptrack route "<query>" --project <id> --agent <name>` | Resolve a data request through the router |
//! | `ptrack serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use progress_tracker::models::{EntityFilter, EntityKind};
use progress_tracker::{cli, config, logging, migrate, server};

/// Progress Tracker: incremental milestone, task and bottleneck extraction
/// from project documents.
#[derive(Parser)]
#[command(name = "ptrack", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ptrack.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Process documents added since the last run for one agent.
    Refresh {
        project_id: String,
        /// `milestone`, `task` or `bottleneck`.
        #[arg(long)]
        kind: EntityKind,
    },

    /// List entities of one kind.
    Entities {
        project_id: String,
        #[arg(long)]
        kind: EntityKind,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },

    /// Show an entity with its detail records.
    Details { entity_id: String },

    /// Route a natural-language data request to a registered function.
    Route {
        query: String,
        #[arg(long = "project")]
        project_id: String,
        /// Name of the agent making the request (logged only).
        #[arg(long = "agent", default_value = "cli")]
        agent: String,
        /// Function arguments as `key=value` pairs.
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

/// Parse a `key=value` pair for `--arg` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();
    let cfg = config::load_config(&opts.config)?;
    logging::init(&cfg.logging);

    match opts.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Refresh { project_id, kind } => {
            cli::run_refresh(&cfg, &project_id, kind).await?;
        }
        Commands::Entities {
            project_id,
            kind,
            category,
            priority,
        } => {
            let filter = EntityFilter {
                category,
                priority,
                source_document_id: None,
            };
            cli::run_entities(&cfg, &project_id, kind, filter).await?;
        }
        Commands::Details { entity_id } => {
            cli::run_details(&cfg, &entity_id).await?;
        }
        Commands::Route {
            query,
            project_id,
            agent,
            args,
        } => {
            cli::run_route(&cfg, &query, &project_id, &agent, args).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
