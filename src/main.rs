//! # Relate CLI (`relate`)
//!
//! ## Usage
//!
//! ```bash
//! relate --config ./config/relate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relate init` | Create the SQLite database and schema |
//! | `relate add <file>` | Split a text file into passages and store it |
//! | `relate books` | List stored books |
//! | `relate remove <book>` | Delete a book and its relations |
//! | `relate index <book>` | Embed a book and cache its vectors |
//! | `relate compare <source> <target>` | Discover relations from one book to another |
//! | `relate auto <book>` | Compare a book with every other book, both directions |
//! | `relate relations <book>` | Print stored relations as JSON |
//! | `relate completions <shell>` | Print a shell completion script |

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use relate::commands::{self, CompareArgs};
use relate::config;
use relate::migrate;
use relate::progress::ProgressMode;
use tracing_subscriber::EnvFilter;

/// Relate: discover how passages in different books relate to each other.
#[derive(Parser)]
#[command(
    name = "relate",
    about = "Discover and classify relationships between passages of different books",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relate.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` when stderr is a terminal.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Split a UTF-8 text file into passages and store it as a book.
    Add {
        file: PathBuf,

        /// Book title; defaults to the file name. The book id is derived from it.
        #[arg(long)]
        title: Option<String>,

        /// Compare the new book with every existing book afterwards.
        #[arg(long)]
        auto: bool,
    },

    /// List stored books.
    Books,

    /// Delete a book, its passages, relations, and cached vectors.
    Remove { book: String },

    /// Embed every passage of a book and cache the vectors.
    Index { book: String },

    /// Find relations from passages of `source` to passages of `target`.
    Compare {
        source: String,
        target: String,

        /// Minimum cosine similarity for a candidate (default from config).
        #[arg(long)]
        threshold: Option<f32>,

        /// Maximum candidates per passage (default from config).
        #[arg(long)]
        top_k: Option<usize>,

        /// Give the classifier whole books (or chapter batches) instead of
        /// nearest neighbors.
        #[arg(long)]
        full_context: bool,

        /// Print relations as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Compare a book with every other book in both directions.
    Auto { book: String },

    /// Print stored relations of a book as JSON.
    Relations {
        book: String,

        /// Only relations whose focus is this passage.
        #[arg(long)]
        passage: Option<String>,
    },

    /// Generate a shell completion script.
    Completions { shell: Shell },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "relate=debug,relate_core=debug"
    } else {
        "relate=info,relate_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "relate", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add { file, title, auto } => {
            commands::run_add(&cfg, &file, title, auto, progress).await?;
        }
        Commands::Books => {
            commands::run_books(&cfg).await?;
        }
        Commands::Remove { book } => {
            commands::run_remove(&cfg, &book).await?;
        }
        Commands::Index { book } => {
            commands::run_index(&cfg, &book).await?;
        }
        Commands::Compare {
            source,
            target,
            threshold,
            top_k,
            full_context,
            json,
        } => {
            let args = CompareArgs {
                source: &source,
                target: &target,
                threshold,
                top_k,
                full_context,
                json,
            };
            commands::run_compare(&cfg, args, progress).await?;
        }
        Commands::Auto { book } => {
            commands::run_auto(&cfg, &book, progress).await?;
        }
        Commands::Relations { book, passage } => {
            commands::run_relations(&cfg, &book, passage.as_deref()).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config is loaded"),
    }

    Ok(())
}
