//! CLI commands implementation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ServerConfig;
use crate::models::{UrlListProps, WebsiteProps};
use crate::repository::{
    self, Db, LogRepository, ThreadRepository, UrlListRepository, WebsiteRepository,
};

#[derive(Parser)]
#[command(name = "webharvest")]
#[command(about = "Multi-tenant web crawling and scraping server")]
#[command(version)]
pub struct Cli {
    /// Server configuration file (TOML)
    #[arg(long, global = true, env = "WEBHARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(long, global = true, env = "WEBHARVEST_DB")]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Run the command-and-control server
    Serve,

    /// Manage websites
    Website {
        #[command(subcommand)]
        command: WebsiteCommands,
    },

    /// Manage URL lists
    Urllist {
        #[command(subcommand)]
        command: UrllistCommands,
    },

    /// List registered worker threads and their status
    Threads,

    /// Show recent log entries
    Log {
        /// Restrict to one module
        #[arg(long)]
        module: Option<String>,
        /// Number of entries
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum WebsiteCommands {
    /// Register a website
    Add {
        /// SQL-safe namespace
        namespace: String,
        /// Display name
        name: String,
        /// Domain; omit for a cross-domain website
        #[arg(long)]
        domain: Option<String>,
        /// Data directory for website-specific files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// List websites
    List,
}

#[derive(Subcommand)]
enum UrllistCommands {
    /// Create a URL list with its dependent tables
    Add {
        /// Owning website id
        website: i64,
        /// SQL-safe namespace, unique per website
        namespace: String,
        /// Display name
        name: String,
    },
    /// List the URL lists of a website
    List {
        /// Website id
        website: i64,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let db = Db::open(&config.db_path);
    repository::init_schema(&db)?;

    match cli.command {
        Commands::Init => {
            println!("initialized database at {}", config.db_path.display());
        }

        Commands::Serve => {
            crate::server::serve(config, db).await?;
        }

        Commands::Website { command } => match command {
            WebsiteCommands::Add {
                namespace,
                name,
                domain,
                data_dir,
            } => {
                let id = WebsiteRepository::new(db).add(&WebsiteProps {
                    domain,
                    namespace,
                    name,
                    data_dir: data_dir.or(config.data_dir),
                })?;
                println!("website {id} created");
            }
            WebsiteCommands::List => {
                for site in WebsiteRepository::new(db).list()? {
                    println!(
                        "{:>4}  {:<20} {:<25} {}",
                        site.id,
                        site.namespace,
                        site.domain.as_deref().unwrap_or("(cross-domain)"),
                        site.name
                    );
                }
            }
        },

        Commands::Urllist { command } => match command {
            UrllistCommands::Add {
                website,
                namespace,
                name,
            } => {
                let id = UrlListRepository::new(db)
                    .add(website, &UrlListProps { namespace, name })?;
                println!("URL list {id} created");
            }
            UrllistCommands::List { website } => {
                for list in UrlListRepository::new(db).list(website)? {
                    println!("{:>4}  {:<20} {}", list.id, list.namespace, list.name);
                }
            }
        },

        Commands::Threads => {
            for entry in ThreadRepository::new(db).list()? {
                println!(
                    "{:>4}  {:<10} website {:>3}  list {:>3}  last {:>6}  {}{}",
                    entry.id,
                    entry.module.as_str(),
                    entry.website,
                    entry.urllist,
                    entry.last,
                    if entry.paused { "[paused] " } else { "" },
                    entry.status
                );
            }
        }

        Commands::Log { module, limit } => {
            let entries = LogRepository::new(db).tail(module.as_deref(), limit)?;
            for entry in entries.into_iter().rev() {
                println!("{}  {:<10} {}", entry.time, entry.module, entry.entry);
            }
        }
    }

    Ok(())
}
