mod app;
mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use udisk_transfer::Task;

use crate::app::App;
use crate::config::{Config, NodeStoreSetting};

#[derive(Parser)]
#[command(name = "udisk")]
#[command(about = "Per-user file namespaces over deduplicated storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.udisk/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct UserArg {
    /// Namespace owner
    #[arg(short, long, default_value = "default")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the storage directories
    Init {
        /// Storage directory
        #[arg(short, long)]
        storage: Option<PathBuf>,

        /// Keep node bodies on disk instead of rebuilding them on start
        #[arg(long)]
        disk_nodes: bool,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Create a directory and its missing parents
    Mkdir {
        #[command(flatten)]
        user: UserArg,
        path: String,
    },

    /// List a directory
    Ls {
        #[command(flatten)]
        user: UserArg,
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show a node's attributes
    Stat {
        #[command(flatten)]
        user: UserArg,
        path: String,
    },

    /// Move or rename a node
    Mv {
        #[command(flatten)]
        user: UserArg,
        src: String,
        dst: String,
    },

    /// Remove a file or a directory tree
    Rm {
        #[command(flatten)]
        user: UserArg,
        path: String,
    },

    /// Upload a local file
    Put {
        #[command(flatten)]
        user: UserArg,
        local: PathBuf,
        remote: String,
        /// Print the finished task as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a file
    Get {
        #[command(flatten)]
        user: UserArg,
        remote: String,
        local: PathBuf,
        /// Print the finished task as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::get_config_path()?,
    };

    if let Commands::Init {
        storage,
        disk_nodes,
        force,
    } = cli.command
    {
        if config_path.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                config_path.display()
            );
        }

        let storage = match storage {
            Some(path) => path,
            None => config::default_storage_path()?,
        };
        let mut config = Config::with_storage(storage);
        if disk_nodes {
            config.node_store = NodeStoreSetting::Disk;
        }

        std::fs::create_dir_all(&config.storage_path).with_context(|| {
            format!("Failed to create {}", config.storage_path.display())
        })?;
        config.save_to(&config_path)?;
        App::open(&config).await?;

        println!("Config written to {}", config_path.display());
        println!("Storage at {}", config.storage_path.display());
        return Ok(());
    }

    let config = Config::load_or_default(&config_path)?;
    let app = App::open(&config).await?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Mkdir { user, path } => {
            app.tree(&user.user).await?.make_directory(&path).await?;
        }
        Commands::Ls { user, path } => {
            let tree = app.tree(&user.user).await?;
            let dir = tree.resolve_path(&path).await?;
            for name in tree.list(&dir).await? {
                let child = udisk_namespace::path::join(&dir, &name);
                let stat = tree.stat(&child).await?;
                if stat.is_directory() {
                    println!("{}/", name);
                } else {
                    println!("{}", name);
                }
            }
        }
        Commands::Stat { user, path } => {
            let stat = app.tree(&user.user).await?.stat(&path).await?;
            println!("path: {}", stat.path);
            println!("kind: {:?}", stat.kind);
            println!("size: {}", stat.size);
        }
        Commands::Mv { user, src, dst } => {
            app.tree(&user.user).await?.move_node(&src, &dst).await?;
        }
        Commands::Rm { user, path } => {
            app.tree(&user.user).await?.remove(&path).await?;
        }
        Commands::Put {
            user,
            local,
            remote,
            json,
        } => {
            let task = app.put(&user.user, &local, &remote).await?;
            report(&task, json)?;
        }
        Commands::Get {
            user,
            remote,
            local,
            json,
        } => {
            let task = app.get(&user.user, &remote, &local).await?;
            report(&task, json)?;
        }
    }

    Ok(())
}

fn report(task: &Task, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
    } else {
        println!(
            "{:?} {} {} ({} bytes, {} chunks, digest {})",
            task.direction,
            task.target_path,
            match task.status {
                udisk_transfer::TaskStatus::Completed => "done",
                _ => "incomplete",
            },
            task.total_size,
            task.chunk_plan.len(),
            task.expected_digest
        );
    }
    Ok(())
}
