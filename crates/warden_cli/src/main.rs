//! WARDEN CLI
//!
//! Runs gateway operations for one tenant from the command line.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::{GatewayConfig, TenantId, WardenError};
use warden_gateway::{Gateway, ListOptions, ReadOptions, SearchOptions};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "WARDEN - tenant-isolated filesystem gateway", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the base directory holding all sandboxes
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
    /// Tenant to act as
    #[arg(short, long)]
    tenant: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Describe a file or directory
    Stat {
        /// Tenant-relative path
        path: String,
    },
    /// List a directory
    Ls {
        /// Tenant-relative directory
        #[arg(default_value = ".")]
        path: String,
        /// Include dotfiles
        #[arg(short, long)]
        all: bool,
        /// Entry limit
        #[arg(long, default_value_t = 100)]
        max: usize,
    },
    /// Print a file to stdout
    Cat {
        /// Tenant-relative path
        path: String,
        /// Stop after this many lines
        #[arg(short = 'n', long)]
        max_lines: Option<usize>,
    },
    /// Replace a file with the content of a local file or stdin
    Put {
        /// Tenant-relative path
        path: String,
        /// Local source file; stdin when absent
        #[arg(short, long)]
        from: Option<PathBuf>,
    },
    /// Append a local file or stdin to a file
    Append {
        /// Tenant-relative path
        path: String,
        /// Local source file; stdin when absent
        #[arg(short, long)]
        from: Option<PathBuf>,
    },
    /// Remove a file or directory
    Rm {
        /// Tenant-relative path
        path: String,
        /// Remove directories with their contents
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move a file or directory
    Mv {
        /// Source
        from: String,
        /// Destination
        to: String,
    },
    /// Copy a file
    Cp {
        /// Source
        from: String,
        /// Destination
        to: String,
    },
    /// Create a directory and any missing parents
    Mkdir {
        /// Tenant-relative path
        path: String,
        /// Fail if the parent does not exist
        #[arg(long)]
        no_parents: bool,
    },
    /// Find entries whose name matches a glob
    Find {
        /// Glob, e.g. `*.md`
        pattern: String,
        /// Directory to search below
        #[arg(long, default_value = ".")]
        path: String,
        /// Include directories
        #[arg(long)]
        dirs: bool,
        /// Match limit
        #[arg(long, default_value_t = 50)]
        max: usize,
    },
    /// Show quota and rate state
    Usage,
    /// Read a JSON request from stdin and print the JSON response
    Exec,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<GatewayConfig> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    let mut config = config.apply_env()?;
    if let Some(base_dir) = &cli.base_dir {
        config.base_dir = base_dir.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_input(from: Option<PathBuf>) -> Result<Vec<u8>> {
    match from {
        Some(path) => tokio::fs::read(&path)
            .await
            .wrap_err_with(|| format!("cannot read {}", path.display())),
        None => {
            let mut data = Vec::new();
            tokio::io::stdin().read_to_end(&mut data).await?;
            Ok(data)
        }
    }
}

/// Returns whether the command succeeded
async fn run(gateway: &Gateway, tenant: &TenantId, command: Commands) -> Result<bool> {
    match command {
        Commands::Stat { path } => print_json(&gateway.stat(tenant, &path).await?)?,
        Commands::Ls { path, all, max } => {
            let options = ListOptions {
                show_hidden: all,
                max_items: max,
            };
            print_json(&gateway.list(tenant, &path, options).await?)?;
        }
        Commands::Cat { path, max_lines } => {
            let result = gateway
                .read_with(tenant, &path, ReadOptions { max_lines })
                .await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&result.content).await?;
            stdout.flush().await?;
            if result.truncated {
                eprintln!("... truncated, {} bytes in total", result.size);
            }
        }
        Commands::Put { path, from } => {
            let data = read_input(from).await?;
            print_json(&gateway.write(tenant, &path, &data).await?)?;
        }
        Commands::Append { path, from } => {
            let data = read_input(from).await?;
            print_json(&gateway.append(tenant, &path, &data).await?)?;
        }
        Commands::Rm { path, recursive } => {
            print_json(&gateway.delete(tenant, &path, recursive).await?)?;
        }
        Commands::Mv { from, to } => print_json(&gateway.r#move(tenant, &from, &to).await?)?,
        Commands::Cp { from, to } => print_json(&gateway.copy(tenant, &from, &to).await?)?,
        Commands::Mkdir { path, no_parents } => {
            print_json(&gateway.create_dir(tenant, &path, !no_parents).await?)?;
        }
        Commands::Find {
            pattern,
            path,
            dirs,
            max,
        } => {
            let mut options = SearchOptions::pattern(pattern).with_max_results(max);
            if dirs {
                options = options.with_directories();
            }
            print_json(&gateway.search(tenant, &path, &options).await?)?;
        }
        Commands::Usage => print_json(&gateway.usage(tenant).await?)?,
        Commands::Exec => {
            let input = read_input(None).await?;
            let request = String::from_utf8_lossy(&input);
            let response = gateway.execute_json(tenant, &request).await;
            print_json(&response)?;
            return Ok(response.ok);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    let gateway = Gateway::open(config).await?;
    let tenant = TenantId::new(cli.tenant.as_str())?;

    match run(&gateway, &tenant, cli.command).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(report) => match report.downcast_ref::<WardenError>() {
            Some(err) => {
                eprintln!("error: {}", err.public());
                std::process::exit(1);
            }
            None => Err(report),
        },
    }
}
