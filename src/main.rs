use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use plugin_host::config::HostConfig;
use plugin_host::paths::PathProvider;
use plugin_host::plugin::extism_host::ExtismHost;
use plugin_host::plugin::{LocalizationCatalog, PluginId, PluginManager};

#[derive(Parser)]
#[command(name = "plugin-host")]
#[command(about = "Reference host for .afp plugin packages")]
#[command(version)]
struct Cli {
    /// Config file layered over the defaults and the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists discovered plugins and their state
    List,
    /// Stages a package for installation at the next start
    Install {
        /// Path to an .afp package
        package: PathBuf,
    },
    /// Unloads, disables, and stages removal of a plugin
    Uninstall {
        #[arg(value_parser = parse_id)]
        id: PluginId,
    },
    Enable {
        #[arg(value_parser = parse_id)]
        id: PluginId,
    },
    Disable {
        #[arg(value_parser = parse_id)]
        id: PluginId,
    },
    /// Shows staged operations without applying them
    Pending,
}

fn parse_id(raw: &str) -> std::result::Result<PluginId, String> {
    let id = PluginId::new(raw);
    id.validate().map_err(|err| err.to_string())?;
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HostConfig::load(cli.config.as_deref())?;

    // Initialize logging to file (stdout carries command output)
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "plugin-host.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .init();

    tracing::info!(root = %config.root().display(), "plugin-host starting");

    let catalog = Arc::new(LocalizationCatalog::new());
    let manager = PluginManager::new(
        Arc::new(config.clone()),
        Arc::new(ExtismHost::default()),
        catalog,
    )
    .context("initializing plugin manager")?;
    let cancel = CancellationToken::new();

    if let Commands::Pending = cli.command {
        return print_pending(&manager).await;
    }

    // Staged operations must land before anything is discovered.
    match manager.installer().execute_pending(&cancel).await {
        Ok(0) => {}
        Ok(applied) => println!("applied {applied} pending plugin operation(s)"),
        Err(err) => eprintln!("warning: pending plugin operations failed, will retry: {err}"),
    }

    if let Err(err) = manager.load_all(&cancel).await {
        tracing::error!("plugin loading aborted: {err}");
        eprintln!("warning: plugin loading aborted: {err}");
    }
    for notice in manager.error_notifications() {
        eprintln!("{notice}");
    }

    let result = run(&manager, cli.command, &cancel).await;

    manager.shutdown(config.unload_timeout()).await;
    tracing::info!("plugin-host stopped");
    result
}

async fn run(manager: &PluginManager, command: Commands, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::List => {
            for plugin in manager.plugins() {
                let loaded = if manager.is_loaded(&plugin.id) {
                    "loaded"
                } else {
                    "-"
                };
                println!(
                    "{:<24} {:<10} {:<10} {:<7} {}",
                    plugin.id.to_string(),
                    plugin.version.to_string(),
                    plugin.status.to_string(),
                    loaded,
                    plugin.name
                );
            }
            println!("{}", manager.summary_notification());
        }
        Commands::Install { package } => {
            let operation = manager
                .schedule_install(&package)
                .await
                .with_context(|| format!("scheduling install of {}", package.display()))?;
            println!(
                "install of {} scheduled, it takes effect on the next start",
                operation.plugin_id
            );
        }
        Commands::Uninstall { id } => {
            manager.uninstall(&id, cancel).await?;
            println!("uninstall of {id} scheduled, it takes effect on the next start");
        }
        Commands::Enable { id } => {
            manager.enable(&id).await?;
            println!("{id} enabled");
        }
        Commands::Disable { id } => {
            manager.disable(&id).await?;
            println!("{id} disabled");
        }
        Commands::Pending => print_pending(manager).await?,
    }

    Ok(())
}

async fn print_pending(manager: &PluginManager) -> Result<()> {
    let pending = manager.installer().pending().await?;
    if pending.is_empty() {
        println!("no pending plugin operations");
    }
    for operation in pending {
        println!(
            "{} {:?} {} -> {}",
            operation.scheduled_at_utc.to_rfc3339(),
            operation.kind,
            operation.plugin_id,
            operation.destination_path.display()
        );
    }
    Ok(())
}
