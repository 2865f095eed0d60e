//! modhost operator CLI
//!
//! Usage:
//!   modhost [--config <file>] serve [--listen <addr>]
//!   modhost [--config <file>] add <ref> [--kind plugin|engine] [--force]
//!   modhost [--config <file>] remove <ref> [--kind plugin|engine]
//!   modhost [--config <file>] list [--kind plugin|engine] [--remote [--server <addr>]]
//!
//! `<ref>` is a registry name, an absolute path to local module content, or
//! an inline JSON declaration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modhost::module::{
    CommandBundler, CommandPackageManager, ModuleClient, ModuleKind, ModuleRef, ModuleServer,
    ModuleStore,
};
use modhost::utils::init_logging_from_config;
use modhost::{HostConfig, LoggingConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "modhost", about = "Dynamic module host", version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override server.work_dir
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Log filter (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the module server
    Serve {
        /// Override server.listen_addr
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Materialize a module
    Add {
        module: String,
        #[arg(long, default_value = "plugin")]
        kind: ModuleKind,
        /// Rebuild even if an artifact exists
        #[arg(long)]
        force: bool,
    },
    /// Remove a materialized module
    Remove {
        module: String,
        #[arg(long, default_value = "plugin")]
        kind: ModuleKind,
    },
    /// List built artifacts
    List {
        #[arg(long, default_value = "plugin")]
        kind: ModuleKind,
        /// Ask a running server, using the [client] section
        #[arg(long)]
        remote: bool,
        /// Override client.server_addr
        #[arg(long, requires = "remote")]
        server: Option<String>,
    },
}

fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match cli.config {
        Some(ref path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };
    if let Some(ref work_dir) = cli.work_dir {
        config.server.work_dir = work_dir.clone();
    }
    if let Some(ref filter) = cli.log_level {
        config
            .logging
            .get_or_insert_with(LoggingConfig::default)
            .filter = Some(filter.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_store(config: &HostConfig) -> ModuleStore {
    let server = &config.server;
    ModuleStore::new(
        server.work_dir.clone(),
        server.local_modules_dir.clone(),
        Arc::new(CommandPackageManager::new(&server.package_manager)),
        Arc::new(CommandBundler::new(&server.bundler).with_cwd(&server.work_dir)),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging_from_config(config.logging.as_ref());

    let store = build_store(&config);

    match cli.command {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or(config.server.listen_addr);
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Serving modules from {:?}", config.server.work_dir);
            let server = ModuleServer::new(Arc::new(store));
            tokio::select! {
                served = server.serve(listener) => served?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
        Command::Add {
            module,
            kind,
            force,
        } => {
            let module: ModuleRef = module.parse()?;
            if force {
                store.remove_materialized(&module, kind).await?;
            }
            let artifact = store.ensure_materialized(&module, kind).await?;
            println!(
                "{} {} -> {} (client: {})",
                kind,
                module.key(),
                artifact.path.display(),
                artifact.has_client
            );
        }
        Command::Remove { module, kind } => {
            let module: ModuleRef = module.parse()?;
            store.remove_materialized(&module, kind).await?;
            println!("removed {} {}", kind, module.key());
        }
        Command::List {
            kind,
            remote: false,
            ..
        } => {
            for name in store.list_artifacts(kind).await? {
                println!("{}", name);
            }
        }
        Command::List { kind, server, .. } => {
            let mut client_config = config.client.clone();
            if let Some(server) = server {
                client_config.server_addr = server;
            }
            if client_config.offline {
                anyhow::bail!("client.offline is set; there is no server to ask");
            }
            let (client, transport) = ModuleClient::from_config(&client_config);
            client.spawn();
            let method = match kind {
                ModuleKind::Engine => "listEngines",
                ModuleKind::Plugin => "listPlugins",
            };
            let listed = transport
                .request(method, Value::Null)
                .await
                .with_context(|| format!("Failed to list from {}", client_config.server_addr))?;
            for name in listed.as_array().into_iter().flatten() {
                println!("{}", name.as_str().unwrap_or_default());
            }
        }
    }

    Ok(())
}
