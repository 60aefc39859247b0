use std::sync::Arc;

use anyhow::{bail, Context, Error};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warbler_backend::settings::{LoggerSettings, ServerKind, Settings};
use warbler_backend::store::{SqlStoreBackend, StoreHandle, User};
use warbler_inbound::session::ClientSession;
use warbler_services::registry::SessionRegistry;

#[derive(Parser)]
#[command(name = "warbler", version, about = "An XMPP instant-messaging server")]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "/etc/warbler/warbler.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update a user account
    AddUser { username: String, password: String },
    /// Delete a user account
    RemoveUser { username: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("warbler: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("could not load configuration from {}", cli.config))?;
    init_logger(&settings.logger)?;

    let backend = SqlStoreBackend::new(&settings.storage)
        .await
        .context("could not open the storage backend")?;
    let store = StoreHandle::new(backend);

    match cli.command {
        Some(Commands::AddUser { username, password }) => {
            store
                .insert_or_update_user(User {
                    username: username.to_lowercase(),
                    password,
                })
                .await?;
            Ok(())
        }
        Some(Commands::RemoveUser { username }) => {
            store.delete_user(&username.to_lowercase()).await?;
            Ok(())
        }
        None => serve(settings, store).await,
    }
}

async fn serve(settings: Settings, store: StoreHandle) -> Result<(), Error> {
    if settings.servers.is_empty() {
        bail!("couldn't find a server configuration");
    }
    if let Some(pid_path) = &settings.pid_path {
        std::fs::write(pid_path, std::process::id().to_string())
            .with_context(|| format!("could not write PID file {pid_path}"))?;
    }
    if let Some(debug_settings) = &settings.debug {
        warn!(port = debug_settings.port, "debug endpoint configured but not supported");
    }

    let registry = Arc::new(SessionRegistry::new(settings.c2s.domains.clone()));

    let mut listeners = Vec::new();
    for server in &settings.servers {
        if server.kind != ServerKind::C2s {
            warn!(id = %server.id, "skipping non-c2s server; s2s is not implemented");
            continue;
        }
        let cfg = Arc::new(server.clone());
        let listener =
            TcpListener::bind((cfg.transport.bind.as_str(), cfg.transport.port))
                .await
                .with_context(|| {
                    format!("could not bind {}:{}", cfg.transport.bind, cfg.transport.port)
                })?;
        info!(
            id = %cfg.id,
            bind = %cfg.transport.bind,
            port = cfg.transport.port,
            "listening for client connections"
        );

        let registry = registry.clone();
        let store = store.clone();
        listeners.push(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                info!(%peer, "accepted connection");

                let cfg = cfg.clone();
                let registry = registry.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    let mut session = ClientSession::new(socket, cfg, registry, store);
                    session.handle().await;
                });
            }
        }));
    }

    if listeners.is_empty() {
        bail!("no c2s server could be started");
    }
    for listener in listeners {
        listener.await?;
    }
    Ok(())
}

fn init_logger(cfg: &LoggerSettings) -> Result<(), Error> {
    let filter =
        EnvFilter::try_new(&cfg.level).with_context(|| format!("bad log level: {}", cfg.level))?;
    match &cfg.log_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("could not open log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
