use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dropshelf_core::CredentialStore;
use dropshelf_server::{
    create_app,
    infra::{
        config::{Config, ConfigLoader},
        startup,
    },
};

#[derive(Parser, Debug)]
#[command(name = "dropshelf-server")]
#[command(about = "Self-hosted file sharing with live directory sync")]
struct Cli {
    /// Path to dropshelf.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// List users and their privilege
    List,
    /// Add a user or replace their password
    Add {
        name: String,
        password: String,
        /// Grant user management rights
        #[arg(long)]
        privileged: bool,
    },
    /// Remove a user and their sessions
    Del { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command {
        Some(Command::User { action }) => run_user_command(&config, action).await,
        None => run_server(config).await,
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let load = loader.load().context("failed to load configuration")?;
    let mut config = load.config;

    if let Some(port) = cli.serve.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.serve.host {
        config.server.host = host.clone();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dropshelf_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in &load.warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.bind_address()))?;
    info!(files = %config.files_dir().display(), "serving files");

    let state = startup::build_state(config).await?;
    let hub = state.hub.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn run_user_command(config: &Config, action: UserCommand) -> anyhow::Result<()> {
    let store = CredentialStore::open(&config.storage.store_path)
        .await
        .context("failed to open credential store")?;

    match action {
        UserCommand::List => {
            for (name, privileged) in store.list_users() {
                let role = if privileged { "privileged" } else { "user" };
                println!("{name}\t{role}");
            }
        }
        UserCommand::Add {
            name,
            password,
            privileged,
        } => {
            if name.is_empty() || password.is_empty() {
                bail!("user name and password must not be empty");
            }
            store.add_or_update_user(&name, &password, privileged).await?;
            info!(user = %name, privileged, "user saved");
        }
        UserCommand::Del { name } => {
            if !store.remove_user(&name).await? {
                bail!("no such user: {name}");
            }
            info!(user = %name, "user removed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
