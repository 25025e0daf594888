use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, ArgAction, CommandFactory, FromArgMatches};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hvym_tunnel::auth::{Ed25519Signer, Signer};
use hvym_tunnel::config::{Config, ConfigFile, TunnelConfig};
use hvym_tunnel::tunnel::TunnelClient;

/// Default config file name.
const DEFAULT_CONFIG: &str = "hvym-tunnel.toml";

/// How long a stopping client gets to close its connection.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the full clap command: Config args + subcommands.
fn build_command() -> clap::Command {
    Config::command()
        .subcommand(
            clap::Command::new("connect").about("Start the tunnel even when auto_connect is off"),
        )
        .subcommand(
            clap::Command::new("keygen")
                .about("Generate a new Ed25519 keypair")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing key file"),
                ),
        )
        .subcommand(clap::Command::new("identity").about("Print the client identity"))
        .subcommand(clap::Command::new("status").about("Show persisted tunnel settings"))
        .subcommand(
            clap::Command::new("bind")
                .about("Persist a service=port binding in the config file")
                .arg(Arg::new("service").required(true))
                .arg(
                    Arg::new("port")
                        .required(true)
                        .value_parser(clap::value_parser!(u16)),
                ),
        )
        .subcommand(
            clap::Command::new("unbind")
                .about("Remove a persisted binding")
                .arg(Arg::new("service").required(true)),
        )
}

fn config_path() -> PathBuf {
    std::env::var("HVYM_TUNNEL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG))
}

fn load_config_file(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }
    match ConfigFile::load(path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("  WARNING: failed to load {}: {}", path.display(), e);
            ConfigFile::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls CryptoProvider"))?;

    // Load config file as env-var defaults (before clap parsing)
    let path = config_path();
    let file = load_config_file(&path);
    file.inject_env();

    let matches = build_command().get_matches();
    let config = Config::from_arg_matches(&matches)?;

    match matches.subcommand() {
        Some(("keygen", sub_m)) => cmd_keygen(&config, sub_m.get_flag("force")),
        Some(("identity", _)) => cmd_identity(&config),
        Some(("status", _)) => cmd_status(&path, &file, &config),
        Some(("bind", sub_m)) => {
            let service = sub_m
                .get_one::<String>("service")
                .context("missing service")?
                .clone();
            let port = *sub_m.get_one::<u16>("port").context("missing port")?;
            ConfigFile::update(&path, |f| f.set_binding(&service, port))?;
            println!("{service} -> 127.0.0.1:{port}");
            Ok(())
        }
        Some(("unbind", sub_m)) => {
            let service = sub_m
                .get_one::<String>("service")
                .context("missing service")?
                .clone();
            ConfigFile::update(&path, |f| f.remove_binding(&service))?;
            Ok(())
        }
        Some(("connect", _)) => run_tunnel(config, &path).await,
        Some((other, _)) => anyhow::bail!("unknown subcommand: {other}"),
        None => {
            if file.auto_connect == Some(false) {
                eprintln!("auto_connect is off; run `hvym-tunnel connect` to start the tunnel");
                return Ok(());
            }
            run_tunnel(config, &path).await
        }
    }
}

fn cmd_keygen(config: &Config, force: bool) -> anyhow::Result<()> {
    if config.key_file.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            config.key_file.display()
        );
    }
    let signer = Ed25519Signer::generate();
    signer
        .save(&config.key_file)
        .with_context(|| format!("failed to write {}", config.key_file.display()))?;
    println!("{}", signer.identity());
    Ok(())
}

fn cmd_identity(config: &Config) -> anyhow::Result<()> {
    let signer = load_signer(config)?;
    println!("{}", signer.identity());
    Ok(())
}

fn cmd_status(path: &Path, file: &ConfigFile, config: &Config) -> anyhow::Result<()> {
    println!("config file:    {}", path.display());
    match Ed25519Signer::load(&config.key_file) {
        Ok(signer) => println!("identity:       {}", signer.identity()),
        Err(_) => println!("identity:       (no key at {})", config.key_file.display()),
    }
    println!("relay:          {}", config.server_url);
    if file.is_configured() {
        println!("relay identity: {}", config.server_address);
    } else {
        println!("relay identity: (learned on first connect)");
    }
    println!("enabled:        {}", file.is_enabled());
    println!("auto_connect:   {}", file.auto_connect.unwrap_or(true));
    println!("services:       {}", config.services.join(", "));
    for binding in &config.bindings {
        println!("binding:        {} -> 127.0.0.1:{}", binding.service, binding.port);
    }
    if let Some(endpoint) = &file.last_endpoint {
        println!("last endpoint:  {endpoint}");
    }
    Ok(())
}

fn load_signer(config: &Config) -> anyhow::Result<Ed25519Signer> {
    Ed25519Signer::load(&config.key_file).with_context(|| {
        format!(
            "failed to load key from {} (run `hvym-tunnel keygen` first)",
            config.key_file.display()
        )
    })
}

/// Write a change to the config file, logging instead of failing.
fn persist(path: &Path, f: impl FnOnce(&mut ConfigFile)) {
    if let Err(e) = ConfigFile::update(path, f) {
        warn!(error = %e, path = %path.display(), "failed to update config file");
    }
}

/// Something the running tunnel learned that belongs in the config file.
#[derive(Debug)]
enum FileUpdate {
    Endpoint(String),
    /// Kept only while no relay identity is configured.
    ServerAddress(String),
}

impl FileUpdate {
    fn apply(self, file: &mut ConfigFile) {
        match self {
            FileUpdate::Endpoint(url) => file.last_endpoint = Some(url),
            FileUpdate::ServerAddress(address) => {
                if !file.is_configured() && !address.is_empty() {
                    file.server_address = Some(address);
                }
            }
        }
    }
}

/// Apply updates on the blocking pool until every sender is gone.
fn spawn_persister(
    path: PathBuf,
    mut updates: mpsc::UnboundedReceiver<FileUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let path = path.clone();
            let write = tokio::task::spawn_blocking(move || persist(&path, |f| update.apply(f)));
            if let Err(e) = write.await {
                error!(error = %e, "config file writer failed");
            }
        }
    })
}

/// Run the tunnel until Ctrl+C / SIGTERM.
async fn run_tunnel(config: Config, path: &Path) -> anyhow::Result<()> {
    init_tracing(&config);

    let file = load_config_file(path);
    if !file.is_enabled() {
        warn!(path = %path.display(), "tunnel is disabled in the config file");
        return Ok(());
    }

    let signer = load_signer(&config)?;
    let mut client = TunnelClient::new(TunnelConfig::from(&config), Arc::new(signer))?;
    for binding in &config.bindings {
        client.bind_port(binding.service.clone(), binding.port);
    }

    if !file.is_configured() && config.server_address.is_empty() {
        info!("relay identity not configured, will accept the one announced on first contact");
    }

    let (updates, update_rx) = mpsc::unbounded_channel();
    let persister = spawn_persister(path.to_path_buf(), update_rx);

    let tx = updates.clone();
    client.on_endpoint_ready(move |url| {
        info!(url, "public endpoint ready");
        let _ = tx.send(FileUpdate::Endpoint(url.to_string()));
    });
    client.on_connected(move |endpoint| {
        let _ = updates.send(FileUpdate::ServerAddress(endpoint.server_address.clone()));
    });

    let (handle, mut task) = client.spawn();

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("shutdown signal received, disconnecting...");
            handle.disconnect();
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("tunnel did not stop in time");
                task.abort();
            }
        }
        result = &mut task => {
            if let Err(e) = result {
                error!(error = %e, "tunnel task failed");
            }
            anyhow::bail!("tunnel stopped unexpectedly");
        }
    }

    // The callbacks hold the senders; once the client is gone the queue drains
    if tokio::time::timeout(STOP_TIMEOUT, persister).await.is_err() {
        warn!("config file updates did not finish in time");
    }
    if path.exists() {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || persist(&path, |f| f.last_endpoint = None)).await?;
    }
    info!("tunnel client stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
}
