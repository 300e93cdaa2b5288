//! Tollgate daemon and operator CLI.
//!
//! `tollgate` (or `tollgate serve`) runs the broker. The other subcommands
//! validate configuration and manage secrets in writable providers.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use tollgate_daemon::audit::FileAuditLog;
use tollgate_daemon::clock::SystemClock;
use tollgate_daemon::config::BrokerConfig;
use tollgate_daemon::dispatcher::Dispatcher;
use tollgate_daemon::paths::Paths;
use tollgate_daemon::proxy::{self, ProxyState};
use tollgate_daemon::server::Server;
use tollgate_daemon::tools::ToolRegistry;
use tollgate_secrets::providers::generate_master_key;
use tollgate_secrets::{ReadEnv, SecretStore, SharedEnv, SystemEnv};

#[derive(Parser, Debug)]
#[command(name = "tollgate", author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker (default)
    Serve,

    /// Validate configuration and check provider health
    Check,

    /// Manage secrets in a writable provider
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },

    /// Print a fresh base64 master key for the local provider
    Keygen,
}

#[derive(Subcommand, Debug)]
enum SecretCommand {
    /// Store a secret read from stdin
    Set {
        /// Secret reference, e.g. `local://stripe/api-key`
        reference: String,
    },

    /// Delete a secret
    Rm {
        /// Secret reference, e.g. `local://stripe/api-key`
        reference: String,
    },

    /// List secret paths
    Ls {
        /// Provider name (default: the configured default provider)
        provider: Option<String>,
    },
}

/// Initializes structured logging with tracing.
///
/// Supports two output formats via `TOLLGATE_LOG_FORMAT` environment variable:
/// - `json`: Machine-readable JSON logs
/// - `pretty`: Human-readable formatted logs (default)
///
/// Log level is controlled via `RUST_LOG` environment variable. Logs go to
/// stderr so stdout stays clean for CLI output.
fn init_tracing(env: &dyn ReadEnv) {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = env
        .var("TOLLGATE_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tollgate_daemon=info,tollgate_secrets=info,tollgate_client=info,tollgate=info")
    });

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
    }
}

/// Loaded configuration and resolved paths shared by every subcommand.
struct Setup {
    config_path: PathBuf,
    config: BrokerConfig,
    env: SharedEnv,
    paths: Paths,
}

impl Setup {
    fn load(explicit: Option<&Path>) -> Result<Self> {
        let env: SharedEnv = Arc::new(SystemEnv);
        let config_path = BrokerConfig::config_path(explicit, &env)?;
        let config = BrokerConfig::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let paths = Paths::resolve(&*env).context("Cannot determine the data directory")?;

        Ok(Self {
            config_path,
            config,
            env,
            paths,
        })
    }

    fn store(&self, config: &BrokerConfig) -> Result<Arc<SecretStore>> {
        let registry = config.build_registry(&self.env, &self.paths.state_dir)?;
        config.validate_references(&registry)?;
        Ok(Arc::new(SecretStore::new(Arc::new(registry))))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&SystemEnv);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Keygen => {
            let key = generate_master_key()?;
            println!("{}", key.expose_secret());
            Ok(())
        }
        Command::Serve => serve(Setup::load(cli.config.as_deref())?).await,
        Command::Check => check(&Setup::load(cli.config.as_deref())?).await,
        Command::Secret { action } => secret(&Setup::load(cli.config.as_deref())?, action).await,
    }
}

async fn check(ctx: &Setup) -> Result<()> {
    let store = ctx.store(&ctx.config)?;
    println!(
        "{}: {} provider(s), {} service(s), {} capability(ies)",
        ctx.config_path.display(),
        ctx.config.providers.len(),
        ctx.config.services.len(),
        ctx.config.capabilities.len(),
    );

    let registry = store.registry();
    let mut healthy = true;
    if let Err(e) = registry.initialize_all().await {
        println!("initialization failed: {e}");
        healthy = false;
    }
    for (name, result) in registry.health().await {
        match result {
            Ok(()) => println!("provider {name}: ok"),
            Err(e) => {
                println!("provider {name}: {e}");
                healthy = false;
            }
        }
    }
    registry.dispose_all().await;

    if !healthy {
        bail!("One or more providers are unhealthy");
    }
    Ok(())
}

async fn secret(ctx: &Setup, action: SecretCommand) -> Result<()> {
    let store = ctx.store(&ctx.config)?;
    let registry = store.registry();

    match action {
        SecretCommand::Set { reference } => {
            let reference = registry.parse_reference(&reference)?;
            let provider = registry.get(reference.provider())?;
            provider.initialize().await?;

            let mut value = String::new();
            std::io::stdin()
                .read_to_string(&mut value)
                .context("Failed to read secret from stdin")?;
            let value = value.trim_end_matches(['\r', '\n']);
            if value.is_empty() {
                bail!("Refusing to store an empty secret");
            }

            provider
                .set_secret(reference.path(), reference.field(), &SecretString::from(value.to_string()))
                .await?;
            println!("Stored {reference}");
        }
        SecretCommand::Rm { reference } => {
            let reference = registry.parse_reference(&reference)?;
            let provider = registry.get(reference.provider())?;
            provider.initialize().await?;

            if provider.delete_secret(reference.path()).await? {
                println!("Removed {reference}");
            } else {
                bail!("Secret {reference} not found");
            }
        }
        SecretCommand::Ls { provider } => {
            let name = provider.unwrap_or_else(|| registry.default_provider().to_string());
            let provider = registry.get(&name)?;
            provider.initialize().await?;

            let mut paths = provider.list_secrets().await?;
            paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            for path in paths {
                println!("{name}://{}", path.as_str());
            }
        }
    }

    registry.dispose_all().await;
    Ok(())
}

/// Re-reads the configuration and swaps it in, keeping the old one on error.
async fn reload(ctx: &Setup, dispatcher: &Dispatcher) -> Result<usize> {
    let config = BrokerConfig::load(&ctx.config_path)?;
    let store = ctx.store(&config)?;
    store.registry().initialize_all().await?;
    Ok(dispatcher.reload(config, store)?)
}

fn create_private_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

async fn serve(ctx: Setup) -> Result<()> {
    info!("Starting tollgate");
    let ctx = Arc::new(ctx);

    create_private_dir(&ctx.paths.state_dir)?;
    let store = ctx.store(&ctx.config)?;
    store.registry().initialize_all().await?;

    let audit = FileAuditLog::new(ctx.paths.audit_dir())?;
    info!(dir = %audit.dir().display(), "Audit log ready");

    let dispatcher = Arc::new(Dispatcher::new(
        ctx.config.clone(),
        store,
        Arc::new(audit),
        Arc::new(SystemClock),
    )?);
    info!(
        capabilities = ctx.config.capabilities.len(),
        services = ctx.config.services.len(),
        "Loaded configuration"
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    // Signals: SIGTERM/SIGINT shut down, SIGHUP reloads the configuration
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    {
        let shutdown_tx = shutdown_tx.clone();
        let dispatcher = Arc::clone(&dispatcher);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            use futures::stream::StreamExt;
            while let Some(signal) = signals.next().await {
                match signal {
                    SIGHUP => {
                        info!("Received SIGHUP, reloading configuration");
                        match reload(&ctx, &dispatcher).await {
                            Ok(revoked) => info!(revoked, "Reload complete"),
                            Err(e) => error!("Reload failed, keeping current configuration: {e:#}"),
                        }
                    }
                    SIGTERM | SIGINT => {
                        info!(signal, "Received shutdown signal, initiating graceful shutdown");
                        let _ = shutdown_tx.send(());
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    // Periodic sweep of expired sessions
    {
        let dispatcher = Arc::clone(&dispatcher);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(ctx.config.settings.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.sweep_sessions() {
                            warn!(error = %e, "Session sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    let proxy_listener = proxy::bind(ctx.config.settings.proxy_addr()?).await?;
    let proxy = proxy::serve(
        proxy_listener,
        ProxyState {
            dispatcher: Arc::clone(&dispatcher),
        },
        shutdown_tx.subscribe(),
    );

    let server = Arc::new(Server::new(
        Arc::new(ToolRegistry::with_broker_tools(&dispatcher)),
        Arc::clone(&dispatcher),
        ctx.paths.socket_path(),
        shutdown_tx.clone(),
    ));

    info!("Tollgate ready");
    let result = tokio::try_join!(server.run(), proxy);
    let _ = shutdown_tx.send(());

    match dispatcher.runtime() {
        Ok(runtime) => runtime.store.registry().dispose_all().await,
        Err(e) => warn!(error = %e, "Skipping provider disposal"),
    }

    result?;
    info!("Tollgate shutdown complete");
    Ok(())
}
