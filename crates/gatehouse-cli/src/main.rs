use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gatehouse_core::clock::SystemClock;
use gatehouse_core::config::{Config, LoggingConfig};
use gatehouse_core::file_store::LockOptions;
use gatehouse_core::protocol::InterruptStatus;
use gatehouse_core::token_store::TokenStore;
use gatehouse_gateway::GatewayState;
use gatehouse_gateway::events::EventBus;
use gatehouse_gateway::executor::BuiltinExecutor;
use gatehouse_gateway::hooks::HookRegistry;
use gatehouse_gateway::interrupts::ToolInterruptManager;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "gatehouse",
    about = "Gateway control plane with admission control and durable tool interrupts",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Manage issued access tokens
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Inspect tool interrupts
    Interrupts {
        #[command(subcommand)]
        action: InterruptAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a token; the plaintext is printed once
    Issue {
        subject: String,
        #[arg(long, default_value = "operator")]
        role: String,
        /// Scope to grant (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Lifetime in seconds (default: no expiry)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Revoke a token by id
    Revoke { jti: String },
    /// List tokens
    List,
    /// Remove tokens that are both expired and revoked
    Prune,
}

#[derive(Subcommand)]
enum InterruptAction {
    /// List interrupts, newest first
    List {
        /// Only show pending interrupts
        #[arg(long)]
        pending: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (secrets redacted)
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Gateway { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid configuration: {}", errors.join("; "));
            }
            tracing::info!(config = %config_path.display(), "Starting Gatehouse gateway on port {port}");

            let state = GatewayState::new(
                config,
                Arc::new(BuiltinExecutor),
                Arc::new(HookRegistry::new()),
                SystemClock::shared(),
            );
            gatehouse_gateway::start_gateway(state, port).await?;
        }
        Commands::Tokens { action } => {
            let store = TokenStore::new(
                config.tokens_path(),
                LockOptions::from_config(&config.store()),
                SystemClock::shared(),
            );
            run_tokens(&store, action).await?;
        }
        Commands::Interrupts { action } => match action {
            InterruptAction::List { pending } => {
                let interrupts = ToolInterruptManager::new(
                    config.interrupts_path(),
                    config.interrupts(),
                    LockOptions::from_config(&config.store()),
                    SystemClock::shared(),
                    Arc::new(EventBus::new(1, Arc::new(HookRegistry::new()))),
                );
                let mut all = interrupts.list().await?;
                if pending {
                    all.retain(|i| i.status == InterruptStatus::Pending);
                }
                if all.is_empty() {
                    println!("No interrupts.");
                }
                for i in all {
                    println!(
                        "{}  {:<8}  run={} session={} tool_call={}  created {}  expires {}",
                        i.approval_request_id,
                        format!("{:?}", i.status).to_lowercase(),
                        i.binding.run_id,
                        i.binding.session_id,
                        i.binding.tool_call_id,
                        human_time(i.created_at_ms),
                        human_time(i.expires_at_ms),
                    );
                }
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn run_tokens(store: &TokenStore, action: TokenAction) -> anyhow::Result<()> {
    match action {
        TokenAction::Issue {
            subject,
            role,
            scopes,
            ttl_secs,
        } => {
            let ttl_ms = ttl_secs.map(|s| s.saturating_mul(1_000));
            let issued = store.issue(&subject, &role, scopes, ttl_ms).await?;
            println!("jti:   {}", issued.metadata.jti);
            println!("token: {}", issued.token);
            println!("Store this token now; it cannot be shown again.");
        }
        TokenAction::Revoke { jti } => match store.revoke(&jti).await? {
            Some(meta) => println!(
                "Revoked {} ({}) at {}",
                meta.jti,
                meta.subject,
                meta.revoked_at_ms.map(human_time).unwrap_or_default()
            ),
            None => anyhow::bail!("no token with id {jti}"),
        },
        TokenAction::List => {
            let tokens = store.list().await?;
            if tokens.is_empty() {
                println!("No tokens.");
            }
            for t in tokens {
                let state = if t.is_revoked() {
                    "revoked".to_string()
                } else {
                    match t.expires_at_ms {
                        Some(exp) => format!("expires {}", human_time(exp)),
                        None => "active".to_string(),
                    }
                };
                println!(
                    "{}  {:<16} {:<10} [{}]  issued {}  {}",
                    t.jti,
                    t.subject,
                    t.role,
                    t.scopes.join(","),
                    human_time(t.issued_at_ms),
                    state
                );
            }
        }
        TokenAction::Prune => {
            let removed = store.prune().await?;
            println!("Pruned {removed} token(s).");
        }
    }
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over config; `-v` raises the default to debug.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let directives = std::iter::once(level)
        .chain(logging.map(|l| l.filters.clone()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

fn human_time(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Copy of `config` with inline secrets masked.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(auth) = config.gateway.as_mut().and_then(|g| g.auth.as_mut()) {
        if auth.token.is_some() {
            auth.token = Some("***".into());
        }
        if auth.password.is_some() {
            auth.password = Some("***".into());
        }
    }
    config
}
