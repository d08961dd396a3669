use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use http::{HeaderMap, Method};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::clock::SystemClock;
use ratewarden::config::{RatewardenConfig, StoreBackend};
use ratewarden::ratelimit::{
    AdmissionRequest, KeyBuilder, Limiter, PolicyDocument, PolicyRegistry, WindowStore,
};
use ratewarden::reload::{spawn_policy_reloader, PolicyReloader};
use ratewarden::response::{apply_decision, Admission};
use ratewarden::store::{MemoryWindowStore, RedisWindowStore};

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Distributed sliding window rate limiter")]
struct Cli {
    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and print the policy table
    Check {
        #[command(flatten)]
        config: ConfigArgs,
        /// Also PING the configured Redis store
        #[arg(long)]
        ping: bool,
    },
    /// Evaluate one request (optionally repeated) and print the outcome
    Admit(AdmitArgs),
    /// Read JSON admission requests from stdin, write JSON decisions to stdout
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Service configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AdmitArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Route pattern, e.g. /api/login
    #[arg(long)]
    route: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Transport peer address
    #[arg(long)]
    ip: Option<IpAddr>,
    /// Raw forwarded-for header value
    #[arg(long)]
    forwarded_for: Option<String>,
    /// Authenticated caller identity
    #[arg(long)]
    identity: Option<String>,
    /// Number of times to evaluate the request
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Check { config, ping } => check(config, ping).await,
        Command::Admit(args) => admit(args).await,
        Command::Serve { config } => serve(config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<RatewardenConfig> {
    let config = match &args.config {
        Some(path) => RatewardenConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RatewardenConfig::default(),
    };
    info!(
        backend = ?config.store.backend,
        policies = ?config.policies.path,
        "Configuration loaded"
    );
    Ok(config)
}

fn load_policies(
    config: &RatewardenConfig,
) -> anyhow::Result<(PolicyRegistry, Option<PolicyDocument>)> {
    config.load_policies().with_context(|| match &config.policies.path {
        Some(path) => format!("loading policies from {}", path.display()),
        None => "loading built-in policies".to_string(),
    })
}

fn build_store(config: &RatewardenConfig) -> anyhow::Result<Box<dyn WindowStore>> {
    let store: Box<dyn WindowStore> = match config.store.backend {
        StoreBackend::Redis => Box::new(
            RedisWindowStore::new(&config.store.url)
                .with_context(|| format!("invalid Redis URL '{}'", config.store.url))?,
        ),
        StoreBackend::Memory => {
            warn!("Using in-process window store; limits are not shared across processes");
            Box::new(MemoryWindowStore::new())
        }
    };
    Ok(store)
}

fn build_limiter(
    config: &RatewardenConfig,
    registry: PolicyRegistry,
) -> anyhow::Result<Limiter<Box<dyn WindowStore>>> {
    let store = build_store(config)?;
    Ok(Limiter::with_key_builder(
        registry,
        store,
        config.guard.to_guard_config(),
        Arc::new(SystemClock::new()),
        KeyBuilder::new(config.store.key_prefix.clone()),
    ))
}

async fn check(args: ConfigArgs, ping: bool) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let (registry, _) = load_policies(&config)?;

    println!("default: {}", registry.default_policy());
    for (pattern, method, policy) in registry.rules() {
        let method = method.map(Method::as_str).unwrap_or("*");
        println!("{:<7} {:<30} {}", method, pattern, policy);
    }

    if ping && config.store.backend == StoreBackend::Redis {
        let store = RedisWindowStore::new(&config.store.url)?;
        let timeout = config
            .guard
            .to_guard_config()
            .timeout
            .max(std::time::Duration::from_secs(1));
        tokio::time::timeout(timeout, store.ping())
            .await
            .context("Redis PING timed out")??;
        println!("redis: ok ({})", config.store.url);
    }

    Ok(())
}

async fn admit(args: AdmitArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let (registry, _) = load_policies(&config)?;
    let limiter = build_limiter(&config, registry)?;

    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{}'", args.method))?;
    let mut request = AdmissionRequest::new(args.route, method);
    request.peer_ip = args.ip;
    request.forwarded_for = args.forwarded_for;
    request.identity = args.identity;

    for _ in 0..args.repeat.max(1) {
        let decision = limiter.admit(&request).await;
        let mut headers = HeaderMap::new();
        let admission = apply_decision(&decision, &mut headers);

        for (name, value) in &headers {
            println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
        }
        match admission {
            Admission::Proceed => println!("proceed {}", serde_json::to_string(&decision)?),
            Admission::Reject(rejection) => {
                println!("{} {}", rejection.status, rejection.body_json())
            }
        }
    }

    Ok(())
}

async fn serve(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let (registry, document) = load_policies(&config)?;
    let limiter = Arc::new(build_limiter(&config, registry)?);

    let reloader = match (&config.policies.path, config.reload_interval()) {
        (Some(path), Some(interval)) => {
            info!(
                path = %path.display(),
                interval_secs = interval.as_secs(),
                "Policy reloading enabled"
            );
            Some(spawn_policy_reloader(
                Arc::clone(&limiter),
                PolicyReloader::new(path, document),
                interval,
            ))
        }
        _ => None,
    };

    info!("Ratewarden ready, reading admission requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("End of input");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<AdmissionRequest>(&line) {
            Ok(request) => serde_json::to_string(&limiter.admit(&request).await)?,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed admission request");
                serde_json::json!({ "error": e.to_string() }).to_string()
            }
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    if let Some(handle) = reloader {
        handle.abort();
    }
    info!("Ratewarden stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
