//! Launchpad relay
//!
//! Operator entry point for the relay layer and the scheduled automation
//! engines.
//!
//! ## Commands
//!
//! - **run**: automation passes on the configured cadence until ctrl-c
//! - **once**: a single pass per configured kind, summary printed as JSON
//! - **status**: one confirmation poll loop for a submitted id
//! - **engines**: the resolved engine order and endpoints

#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use launchpad_relay::automation::{
    AutomationKind, ExecutionOrchestrator, HttpPriceOracle, InstallationKeyStore, KdfParams, NoOracle,
    OrchestratorDeps, PriceOracle, RpcChainClient, VenueTransactionFactory,
};
use launchpad_relay::config::{AutomationConfig, RelayConfig};
use launchpad_relay::endpoints;
use launchpad_relay::ledger::LedgerStore;
use launchpad_relay::relay::confirmation::HttpStatusSource;
use launchpad_relay::relay::{
    BackoffPolicy, EngineKey, EngineRegistry, FailoverCoordinator, HttpRelayTransport, RelayTransport, Submitter,
};
use launchpad_relay::structured_logging::StructuredLogger;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the automation configuration file
    #[arg(short, long, default_value = "automation.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run automation passes on the configured cadence
    Run,
    /// Run one pass and print its summary
    Once {
        /// Restrict to one kind (liquidity_top_up, fee_harvest, token_burn)
        #[arg(long)]
        kind: Option<String>,
    },
    /// Poll an engine's status endpoint for a submitted id
    Status {
        #[arg(long)]
        engine: String,
        #[arg(long)]
        id: String,
    },
    /// Print the resolved engine order
    Engines,
}

/// Relay-side components, built once
struct RelayStack {
    config: RelayConfig,
    registry: Arc<EngineRegistry>,
    transport: Arc<dyn RelayTransport>,
    coordinator: Arc<FailoverCoordinator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs)?;

    info!("Starting launchpad-relay {}", env!("CARGO_PKG_VERSION"));

    let relay = build_relay_stack()?;

    match &args.command {
        Command::Engines => print_engines(&relay),
        Command::Status { engine, id } => check_status(&relay, engine, id).await,
        Command::Once { kind } => {
            let automation = load_automation_config(&args.config)?;
            let kinds = match kind {
                Some(raw) => vec![parse_kind(raw)?],
                None => automation.schedule.kinds.clone(),
            };
            let orchestrator = build_orchestrator(&automation, &relay)?;
            for kind in kinds {
                let summary = orchestrator.run_pass(kind, None).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            orchestrator.store().flush().await?;
            Ok(())
        }
        Command::Run => {
            let automation = load_automation_config(&args.config)?;
            let shutdown = CancellationToken::new();
            let port = args
                .metrics_port
                .or(automation.monitoring.enable_metrics.then_some(automation.monitoring.metrics_port));
            if let Some(port) = port {
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = endpoints::endpoint_server(port, token).await {
                        error!("Metrics server error: {}", e);
                    }
                });
            }
            let orchestrator = build_orchestrator(&automation, &relay)?;
            run_loop(&orchestrator, &automation, shutdown).await
        }
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "launchpad_relay=debug,info"
    } else {
        "launchpad_relay=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init()
    };
    installed.context("Failed to install tracing subscriber")?;

    Ok(())
}

fn build_relay_stack() -> Result<RelayStack> {
    let config = RelayConfig::from_env().context("Failed to load relay configuration")?;
    let registry = Arc::new(EngineRegistry::from_config(&config).context("Failed to build engine registry")?);
    if registry.order().is_empty() {
        warn!("No relay engine has endpoints configured; submissions will fail");
    }
    let transport: Arc<dyn RelayTransport> =
        Arc::new(HttpRelayTransport::for_registry(&registry).context("Failed to build relay HTTP clients")?);
    let submitter = Arc::new(Submitter::new(
        transport.clone(),
        BackoffPolicy::new(config.backoff.clone()),
        config.submitter_config(),
    ));
    let coordinator = Arc::new(FailoverCoordinator::new(registry.clone(), submitter));
    Ok(RelayStack {
        config,
        registry,
        transport,
        coordinator,
    })
}

fn load_automation_config(path: &str) -> Result<AutomationConfig> {
    info!("Loading automation configuration from: {}", path);
    AutomationConfig::from_file(path).with_context(|| format!("Failed to load config from {}", path))
}

fn build_orchestrator(config: &AutomationConfig, relay: &RelayStack) -> Result<ExecutionOrchestrator> {
    let store = LedgerStore::open(&config.store.path)
        .with_context(|| format!("Failed to open ledger at {}", config.store.path))?;
    let secret = config.installation_secret().context("Installation secret unavailable")?;
    let keys = InstallationKeyStore::new(
        secret,
        KdfParams {
            memory_kib: config.signer.kdf_memory_kib,
            iterations: config.signer.kdf_iterations,
        },
    );
    let factory = VenueTransactionFactory::from_settings(&config.venue).context("Invalid venue settings")?;
    let oracle: Arc<dyn PriceOracle> = match &config.oracle.url {
        Some(url) => Arc::new(HttpPriceOracle::new(url, Duration::from_millis(config.oracle.timeout_ms))),
        None => Arc::new(NoOracle),
    };

    let deps = OrchestratorDeps {
        store,
        chain: Arc::new(RpcChainClient::new(&config.rpc.url, Duration::from_millis(config.rpc.timeout_ms))),
        factory: Arc::new(factory),
        keys: Arc::new(keys),
        oracle,
        coordinator: relay.coordinator.clone(),
        transport: relay.transport.clone(),
        poller: relay.config.poller(),
        request_timeout: relay.config.request_timeout,
    };
    Ok(ExecutionOrchestrator::new(deps, config.orchestrator_settings()))
}

/// Passes on a fixed cadence until ctrl-c
async fn run_loop(
    orchestrator: &ExecutionOrchestrator,
    config: &AutomationConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut cadence = tokio::time::interval(Duration::from_secs(config.schedule.cadence_secs));
    cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(cadence_secs = config.schedule.cadence_secs, "Automation loop started");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cadence.tick() => {
                for kind in &config.schedule.kinds {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    match orchestrator.run_pass(*kind, Some(&shutdown)).await {
                        Ok(summary) => match serde_json::to_string(&summary) {
                            Ok(json) => info!(target: "launchpad_relay::summary", "{}", json),
                            Err(e) => warn!("Failed to serialise pass summary: {}", e),
                        },
                        Err(e) => error!(kind = %kind, error = %e, "Automation pass aborted"),
                    }
                }
            }
        }
    }

    orchestrator.store().flush().await?;
    info!("Shutting down gracefully...");
    Ok(())
}

fn parse_kind(raw: &str) -> Result<AutomationKind> {
    AutomationKind::ALL
        .iter()
        .copied()
        .find(|k| k.as_str() == raw.trim())
        .with_context(|| format!("Unknown automation kind '{}'", raw))
}

fn print_engines(relay: &RelayStack) -> Result<()> {
    for (position, key) in relay.registry.order().iter().enumerate() {
        if let Some(engine) = relay.registry.get(key) {
            println!(
                "{}. {} ({}) method={} dry_run={} endpoints={}",
                position + 1,
                engine.key,
                engine.label,
                engine.method.rpc_method(),
                engine.dry_run,
                engine.endpoints.join(",")
            );
        }
    }
    Ok(())
}

async fn check_status(relay: &RelayStack, engine: &str, id: &str) -> Result<()> {
    let key = EngineKey::from(engine);
    let engine = relay
        .registry
        .get(&key)
        .with_context(|| format!("Engine '{}' is not configured", key))?;
    let source = HttpStatusSource::for_engine(relay.transport.clone(), engine, relay.config.request_timeout)
        .with_context(|| format!("Engine '{}' has no status endpoint", key))?;
    let outcome = relay
        .config
        .poller()
        .wait(&source, id, None, &StructuredLogger::default())
        .await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
