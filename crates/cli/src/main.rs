//! CLI entrypoint and subcommand orchestration.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use channels::ChannelFactory;
use clap::{Parser, Subcommand};
use gateway::{ChannelBus, ForwardOutcome, Gateway, InProcessBus, LocalBus, Ledgers};
use proto::{ConfigError, Envelope, headers};

use crate::config::{BusKind, Config};

#[cfg(not(test))]
use gateway::LedgerSweeper;
#[cfg(not(test))]
use tracing::{error, info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for sitegate.
#[derive(Parser)]
#[command(name = "sitegate")]
#[command(about = "Idempotent site-to-site message gateway", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.sitegate/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run receive sessions, the outbound pump and the ledger sweeper
    Start,

    /// Forward one envelope to its destination site(s)
    Forward {
        /// Message identifier; reusing one makes the send a duplicate
        #[arg(long)]
        id: String,

        /// Message type used for routing
        #[arg(long = "type")]
        message_type: String,

        /// Explicit destination site (comma-separated for several)
        #[arg(long)]
        site: Option<String>,

        /// Extra header as key=value; repeatable
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// File whose bytes become the body
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// Purge expired ledger records once
    Sweep,
}

impl Commands {
    #[cfg(not(test))]
    fn label(&self) -> &'static str {
        match self {
            Commands::Start => "start",
            Commands::Forward { .. } => "forward",
            Commands::Sweep => "sweep",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level. With --debug, a daily-rotated
    // debug log is written to ~/.sitegate/logs/debug.YYYY-MM-DD.log.
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    let debug_writer = if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = PathBuf::from(home).join(".sitegate").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);
        Some(writer)
    } else {
        _file_guard = None;
        None
    };

    match debug_writer {
        Some(writer) => {
            let console = fmt::layer().with_target(false).with_filter(console_filter);
            let file = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_filter(EnvFilter::new(
                    "debug,hyper=info,hyper_util=info,reqwest=info,sqlx=info",
                ));
            tracing_subscriber::registry()
                .with(console)
                .with(file)
                .init();
        }
        None => {
            fmt()
                .with_env_filter(console_filter)
                .with_target(false)
                .init();
        }
    }

    if cli.debug {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cli.command.label(),
            log_level = %cli.log_level,
            "========== sitegate session start =========="
        );
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::Forward {
            id,
            message_type,
            site,
            headers,
            body_file,
        } => {
            let body = match body_file {
                Some(path) => read_body(&path)?,
                None => Vec::new(),
            };
            let envelope = build_envelope(
                &config.gateway.site,
                &id,
                &message_type,
                site.as_deref(),
                headers,
                body,
            );
            cmd_forward(config, envelope).await
        }
        Commands::Sweep => cmd_sweep(config).await,
    }
}

/// Loads configuration. A file named with `--config` must load; a
/// discovered one that fails falls back to defaults with a warning.
fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match Config::load(explicit) {
        Ok(config) => Ok(config),
        Err(e) if explicit.is_some() => Err(e),
        Err(e) => {
            tracing::warn!("Failed to load config ({e}), using defaults");
            Ok(Config::default())
        }
    }
}

/// A gateway built from configuration, plus the receiving end of an
/// in-process bus when one was selected.
struct Assembly {
    gateway: Arc<Gateway>,
    local_bus: Option<InProcessBus>,
}

/// Opens ledgers, freezes the channel factory and wires the gateway.
async fn assemble(config: &Config) -> anyhow::Result<Assembly> {
    config.validate()?;

    let ledgers = Ledgers::open(&config.ledger_kind(), config.ledger_ttl()).await?;
    let factory = Arc::new(ChannelFactory::with_builtin_transports(
        config.transport_options(),
    )?);

    let (bus, local_bus): (Arc<dyn LocalBus>, Option<InProcessBus>) = match config.bus.kind {
        BusKind::InProcess => {
            let bus = InProcessBus::new(128);
            (Arc::new(bus.handle()), Some(bus))
        }
        BusKind::Channel => (
            Arc::new(ChannelBus::new(
                &factory,
                &config.bus.transport,
                config.bus.location.clone(),
            )?),
            None,
        ),
    };

    let gateway = Gateway::new(
        config.gateway_settings(),
        ledgers,
        factory,
        config.routing_table()?,
        config.channel_manager()?,
        bus,
    );
    Ok(Assembly {
        gateway: Arc::new(gateway),
        local_bus,
    })
}

fn read_body(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))
}

/// Parses a `key=value` header argument.
fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Envelope for `sitegate forward`; `--site` and `--type` win over `--header`.
fn build_envelope(
    local_site: &str,
    id: &str,
    message_type: &str,
    site: Option<&str>,
    extra_headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> Envelope {
    let mut envelope = Envelope::with_id(id, local_site, body);
    for (key, value) in extra_headers {
        envelope = envelope.with_header(key, value);
    }
    envelope = envelope.with_header(headers::MESSAGE_TYPE, message_type);
    if let Some(site) = site {
        envelope = envelope.with_header(headers::DESTINATION_SITE, site);
    }
    envelope
}

fn describe_outcome(id: &str, outcome: &ForwardOutcome) -> String {
    match outcome {
        ForwardOutcome::Sent { strategy, sites } => {
            format!("{id}: sent to {} (routed by {strategy})", sites.join(", "))
        }
        ForwardOutcome::Duplicate => format!("{id}: duplicate, already forwarded"),
    }
}

#[cfg(not(test))]
/// Runs the gateway until SIGINT/SIGTERM.
async fn cmd_start(config: Config) -> anyhow::Result<()> {
    if !config.gateway.enabled {
        info!("Gateway is disabled in configuration; nothing to start");
        return Ok(());
    }
    info!("Starting sitegate daemon");

    let Assembly { gateway, local_bus } = assemble(&config).await?;

    // Without an external bus, released envelopes are only logged.
    if let Some(mut bus) = local_bus {
        tokio::spawn(async move {
            while let Some(delivery) = bus.recv().await {
                info!(
                    message_id = %delivery.envelope.id,
                    endpoint = %delivery.endpoint,
                    "Envelope released to local endpoint"
                );
            }
        });
    }

    let mut sweeper = LedgerSweeper::new()
        .await
        .map_err(|e| anyhow::anyhow!("ledger sweeper: {e}"))?;
    sweeper
        .add_sweep(&config.ledger.sweep_cron, gateway.ledgers().all(), |_| {})
        .await
        .map_err(|e| anyhow::anyhow!("ledger sweeper: {e}"))?;
    sweeper
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("ledger sweeper: {e}"))?;

    let pid_file = daemon::PidFile::new(daemon::PidFile::default_path());
    pid_file.write().await?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mut runner = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.run(stop_rx).await })
    };

    let result = tokio::select! {
        joined = &mut runner => joined,
        signal = daemon::wait_for_shutdown() => {
            if let Err(e) = signal {
                error!("Signal handling failed: {e}");
            }
            let _ = stop_tx.send(true);
            runner.await
        }
    };

    if let Err(e) = sweeper.shutdown().await {
        warn!("Ledger sweeper shutdown failed: {e}");
    }
    pid_file.remove().await;

    match result {
        Ok(Ok(())) => {
            info!("sitegate stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("gateway task failed: {e}")),
    }
}

#[cfg(not(test))]
async fn cmd_forward(config: Config, envelope: Envelope) -> anyhow::Result<()> {
    let Assembly { gateway, .. } = assemble(&config).await?;
    let outcome = gateway.forward(&envelope).await?;
    println!("{}", describe_outcome(envelope.id.as_str(), &outcome));
    Ok(())
}

#[cfg(not(test))]
async fn cmd_sweep(config: Config) -> anyhow::Result<()> {
    let Assembly { gateway, .. } = assemble(&config).await?;
    let purged = gateway.sweep().await?;
    println!("Purged {purged} expired ledger record(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use gateway::RoutingStrategy;
    use proto::GatewayError;

    use super::*;
    use crate::config::{LedgerBackend, SiteEntry};

    fn in_memory_config() -> Config {
        let mut cfg = Config::default();
        cfg.gateway.endpoint = "Sales".to_string();
        cfg.gateway.site = "SiteHome".to_string();
        cfg.ledger.kind = LedgerBackend::InMemory;
        cfg.bus.kind = BusKind::InProcess;
        cfg.sites.push(SiteEntry {
            name: "SiteEurope".to_string(),
            addresses: vec!["memory:europe".to_string()],
        });
        cfg
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn forward_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sitegate",
            "--debug",
            "forward",
            "--id",
            "m-1",
            "--type",
            "Billing.Invoice",
            "--site",
            "SiteEurope",
            "--header",
            "Priority=high",
            "--header",
            "Trace=a=b",
        ])
        .expect("parse");
        assert!(cli.debug);
        let Commands::Forward {
            id,
            message_type,
            site,
            headers,
            body_file,
        } = cli.command
        else {
            panic!("expected forward");
        };
        assert_eq!(id, "m-1");
        assert_eq!(message_type, "Billing.Invoice");
        assert_eq!(site.as_deref(), Some("SiteEurope"));
        assert_eq!(
            headers,
            vec![
                ("Priority".to_string(), "high".to_string()),
                ("Trace".to_string(), "a=b".to_string()),
            ]
        );
        assert!(body_file.is_none());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["sitegate"]).is_err());
    }

    #[test]
    fn parse_header_rejects_missing_separator_and_blank_key() {
        assert!(parse_header("novalue").is_err());
        assert!(parse_header(" =x").is_err());
        assert_eq!(
            parse_header("k=").expect("empty value"),
            ("k".to_string(), String::new())
        );
    }

    #[test]
    fn build_envelope_sets_routing_headers_over_extras() {
        let env = build_envelope(
            "SiteHome",
            "m-7",
            "Orders.Placed",
            Some("SiteEurope,SiteAsia"),
            vec![(headers::MESSAGE_TYPE.to_string(), "Spoofed".to_string())],
            b"{}".to_vec(),
        );
        assert_eq!(env.id.as_str(), "m-7");
        assert_eq!(env.origin_site, "SiteHome");
        assert_eq!(env.message_type(), Some("Orders.Placed"));
        assert_eq!(
            env.header(headers::DESTINATION_SITE),
            Some("SiteEurope,SiteAsia")
        );
        assert_eq!(env.body, b"{}".to_vec());
    }

    #[test]
    fn read_body_reports_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = read_body(&tmp.path().join("absent.json")).expect_err("missing");
        assert!(err.to_string().contains("absent.json"));
    }

    #[test]
    fn describe_outcome_names_sites_and_strategy() {
        let sent = ForwardOutcome::Sent {
            strategy: RoutingStrategy::Header,
            sites: vec!["SiteA".to_string(), "SiteB".to_string()],
        };
        assert_eq!(
            describe_outcome("m-1", &sent),
            "m-1: sent to SiteA, SiteB (routed by header)"
        );
        assert!(describe_outcome("m-1", &ForwardOutcome::Duplicate).contains("duplicate"));
    }

    #[test]
    fn explicit_config_that_fails_to_parse_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "[gateway\nendpoint = ").expect("write");
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            load_config(Some(&tmp.path().join("absent.toml"))),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn explicit_config_that_parses_is_used() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("sitegate.toml");
        std::fs::write(&path, "[gateway]\nendpoint = \"Sales\"\nsite = \"SiteHome\"\n")
            .expect("write");
        let cfg = crate::test_support::with_locked_env(|| load_config(Some(&path)))
            .expect("config");
        assert_eq!(cfg.gateway.site, "SiteHome");
    }

    #[tokio::test]
    async fn assemble_rejects_invalid_config() {
        let mut cfg = in_memory_config();
        cfg.gateway.endpoint.clear();
        assert!(assemble(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn assemble_in_process_gateway() {
        let assembly = assemble(&in_memory_config()).await.expect("assemble");
        assert!(assembly.local_bus.is_some());
        let sessions = assembly.gateway.sessions().expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].address().tag(), "http");
    }

    #[tokio::test]
    async fn assemble_channel_bus_adds_outbound_pump() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = in_memory_config();
        cfg.bus.kind = BusKind::Channel;
        cfg.bus.location = format!("{}/{{endpoint}}", tmp.path().display());
        let assembly = assemble(&cfg).await.expect("assemble");
        assert!(assembly.local_bus.is_none());
        let sessions = assembly.gateway.sessions().expect("sessions");
        assert_eq!(sessions.len(), 2);
        assert!(sessions[1].address().location().ends_with("Sales.gateway"));
    }

    #[tokio::test]
    async fn forward_without_route_leaves_ledger_untouched() {
        let assembly = assemble(&in_memory_config()).await.expect("assemble");
        let env = build_envelope(
            "SiteHome",
            "m-1",
            "Inventory.Counted",
            None,
            Vec::new(),
            Vec::new(),
        );
        let err = assembly.gateway.forward(&env).await.expect_err("unresolved");
        assert!(matches!(err, GatewayError::UnresolvedSite(_)));
        assert_eq!(
            assembly
                .gateway
                .ledgers()
                .outbound
                .record_count()
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn sweep_on_fresh_ledgers_purges_nothing() {
        let assembly = assemble(&in_memory_config()).await.expect("assemble");
        assert_eq!(assembly.gateway.sweep().await.expect("sweep"), 0);
    }
}
