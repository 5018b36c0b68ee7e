use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use channels::TransportOptions;
use gateway::{
    ChannelManager, DEFAULT_SWEEP_CRON, GatewaySettings, InboundChannel, LedgerKind, RoutingTable,
};
use proto::{ChannelAddress, ConfigError, EndpointAddress, Site};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Gateway identity and send behaviour.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Deduplication ledger.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Inbound channels; empty means the HTTP convention channel.
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,

    /// Known remote sites.
    #[serde(default)]
    pub sites: Vec<SiteEntry>,

    /// Message type to site mappings.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Connection to the local bus.
    #[serde(default)]
    pub bus: BusConfig,

    /// Transport tuning.
    #[serde(default)]
    pub transports: TransportsConfig,
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// A disabled gateway makes `start` exit immediately.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Main input queue of the local endpoint, e.g. `Sales`.
    #[serde(default)]
    pub endpoint: String,
    /// Name of this site.
    #[serde(default)]
    pub site: String,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            site: String::new(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Ledger backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    InMemory,
    #[default]
    Durable,
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub kind: LedgerBackend,
    /// SQLite file path (durable only).
    #[serde(default = "default_ledger_url")]
    pub url: String,
    /// Records older than this are purged and become claimable again. Unset keeps them forever.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerBackend::default(),
            url: default_ledger_url(),
            ttl_secs: None,
            sweep_cron: default_sweep_cron(),
        }
    }
}

/// One `[[channels]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// `transport:location`, e.g. `http:http://0.0.0.0:8090/Sales/`.
    pub address: String,
    #[serde(default)]
    pub default: bool,
}

/// One `[[sites]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEntry {
    pub name: String,
    /// Channel addresses tried in order.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// `[routing]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    /// Exact message type to site name.
    #[serde(default)]
    pub message_types: BTreeMap<String, String>,
    /// Message type prefix to site name.
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,
    /// Treat the first dotted segment of a message type as a site name.
    #[serde(default)]
    pub infer_from_namespace: bool,
}

/// Local bus flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// Envelopes stay inside the daemon and are only logged.
    InProcess,
    /// Endpoint queues are channel addresses built from `location`.
    #[default]
    Channel,
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_bus_transport")]
    pub transport: String,
    /// Queue location with an `{endpoint}` placeholder.
    #[serde(default = "default_bus_location")]
    pub location: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            transport: default_bus_transport(),
            location: default_bus_location(),
        }
    }
}

/// `[transports]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_file_poll_ms")]
    pub file_poll_ms: u64,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            file_poll_ms: default_file_poll_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_send_timeout_secs() -> u64 {
    gateway::DEFAULT_SEND_TIMEOUT.as_secs()
}

fn default_ledger_url() -> String {
    "~/.sitegate/ledger.db".to_string()
}

fn default_sweep_cron() -> String {
    DEFAULT_SWEEP_CRON.to_string()
}

fn default_bus_transport() -> String {
    "file".to_string()
}

fn default_bus_location() -> String {
    "~/.sitegate/bus/{endpoint}".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_file_poll_ms() -> u64 {
    500
}

/// Longest accepted ledger TTL: one hundred years.
pub const MAX_LEDGER_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn parse_address(field: String, raw: &str) -> Result<ChannelAddress, ConfigError> {
    raw.parse::<ChannelAddress>()
        .map_err(|e| ConfigError::InvalidValue {
            field,
            reason: e.to_string(),
        })
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            // Look in current dir, then home dir
            let cwd = std::env::current_dir().ok()?.join("sitegate.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".sitegate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        debug!(
            endpoint = %config.gateway.endpoint,
            site = %config.gateway.site,
            ledger = ?config.ledger.kind,
            channels = config.channels.len(),
            sites = config.sites.len(),
            "Config loaded"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("SITEGATE_ENDPOINT") {
            self.gateway.endpoint = endpoint;
        }
        if let Ok(site) = std::env::var("SITEGATE_SITE") {
            self.gateway.site = site;
        }
        if let Ok(url) = std::env::var("SITEGATE_LEDGER_URL") {
            self.ledger.url = url;
            self.ledger.kind = LedgerBackend::Durable;
        }
        if let Ok(flag) = std::env::var("SITEGATE_LEDGER_IN_MEMORY")
            && matches!(flag.trim(), "1" | "true" | "yes")
        {
            self.ledger.kind = LedgerBackend::InMemory;
        }
    }

    /// Checks everything `start` needs before anything is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("gateway.endpoint".to_string()));
        }
        if self.gateway.site.trim().is_empty() {
            return Err(ConfigError::MissingField("gateway.site".to_string()));
        }
        if self.ledger.kind == LedgerBackend::Durable && self.ledger.url.trim().is_empty() {
            return Err(ConfigError::MissingField("ledger.url".to_string()));
        }
        if let Some(ttl) = self.ledger.ttl_secs {
            // A zero TTL expires every record on insert and disables dedup.
            require_positive("ledger.ttl_secs", ttl)?;
            if ttl > MAX_LEDGER_TTL_SECS {
                return Err(ConfigError::InvalidValue {
                    field: "ledger.ttl_secs".to_string(),
                    reason: format!("must be at most {MAX_LEDGER_TTL_SECS}"),
                });
            }
        }
        require_positive("gateway.send_timeout_secs", self.gateway.send_timeout_secs)?;
        require_positive("transports.http_timeout_secs", self.transports.http_timeout_secs)?;
        require_positive("transports.file_poll_ms", self.transports.file_poll_ms)?;
        if self.bus.kind == BusKind::Channel
            && !self.bus.location.contains(gateway::bus::ENDPOINT_PLACEHOLDER)
        {
            return Err(ConfigError::InvalidValue {
                field: "bus.location".to_string(),
                reason: format!(
                    "must contain the {} placeholder",
                    gateway::bus::ENDPOINT_PLACEHOLDER
                ),
            });
        }
        self.channel_manager()?.validate()?;
        self.routing_table()?.validate()
    }

    /// Site definitions and routing maps as a routing table.
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        let mut table = RoutingTable::new().infer_from_namespace(self.routing.infer_from_namespace);
        for (i, entry) in self.sites.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("sites[{i}].name")));
            }
            let addresses = entry
                .addresses
                .iter()
                .enumerate()
                .map(|(j, raw)| parse_address(format!("sites.{}.addresses[{j}]", entry.name), raw))
                .collect::<Result<Vec<_>, _>>()?;
            table = table.with_site(Site::new(entry.name.clone(), addresses));
        }
        for (message_type, site) in &self.routing.message_types {
            table = table.route_type(message_type.clone(), site.clone());
        }
        for (prefix, site) in &self.routing.prefixes {
            table = table.route_prefix(prefix.clone(), site.clone());
        }
        Ok(table)
    }

    /// Inbound channel selection for the configured endpoint.
    pub fn channel_manager(&self) -> Result<ChannelManager, ConfigError> {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                parse_address(format!("channels[{i}].address"), &entry.address)
                    .map(|address| InboundChannel::new(address, entry.default))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChannelManager::new(
            channels,
            &EndpointAddress::from(self.gateway.endpoint.as_str()),
        ))
    }

    pub fn ledger_kind(&self) -> LedgerKind {
        match self.ledger.kind {
            LedgerBackend::InMemory => LedgerKind::InMemory,
            LedgerBackend::Durable => LedgerKind::Durable {
                url: self.ledger.url.clone(),
            },
        }
    }

    pub fn ledger_ttl(&self) -> Option<chrono::Duration> {
        self.ledger
            .ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        let mut settings =
            GatewaySettings::new(self.gateway.endpoint.as_str(), self.gateway.site.clone());
        settings.enabled = self.gateway.enabled;
        settings.send_timeout = Duration::from_secs(self.gateway.send_timeout_secs);
        settings
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            http_timeout: Duration::from_secs(self.transports.http_timeout_secs),
            file_poll_interval: Duration::from_millis(self.transports.file_poll_ms),
            ..TransportOptions::default()
        }
    }
}
