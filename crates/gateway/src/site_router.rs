//! Destination-site resolution for outbound envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use proto::{ConfigError, Envelope, GatewayError, Site, headers};
use tracing::debug;

/// Static routing configuration: the site directory and both lookup tables.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    sites: HashMap<String, Site>,
    /// message type -> site name
    message_types: HashMap<String, String>,
    /// (prefix, site name), longest prefix first, ties in lexical order
    prefixes: Vec<(String, String)>,
    infer_from_namespace: bool,
}

impl RoutingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a site in the directory.
    pub fn with_site(mut self, site: Site) -> Self {
        self.sites.insert(site.name.clone(), site);
        self
    }

    /// Routes one exact message type to a site.
    pub fn route_type(mut self, message_type: impl Into<String>, site: impl Into<String>) -> Self {
        self.message_types.insert(message_type.into(), site.into());
        self
    }

    /// Routes every message type starting with `prefix` to a site.
    pub fn route_prefix(mut self, prefix: impl Into<String>, site: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, site.into()));
        self.prefixes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self
    }

    /// Use the first namespace segment of a message type as a site name.
    pub fn infer_from_namespace(mut self, enabled: bool) -> Self {
        self.infer_from_namespace = enabled;
        self
    }

    /// Site by name.
    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.get(name)
    }

    /// Site names, sorted.
    pub fn site_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Rejects sites without addresses and table entries naming unknown sites.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for site in self.sites.values() {
            if site.addresses.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("sites.{}", site.name),
                    reason: "site has no channel addresses".to_string(),
                });
            }
        }
        let targets = self
            .message_types
            .iter()
            .map(|(k, v)| (format!("routing.message_types.{k}"), v))
            .chain(
                self.prefixes
                    .iter()
                    .map(|(k, v)| (format!("routing.prefixes.{k}"), v)),
            );
        for (field, site) in targets {
            if !self.sites.contains_key(site) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("unknown site '{site}'"),
                });
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Site, GatewayError> {
        self.sites
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnresolvedSite(format!("unknown site '{name}'")))
    }
}

/// One way of deciding the destination site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// `DestinationSite` header, else `OriginatingSite` (reply to sender).
    Header,
    /// Exact `MessageType` lookup.
    Configuration,
    /// Longest matching message type prefix, then namespace inference.
    Convention,
}

impl RoutingStrategy {
    /// Evaluation order; the first applicable strategy wins.
    pub const ORDER: [RoutingStrategy; 3] = [
        RoutingStrategy::Header,
        RoutingStrategy::Configuration,
        RoutingStrategy::Convention,
    ];

    /// `Ok(None)` when the strategy does not apply to this envelope.
    pub fn try_resolve(
        self,
        envelope: &Envelope,
        table: &RoutingTable,
    ) -> Result<Option<Vec<Site>>, GatewayError> {
        match self {
            RoutingStrategy::Header => {
                let Some(value) = envelope
                    .header(headers::DESTINATION_SITE)
                    .or_else(|| envelope.header(headers::ORIGINATING_SITE))
                else {
                    return Ok(None);
                };
                let mut sites: Vec<Site> = Vec::new();
                for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                    if sites.iter().any(|s| s.name == name) {
                        continue;
                    }
                    sites.push(table.lookup(name)?);
                }
                Ok(Some(sites).filter(|s| !s.is_empty()))
            }
            RoutingStrategy::Configuration => {
                let Some(site) = envelope
                    .message_type()
                    .and_then(|ty| table.message_types.get(ty))
                else {
                    return Ok(None);
                };
                Ok(Some(vec![table.lookup(site)?]))
            }
            RoutingStrategy::Convention => {
                let Some(message_type) = envelope.message_type() else {
                    return Ok(None);
                };
                if let Some((_, site)) = table
                    .prefixes
                    .iter()
                    .find(|(prefix, _)| message_type.starts_with(prefix.as_str()))
                {
                    return Ok(Some(vec![table.lookup(site)?]));
                }
                if table.infer_from_namespace
                    && let Some((namespace, _)) = message_type.split_once('.')
                    && let Some(site) = table.site(namespace)
                {
                    return Ok(Some(vec![site.clone()]));
                }
                Ok(None)
            }
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingStrategy::Header => "header",
            RoutingStrategy::Configuration => "configuration",
            RoutingStrategy::Convention => "convention",
        };
        f.write_str(name)
    }
}

/// Sites chosen for one envelope and the strategy that chose them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub strategy: RoutingStrategy,
    pub sites: Vec<Site>,
}

impl RoutingDecision {
    /// Names of the resolved sites, in routing order.
    pub fn site_names(&self) -> Vec<String> {
        self.sites.iter().map(|s| s.name.clone()).collect()
    }
}

/// Evaluates the routing strategies against a shared table.
#[derive(Clone)]
pub struct SiteRouter {
    table: Arc<RoutingTable>,
}

impl SiteRouter {
    /// Creates a router over a frozen table.
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    /// The routing table.
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Destination sites for `envelope`, or `UnresolvedSite`.
    pub fn resolve(&self, envelope: &Envelope) -> Result<RoutingDecision, GatewayError> {
        for strategy in RoutingStrategy::ORDER {
            if let Some(sites) = strategy.try_resolve(envelope, &self.table)? {
                debug!(message_id = %envelope.id, %strategy, "Routed to {} site(s)", sites.len());
                return Ok(RoutingDecision { strategy, sites });
            }
        }
        Err(GatewayError::UnresolvedSite(format!(
            "no route for message {} (type: {})",
            envelope.id,
            envelope.message_type().unwrap_or("<none>")
        )))
    }
}
