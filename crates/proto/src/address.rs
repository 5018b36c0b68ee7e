use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Transport tag plus transport-specific location (URL, directory, queue name).
///
/// Textual form is `tag:location`, e.g. `http:http://10.0.0.5:8090/gateway/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelAddress {
    tag: String,
    location: String,
}

impl ChannelAddress {
    /// Builds an address; the tag is normalized to lowercase.
    pub fn new(tag: impl AsRef<str>, location: impl Into<String>) -> Self {
        Self {
            tag: tag.as_ref().trim().to_ascii_lowercase(),
            location: location.into(),
        }
    }

    /// Transport tag used to resolve a sender/receiver.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Transport-specific location.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tag, self.location)
    }
}

impl std::str::FromStr for ChannelAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tag, location)) if !tag.trim().is_empty() && !location.is_empty() => {
                Ok(Self::new(tag, location))
            }
            _ => Err(ProtoError::InvalidAddress(s.to_string())),
        }
    }
}

/// Address of an internal bus queue (e.g. `Sales`, `Sales.gateway`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub String);

impl EndpointAddress {
    /// Returns the raw queue name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the `<queue>.<qualifier>` sub-scope of this address.
    pub fn sub_scope(&self, qualifier: &str) -> Self {
        Self(format!("{}.{qualifier}", self.0))
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A remote deployment reachable through one or more channel addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Logical site name (`SiteEurope`).
    pub name: String,
    /// Addresses tried in order when forwarding to this site.
    pub addresses: Vec<ChannelAddress>,
}

impl Site {
    /// Creates a site from a name and its addresses.
    pub fn new(name: impl Into<String>, addresses: Vec<ChannelAddress>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }
}
