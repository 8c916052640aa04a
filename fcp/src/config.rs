//! Client configuration and JSON loading.

use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::identifier::next_identifier;

/// Default FCP port of a Freenet node.
pub const DEFAULT_PORT: u16 = 9481;

/// Settings for connecting to a node and driving commands.
///
/// Every field is optional in JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Client name sent in `ClientHello`; must be unique per node.
    pub name: String,
    /// Node host.
    pub host: String,
    /// Node FCP port.
    pub port: u16,
    /// Maximum number of commands driven at once.
    pub max_in_flight: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: format!("fcp-{}", next_identifier()),
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            max_in_flight: 64,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
