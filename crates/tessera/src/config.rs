//! Relay configuration.
//!
//! Usually loaded from a TOML file with [`RelayConfig::load`]. Every field
//! has a default, so an empty file is a valid in-memory development relay.
//!
//! ```toml
//! name = "eu-1"
//! port = 4000
//! bind_addr = "0.0.0.0"
//! database = "/var/lib/tessera/relay.db"
//! logging = true
//! quota_bytes = 10485760
//! allowed_owners = ["V1StGXR8_Z5jdHi6B-myT"]
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tessera_core::OwnerId;
use tessera_store::{AllowAll, AllowList, OwnerPolicy, QuotaLimit};

use crate::error::{Result, TesseraError};

pub const DEFAULT_PORT: u16 = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Name shown in logs.
    pub name: String,
    pub port: u16,
    /// Defaults to all interfaces.
    pub bind_addr: Option<IpAddr>,
    /// SQLite file. `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    /// Install the fmt log subscriber.
    pub logging: bool,
    /// Per-owner storage budget in ciphertext bytes.
    pub quota_bytes: Option<u64>,
    /// Owners admitted by the relay; everyone when unset.
    pub allowed_owners: Option<Vec<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "tessera-relay".to_string(),
            port: DEFAULT_PORT,
            bind_addr: None,
            database: None,
            logging: true,
            quota_bytes: None,
            allowed_owners: None,
        }
    }
}

impl RelayConfig {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.map_err(|e| {
            TesseraError::Config(format!("failed to read {}: {e}", path.to_string_lossy()))
        })?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TesseraError::Config(e.to_string()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port,
        )
    }

    /// Parsed allow-list, if configured.
    pub fn allowed_owner_ids(&self) -> Result<Option<Vec<OwnerId>>> {
        self.allowed_owners
            .as_ref()
            .map(|owners| {
                owners
                    .iter()
                    .map(|s| {
                        s.parse::<OwnerId>()
                            .map_err(|e| TesseraError::Config(format!("allowed_owners: {e}")))
                    })
                    .collect()
            })
            .transpose()
    }

    /// Owner policy described by `quota_bytes` and `allowed_owners`.
    pub fn policy(&self) -> Result<Box<dyn OwnerPolicy>> {
        let quota = self.quota_bytes.map(QuotaLimit::new);
        let allow = self.allowed_owner_ids()?.map(AllowList::new);
        let policy: Box<dyn OwnerPolicy> = match (allow, quota) {
            (Some(allow), Some(quota)) => Box::new((allow, quota)),
            (Some(allow), None) => Box::new(allow),
            (None, Some(quota)) => Box::new(quota),
            (None, None) => Box::new(AllowAll),
        };
        Ok(policy)
    }
}
