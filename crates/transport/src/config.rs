use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use canopy_core::RankId;

use crate::error::TransportError;
use crate::transport::Transport;

// ── Top-level config ────────────────────────────────────────────────

/// Where every rank of the world listens.
///
/// Parsed from `cluster.toml`. Ranks without an explicit `endpoint` get one
/// derived from the transport defaults: `ipc` names the socket `rank-<id>`,
/// `tcp` uses `default_host` and `base_port + id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub ranks: Vec<RankEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    pub id: u32,

    /// Inbound endpoint override, e.g. `tcp://10.0.0.4:6000`.
    pub endpoint: Option<String>,
}

/// Transport defaults section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// "ipc" or "tcp".
    #[serde(default = "default_transport_kind")]
    pub kind: String,

    #[serde(default = "default_tcp_host")]
    pub default_host: String,

    /// Port of rank 0 for derived TCP endpoints.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

fn default_transport_kind() -> String {
    "ipc".into()
}

fn default_tcp_host() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    5600
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            default_host: default_tcp_host(),
            base_port: default_base_port(),
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl ClusterConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, TransportError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// `world_size` ranks on one host over IPC sockets.
    pub fn local(world_size: u32) -> Self {
        Self {
            transport: TransportConfig::default(),
            ranks: (0..world_size).map(|id| RankEntry { id, endpoint: None }).collect(),
        }
    }

    pub fn world_size(&self) -> u32 {
        self.ranks.len() as u32
    }

    /// Resolve the inbound transport of `rank`.
    pub fn rank_transport(&self, rank: RankId) -> Result<Transport, TransportError> {
        let entry = self
            .ranks
            .iter()
            .find(|r| r.id == rank.0)
            .ok_or(TransportError::UnknownRank(rank))?;
        match &entry.endpoint {
            Some(endpoint) => Transport::parse(endpoint).ok_or_else(|| {
                TransportError::Config(format!("rank {} has unparseable endpoint '{endpoint}'", rank.0))
            }),
            None => self.derived_transport(rank),
        }
    }

    /// Every rank with its inbound transport, in rank order.
    pub fn peers(&self) -> Result<Vec<(RankId, Transport)>, TransportError> {
        let mut ids: Vec<u32> = self.ranks.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| Ok((RankId(id), self.rank_transport(RankId(id))?)))
            .collect()
    }

    fn derived_transport(&self, rank: RankId) -> Result<Transport, TransportError> {
        match self.transport.kind.as_str() {
            "tcp" => {
                let port = u16::try_from(rank.0)
                    .ok()
                    .and_then(|offset| self.transport.base_port.checked_add(offset))
                    .ok_or_else(|| {
                        TransportError::Config(format!("no TCP port left for rank {}", rank.0))
                    })?;
                Ok(Transport::tcp(self.transport.default_host.clone(), port))
            }
            _ => Ok(Transport::ipc(&format!("rank-{}", rank.0))),
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `CANOPY_TRANSPORT_KEY` overrides `transport.key`:
    /// - `CANOPY_TRANSPORT_KIND` → `transport.kind`
    /// - `CANOPY_TRANSPORT_DEFAULT_HOST` → `transport.default_host`
    /// - `CANOPY_TRANSPORT_BASE_PORT` → `transport.base_port`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CANOPY_TRANSPORT_KIND") {
            self.transport.kind = v;
        }
        if let Ok(v) = std::env::var("CANOPY_TRANSPORT_DEFAULT_HOST") {
            self.transport.default_host = v;
        }
        if let Ok(v) = std::env::var("CANOPY_TRANSPORT_BASE_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.transport.base_port = port;
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), TransportError> {
        self.validate_transport_kind()?;
        self.validate_rank_ids()?;
        self.validate_endpoints()?;
        Ok(())
    }

    fn validate_transport_kind(&self) -> Result<(), TransportError> {
        match self.transport.kind.as_str() {
            "ipc" | "tcp" => Ok(()),
            other => Err(TransportError::Config(format!(
                "invalid transport kind '{other}', expected 'ipc' or 'tcp'"
            ))),
        }
    }

    /// Rank ids must be unique and cover `0..world_size`.
    fn validate_rank_ids(&self) -> Result<(), TransportError> {
        if self.ranks.is_empty() {
            return Err(TransportError::Config("cluster has no ranks".into()));
        }
        let mut seen = BTreeSet::new();
        for rank in &self.ranks {
            if !seen.insert(rank.id) {
                return Err(TransportError::Config(format!("rank {} listed twice", rank.id)));
            }
        }
        if seen.iter().copied().ne(0..self.world_size()) {
            return Err(TransportError::Config(format!(
                "rank ids must be 0..{}, got {:?}",
                self.world_size(),
                seen
            )));
        }
        Ok(())
    }

    fn validate_endpoints(&self) -> Result<(), TransportError> {
        let mut seen = BTreeSet::new();
        for (rank, transport) in self.peers()? {
            if !seen.insert(transport.endpoint()) {
                return Err(TransportError::Config(format!(
                    "{rank} shares endpoint {transport} with another rank"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::local(1)
    }
}
