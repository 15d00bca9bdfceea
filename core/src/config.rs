// Node configuration
//
// Every field has a default, so a JSON file only needs the fields it changes.

use serde::{Deserialize, Serialize};

use crate::codec::Compression;
use crate::identity::Protocol;
use crate::mesh::MeshError;

/// Outgoing connection bound used by peer exchange
pub const DEFAULT_MAX_OUTGOING: usize = 4;

/// Default listen port
pub const DEFAULT_PORT: u16 = 4444;

/// A link with a half-read frame and no traffic for this long is dropped
pub const DEFAULT_FRAME_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Host to listen on
    pub bind_addr: String,

    /// Port to listen on (0 lets the OS pick)
    pub port: u16,

    /// Address advertised to peers; derived from the bind address when absent
    pub out_addr: Option<(String, u16)>,

    /// Subnet and encryption tags
    pub protocol: Protocol,

    /// Advertised compression methods, most preferred first
    pub compression: Vec<Compression>,

    /// Peer exchange stops dialing once this many outgoing links exist
    pub max_outgoing: usize,

    /// Seconds a partial frame may sit without traffic before the link is dropped
    pub frame_timeout_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            out_addr: None,
            protocol: Protocol::default(),
            compression: Compression::supported(),
            max_outgoing: DEFAULT_MAX_OUTGOING,
            frame_timeout_secs: DEFAULT_FRAME_TIMEOUT_SECS,
        }
    }
}

impl MeshConfig {
    /// Loopback config on the given port, the usual shape in tests and local meshes
    pub fn local(port: u16) -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_compression(mut self, compression: Vec<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_out_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.out_addr = Some((host.into(), port));
        self
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.bind_addr.trim().is_empty() {
            return Err(MeshError::InvalidConfig("bind_addr is empty".into()));
        }
        if self.max_outgoing == 0 {
            return Err(MeshError::InvalidConfig("max_outgoing must be at least 1".into()));
        }
        if self.frame_timeout_secs == 0 {
            return Err(MeshError::InvalidConfig("frame_timeout_secs must be at least 1".into()));
        }
        if let Some((host, _)) = &self.out_addr {
            if host.trim().is_empty() {
                return Err(MeshError::InvalidConfig("out_addr host is empty".into()));
            }
        }
        Ok(())
    }

    pub fn from_json(contents: &str) -> Result<Self, MeshError> {
        let config: MeshConfig = serde_json::from_str(contents)
            .map_err(|e| MeshError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string_pretty(self).map_err(|e| MeshError::InvalidConfig(e.to_string()))
    }
}
