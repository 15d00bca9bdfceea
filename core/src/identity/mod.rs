// Identity - protocol ids and node ids

use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};
use tokio::net::UdpSocket;

use crate::codec::base58;

/// Version folded into every protocol id
pub const PROTOCOL_VERSION: &str = "0.4.319";

/// The (subnet, encryption, version) triple two nodes must agree on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol {
    pub subnet: String,
    pub encryption: String,
}

impl Protocol {
    pub fn new(subnet: impl Into<String>, encryption: impl Into<String>) -> Self {
        Self {
            subnet: subnet.into(),
            encryption: encryption.into(),
        }
    }

    pub fn version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    /// Base-58 SHA-256 over `subnet || encryption || version`
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subnet.as_bytes());
        hasher.update(self.encryption.as_bytes());
        hasher.update(PROTOCOL_VERSION.as_bytes());
        base58::encode(&hasher.finalize())
    }

    /// Same protocol on a derived subnet
    pub fn with_subnet_suffix(&self, suffix: &str) -> Self {
        Self {
            subnet: format!("{}{}", self.subnet, suffix),
            encryption: self.encryption.clone(),
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new("mesh", "Plaintext")
    }
}

/// Random salt fixed for the lifetime of the process
pub fn process_salt() -> &'static str {
    static SALT: OnceLock<String> = OnceLock::new();
    SALT.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Node id: base-58 SHA-384 over the outward address, the protocol id and the process salt
pub fn node_id(out_addr: &(String, u16), protocol: &Protocol) -> String {
    let mut hasher = Sha384::new();
    hasher.update(format!("('{}', {})", out_addr.0, out_addr.1).as_bytes());
    hasher.update(protocol.id().as_bytes());
    hasher.update(process_salt().as_bytes());
    base58::encode(&hasher.finalize())
}

/// Address of the interface that routes to the public internet.
///
/// No packet is sent; connecting a UDP socket only selects a route. Falls
/// back to loopback on hosts without a route.
pub async fn lan_ip() -> IpAddr {
    async fn route() -> std::io::Result<IpAddr> {
        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect("8.8.8.8:80").await?;
        Ok(sock.local_addr()?.ip())
    }
    route().await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
