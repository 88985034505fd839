//! Peer identity types.
//!
//! Identity comes from the transport layer; the engine only needs stable,
//! comparable ids and a dialable address form. Addresses use the
//! `<transport-addr>/p2p/<peer-id>` shape so the peer id always travels with
//! the address it was learned from.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::SchemaId;

/// Transport identity of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(PeerId)
            .map_err(|_| PeerAddrError::InvalidPeerId(s.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum PeerAddrError {
    #[error("address {0:?} is missing a /p2p/<peer-id> suffix")]
    MissingPeerId(String),

    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
}

/// A peer id together with the addresses it can be dialed at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerAddr {
    pub fn new(id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addrs: vec![addr.into()],
        }
    }

    /// The full dialable form of the first address.
    pub fn to_dial_string(&self) -> String {
        match self.addrs.first() {
            Some(addr) => format!("{}/p2p/{}", addr, self.id),
            None => format!("/p2p/{}", self.id),
        }
    }
}

impl std::str::FromStr for PeerAddr {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, id) = s
            .rsplit_once("/p2p/")
            .ok_or_else(|| PeerAddrError::MissingPeerId(s.to_string()))?;
        Ok(PeerAddr::new(id.parse()?, addr))
    }
}

/// A persisted replication destination: where to dial and which schemas to
/// push.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Replicator {
    pub addr: PeerAddr,
    pub schemas: Vec<SchemaId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_round_trip() {
        let addr = PeerAddr::new(PeerId::random(), "sim://node-a");
        let parsed: PeerAddr = addr.to_dial_string().parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn test_peer_addr_requires_p2p_suffix() {
        assert!(matches!(
            "sim://node-a".parse::<PeerAddr>(),
            Err(PeerAddrError::MissingPeerId(_))
        ));
        assert!(matches!(
            "sim://node-a/p2p/not-a-uuid".parse::<PeerAddr>(),
            Err(PeerAddrError::InvalidPeerId(_))
        ));
    }
}
