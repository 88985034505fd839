//! Content identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content identifier: the SHA-256 digest of an encoded block.
///
/// Self-describing enough for this engine — every block in the store is
/// addressed by the hash of its bytes, so two nodes computing a cid for the
/// same block always agree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the cid of a byte payload.
    pub fn from_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, used in datastore keys and log output.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full digests make log lines unreadable; eight bytes is plenty to eyeball.
        write!(f, "Cid({}..)", &self.to_hex()[..16])
    }
}

impl std::str::FromStr for Cid {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Cid(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_cid() {
        assert_eq!(Cid::from_content(b"hello"), Cid::from_content(b"hello"));
        assert_ne!(Cid::from_content(b"hello"), Cid::from_content(b"world"));
    }

    #[test]
    fn test_hex_round_trip() {
        let cid = Cid::from_content(b"some block");
        let parsed: Cid = cid.to_hex().parse().unwrap();
        assert_eq!(cid, parsed);
    }
}
