use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier for a device in the cluster. The string form is what
/// travels in configuration and over the wire; the derived [`ShortId`] is
/// what version vectors are keyed by.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first eight bytes of the SHA-256 of the identifier, as a u64.
    pub fn short_id(&self) -> ShortId {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        ShortId(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Compact device key used inside version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_stable() {
        let a = DeviceId::new("device-a");
        assert_eq!(a.short_id(), DeviceId::new("device-a").short_id());
        assert_ne!(a.short_id(), DeviceId::new("device-b").short_id());
    }

    #[test]
    fn device_ids_order_by_string() {
        let mut ids = vec![DeviceId::new("zulu"), DeviceId::new("alpha")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "alpha");
    }
}
