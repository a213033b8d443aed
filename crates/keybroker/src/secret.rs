use std::fmt;

use anyhow::Context;
use rand::Rng;

/// 256-bit symmetric signing key. Rendered and parsed as hex so it can live
/// in an environment variable or config file.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Secret {
    key: [u8; 32],
}

impl TryFrom<&str> for Secret {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> anyhow::Result<Self> {
        let key: [u8; 32] = hex::decode(s)
            .context("Couldn't hexdecode secret")?
            .try_into()
            .map_err(|e: Vec<u8>| {
                anyhow::anyhow!("Hex-decoded secret was {} bytes, not 32", e.len())
            })?;
        Ok(Self { key })
    }
}

impl TryFrom<Vec<u8>> for Secret {
    type Error = anyhow::Error;

    fn try_from(v: Vec<u8>) -> anyhow::Result<Self> {
        let key: [u8; 32] = v
            .try_into()
            .map_err(|e: Vec<u8>| anyhow::anyhow!("Secret was {} bytes, not 32", e.len()))?;
        Ok(Self { key })
    }
}

impl Secret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn random() -> Self {
        Self {
            key: rand::rng().random(),
        }
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.key))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(..)")
    }
}
