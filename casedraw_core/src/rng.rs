use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::DrawError;

// Provably-fair construction:
// server_seed (secret, committed as sha256) + client_seed + sequence -> HMAC-SHA256 -> u64 roll

pub type HmacSha256 = Hmac<Sha256>;

/// Identifier of the commitment hash and roll derivation. Bump when either changes.
pub const COMMITMENT_SCHEME: &str = "sha256+hmac-sha256/v1";

/// Entropy of a freshly generated server seed, in bytes.
pub const SERVER_SEED_BYTES: usize = 32;

pub fn derive_hash_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Secret half of a commitment. Debug output is redacted so seeds never end
/// up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSeed(String);

impl ServerSeed {
    pub fn generate() -> Self {
        let mut buf = [0u8; SERVER_SEED_BYTES];
        OsRng.fill_bytes(&mut buf);
        Self(hex::encode(buf))
    }

    /// Rebuild a seed read back from storage.
    pub fn restore(seed: impl Into<String>) -> Self {
        Self(seed.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn hash_hex(&self) -> String {
        derive_hash_hex(self.0.as_bytes())
    }
}

impl std::fmt::Debug for ServerSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSeed(..)")
    }
}

/// Keyed digest over `server_seed:client_seed:sequence`, keyed with the server seed.
pub fn hmac_bytes(server_seed: &str, client_seed: &str, sequence: u64) -> Result<[u8; 32], DrawError> {
    let mut mac = HmacSha256::new_from_slice(server_seed.as_bytes())
        .map_err(|e| DrawError::Digest(e.to_string()))?;
    let msg = format!("{}:{}:{}", server_seed, client_seed, sequence);
    mac.update(msg.as_bytes());
    Ok(mac.finalize().into_bytes().into())
}

/// First 8 digest bytes as a big-endian u64.
pub fn derive_roll(server_seed: &str, client_seed: &str, sequence: u64) -> Result<u64, DrawError> {
    let bytes = hmac_bytes(server_seed, client_seed, sequence)?;
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    Ok(u64::from_be_bytes(head))
}

/// Known-answer check of the digest primitives. Run once at engine startup.
pub fn self_test() -> Result<(), DrawError> {
    const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    // RFC 4231 test case 2
    const HMAC_JEFE: &str = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";

    if derive_hash_hex(b"abc") != SHA256_ABC {
        return Err(DrawError::Digest("sha256 known-answer mismatch".into()));
    }
    let mut mac =
        HmacSha256::new_from_slice(b"Jefe").map_err(|e| DrawError::Digest(e.to_string()))?;
    mac.update(b"what do ya want for nothing?");
    if hex::encode(mac.finalize().into_bytes()) != HMAC_JEFE {
        return Err(DrawError::Digest("hmac-sha256 known-answer mismatch".into()));
    }
    Ok(())
}
