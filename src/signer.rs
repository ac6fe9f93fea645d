//! The server's Ed25519 signing identity.

use crate::errors::{Result, X402Error};
use ed25519_dalek::{Signer, SigningKey};
use sha3::{Digest, Sha3_256};

/// Authentication-key scheme byte for single Ed25519 keys.
const ED25519_SCHEME: u8 = 0x00;

/// AIP-80 prefix some wallets export keys with.
const AIP80_PREFIX: &str = "ed25519-priv-";

/// A private key and the account address derived from it.
pub struct SigningIdentity {
    key: SigningKey,
    address: String,
}

impl SigningIdentity {
    /// Loads a 32-byte Ed25519 private key given as hex.
    ///
    /// `0x` and `ed25519-priv-` prefixes are accepted.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let key_hex = trimmed.strip_prefix(AIP80_PREFIX).unwrap_or(trimmed);
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let bytes = hex::decode(key_hex).map_err(|e| X402Error::SignatureError(format!("Invalid private key hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| X402Error::SignatureError(format!("Private key must be 32 bytes, got {}", bytes.len())))?;

        Ok(Self::from_bytes(&seed))
    }

    /// Builds an identity from raw key bytes.
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(seed);
        let address = derive_address(&key.verifying_key().to_bytes());
        Self { key, address }
    }

    /// Account address, `0x` + 64 lowercase hex digits.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Public key, `0x` hex.
    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.verifying_key().to_bytes()))
    }

    /// Signs a transaction signing message, returning `0x` hex.
    pub fn sign(&self, message: &[u8]) -> String {
        format!("0x{}", hex::encode(self.key.sign(message).to_bytes()))
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity").field("address", &self.address).finish_non_exhaustive()
    }
}

/// Address of a single-key Ed25519 account: `sha3_256(public_key || 0x00)`.
fn derive_address(public_key: &[u8; 32]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(public_key);
    hasher.update([ED25519_SCHEME]);
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    const KEY: &str = "0x9bf49a6a0755f953811fce125f2683d50429c3bb49e074147e0089a52eae155f";

    #[test]
    fn test_prefixes_accepted() {
        let plain = SigningIdentity::from_hex(KEY).unwrap();
        let aip80 = SigningIdentity::from_hex(&format!("ed25519-priv-{}", KEY)).unwrap();
        let bare = SigningIdentity::from_hex(KEY.trim_start_matches("0x")).unwrap();

        assert_eq!(plain.address(), aip80.address());
        assert_eq!(plain.address(), bare.address());
        assert_eq!(plain.address().len(), 66);
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(SigningIdentity::from_hex("0x1234").is_err());
        assert!(SigningIdentity::from_hex("zz").is_err());
    }

    #[test]
    fn test_address_matches_manual_derivation() {
        let identity = SigningIdentity::from_bytes(&[7u8; 32]);
        let public_key = SigningKey::from_bytes(&[7u8; 32]).verifying_key().to_bytes();

        let mut hasher = Sha3_256::new();
        hasher.update(public_key);
        hasher.update([0u8]);
        assert_eq!(identity.address(), format!("0x{}", hex::encode(hasher.finalize())));
    }

    #[test]
    fn test_signature_verifies() {
        let identity = SigningIdentity::from_bytes(&[1u8; 32]);
        let signature_hex = identity.sign(b"message");

        let bytes = hex::decode(signature_hex.trim_start_matches("0x")).unwrap();
        let signature = Signature::from_slice(&bytes).unwrap();
        identity.key.verifying_key().verify(b"message", &signature).unwrap();
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = SigningIdentity::from_bytes(&[1u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(debug.contains(identity.address()));
        assert!(!debug.contains(&hex::encode([1u8; 32])));
    }
}
