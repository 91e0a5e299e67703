//! The node's long-lived signing identity.
//!
//! RSA-2048 key pairs; the public half travels as PEM (served verbatim at
//! `/spherical.pub`), detached signatures travel base64-armored.

use {
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    openssl::{
        hash::MessageDigest,
        pkey::{PKey, Private},
        rsa::Rsa,
        sign::{Signer, Verifier},
    },
};

use spherical_common::{Error, Result};

pub struct SigningIdentity {
    key: PKey<Private>,
    public_pem: String,
}

impl SigningIdentity {
    /// Generate a fresh key pair. Done once per node, then persisted.
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(2048).map_err(Error::internal)?;
        let key = PKey::from_rsa(rsa).map_err(Error::internal)?;
        Self::from_pkey(key)
    }

    /// Load a previously persisted private key.
    pub fn from_private_pem(pem: &[u8]) -> Result<Self> {
        let key = PKey::private_key_from_pem(pem).map_err(Error::internal)?;
        Self::from_pkey(key)
    }

    fn from_pkey(key: PKey<Private>) -> Result<Self> {
        let public_pem = String::from_utf8(key.public_key_to_pem().map_err(Error::internal)?)
            .map_err(Error::internal)?;
        Ok(Self { key, public_pem })
    }

    /// PEM armor of the public key.
    #[must_use]
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// PEM of the private key, for persistence.
    pub fn private_pem(&self) -> Result<String> {
        let pem = self
            .key
            .private_key_to_pem_pkcs8()
            .map_err(Error::internal)?;
        String::from_utf8(pem).map_err(Error::internal)
    }

    /// Detached SHA-256 signature over `message`, base64-armored.
    pub fn sign(&self, message: &str) -> Result<String> {
        let mut signer =
            Signer::new(MessageDigest::sha256(), &self.key).map_err(Error::internal)?;
        signer.update(message.as_bytes()).map_err(Error::internal)?;
        let signature = signer.sign_to_vec().map_err(Error::internal)?;
        Ok(BASE64.encode(signature))
    }
}

/// Unarmor a detached signature. `None` means it cannot be a valid message.
#[must_use]
pub fn decode_signature(armored: &str) -> Option<Vec<u8>> {
    let decoded = BASE64.decode(armored.trim()).ok()?;
    if decoded.is_empty() {
        return None;
    }
    Some(decoded)
}

/// Verify a detached armored signature against a PEM public key. Any parse
/// failure is simply a failed verification.
#[must_use]
pub fn verify_detached(public_pem: &[u8], message: &str, signature: &str) -> bool {
    let Ok(key) = PKey::public_key_from_pem(public_pem) else {
        return false;
    };
    let Some(raw) = decode_signature(signature) else {
        return false;
    };
    let Ok(mut verifier) = Verifier::new(MessageDigest::sha256(), &key) else {
        return false;
    };
    if verifier.update(message.as_bytes()).is_err() {
        return false;
    }
    verifier.verify(&raw).unwrap_or(false)
}
