//! The signed JSON envelope federated traffic travels in.
//!
//! Deserializing one of these proves nothing: callers accepting an envelope
//! MUST run `validate` (or `validate_with`) first.

use {
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    serde::{Deserialize, Serialize},
    serde_json::value::RawValue,
    sha2::{Digest, Sha256},
};

use spherical_common::{Error, Result};

use crate::{client::VerifierClient, signing::SigningIdentity};

/// A message claiming to come from another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossNodeMessage {
    /// Hostname of the node claiming to have sent this.
    #[serde(rename = "h")]
    pub hostname: String,

    /// Armored detached signature over the base64 of the SHA-256 of `data`.
    #[serde(rename = "s")]
    pub signature: String,

    /// The raw JSON object being sent. Always contains a `salt` key so every
    /// signed blob is unique.
    #[serde(rename = "d")]
    pub data: Box<RawValue>,
}

impl CrossNodeMessage {
    /// Build and sign an envelope: serialize `data`, splice a fresh salt in
    /// as the first key, sign the digest of the salted bytes.
    pub fn new<T: Serialize>(data: &T, hostname: &str, identity: &SigningIdentity) -> Result<Self> {
        let bytes = serde_json::to_vec(data).map_err(Error::internal)?;
        if bytes.first() != Some(&b'{') {
            return Err(Error::invalid("data is not a JSON object"));
        }

        let salt = uuid::Uuid::new_v4();
        let salted = if bytes.len() == 2 {
            format!("{{\"salt\":\"{salt}\"}}")
        } else {
            let rest = String::from_utf8(bytes[1..].to_vec()).map_err(Error::internal)?;
            format!("{{\"salt\":\"{salt}\",{rest}")
        };

        let hash_str = BASE64.encode(Sha256::digest(salted.as_bytes()));
        let signature = identity.sign(&hash_str)?;
        Ok(Self {
            hostname: hostname.to_owned(),
            signature,
            data: RawValue::from_string(salted).map_err(Error::internal)?,
        })
    }

    /// Validate with a one-off verifier (no cache, no own hostname).
    /// `consensus` cannot be zero: an unverifiable envelope with no consensus
    /// path could never be accepted, so that configuration is rejected
    /// outright.
    pub async fn validate(
        &self,
        consensus: u32,
        informants: Vec<String>,
        trusted: Vec<String>,
    ) -> Result<()> {
        if consensus == 0 {
            return Err(Error::internal_msg("consensus cannot be zero"));
        }
        let client = VerifierClient::new(None, informants, trusted, "", consensus);
        self.validate_with(&client).await
    }

    /// Validate against an existing verifier (shares its cache and trust
    /// lists). Shape failures are user-facing; a blob nobody will vouch for
    /// is `Unauthorized`.
    pub async fn validate_with(&self, client: &VerifierClient) -> Result<()> {
        #[derive(Deserialize)]
        struct SaltBody {
            #[serde(default)]
            salt: String,
        }
        let body: SaltBody = serde_json::from_str(self.data.get())
            .map_err(|_| Error::invalid("salt not in json payload"))?;
        if body.salt.is_empty() {
            return Err(Error::invalid("salt not in json payload"));
        }
        if self.hostname.is_empty() || self.hostname.contains('\n') {
            return Err(Error::invalid("hostname is not found"));
        }
        if self.signature.is_empty() {
            return Err(Error::invalid("signature is not found"));
        }

        let hash_str = BASE64.encode(Sha256::digest(self.data.get().as_bytes()));
        let blob = format!("{}\n{}\n{}", self.hostname, hash_str, self.signature);
        if !client.process_hash_blob(&blob, &[]).await {
            return Err(Error::unauthorized(
                "cannot verify the message came from the hostname specified",
            ));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {super::*, crate::cache::HashCache, crate::cache_memory::MemoryCache, serde_json::json};

    fn offline_client(cache: Arc<MemoryCache>) -> VerifierClient {
        VerifierClient::new(Some(cache), vec![], vec![], "", 1)
    }

    #[test]
    fn test_salt_is_first_key_and_unique() {
        let identity = SigningIdentity::generate().unwrap();
        let data = json!({"kind": "greeting"});
        let a = CrossNodeMessage::new(&data, "node.example.com", &identity).unwrap();
        let b = CrossNodeMessage::new(&data, "node.example.com", &identity).unwrap();

        assert!(a.data.get().starts_with("{\"salt\":\""));
        assert_ne!(a.data.get(), b.data.get(), "salts must differ");
        assert_ne!(a.signature, b.signature);

        // The original payload survives the splice.
        let parsed: serde_json::Value = serde_json::from_str(a.data.get()).unwrap();
        assert_eq!(parsed["kind"], "greeting");
    }

    #[test]
    fn test_empty_object_still_salted() {
        let identity = SigningIdentity::generate().unwrap();
        let msg = CrossNodeMessage::new(&json!({}), "node.example.com", &identity).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(msg.data.get()).unwrap();
        assert!(parsed["salt"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[test]
    fn test_non_object_rejected() {
        let identity = SigningIdentity::generate().unwrap();
        let err = CrossNodeMessage::new(&json!([1, 2, 3]), "node.example.com", &identity)
            .unwrap_err();
        assert!(err.is_user_facing());
    }

    #[tokio::test]
    async fn test_roundtrip_validates_with_cached_key() {
        let identity = SigningIdentity::generate().unwrap();
        let cache = Arc::new(MemoryCache::new());
        cache
            .write_key("node.example.com", identity.public_pem().as_bytes())
            .await;

        let msg =
            CrossNodeMessage::new(&json!({"action": "hello"}), "node.example.com", &identity)
                .unwrap();
        // Envelope travels as JSON and is validated on the far side.
        let wire = serde_json::to_string(&msg).unwrap();
        let received: CrossNodeMessage = serde_json::from_str(&wire).unwrap();
        received
            .validate_with(&offline_client(cache))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tampered_data_refused() {
        let identity = SigningIdentity::generate().unwrap();
        let cache = Arc::new(MemoryCache::new());
        cache
            .write_key("node.example.com", identity.public_pem().as_bytes())
            .await;

        let msg = CrossNodeMessage::new(&json!({"amount": 5}), "node.example.com", &identity)
            .unwrap();
        let tampered = CrossNodeMessage {
            data: RawValue::from_string(msg.data.get().replace('5', "9")).unwrap(),
            ..msg
        };
        let err = tampered
            .validate_with(&offline_client(cache))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_missing_salt_is_invalid() {
        let identity = SigningIdentity::generate().unwrap();
        let msg = CrossNodeMessage {
            hostname: "node.example.com".into(),
            signature: identity.sign("whatever").unwrap(),
            data: RawValue::from_string("{\"no_salt\":true}".into()).unwrap(),
        };
        let err = msg.validate(1, vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn test_hostname_rules() {
        let identity = SigningIdentity::generate().unwrap();
        let good = CrossNodeMessage::new(&json!({"a": 1}), "node.example.com", &identity).unwrap();

        let blank = CrossNodeMessage {
            hostname: String::new(),
            ..good.clone()
        };
        assert!(matches!(
            blank.validate(1, vec![], vec![]).await.unwrap_err(),
            Error::Invalid(_)
        ));

        let sneaky = CrossNodeMessage {
            hostname: "a.example.com\nb.example.com".into(),
            ..good
        };
        assert!(matches!(
            sneaky.validate(1, vec![], vec![]).await.unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_consensus_rejected() {
        let identity = SigningIdentity::generate().unwrap();
        let msg = CrossNodeMessage::new(&json!({"a": 1}), "node.example.com", &identity).unwrap();
        let err = msg.validate(0, vec![], vec![]).await.unwrap_err();
        assert!(!err.is_user_facing());
    }
}
