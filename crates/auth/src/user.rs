//! The user context transported across nodes.

use {
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    serde::{Deserialize, Serialize},
};

use spherical_common::{Error, Result};

/// User flag bits.
pub mod flags {
    /// The node owner.
    pub const OWNER: u64 = 1 << 0;
}

/// Everything another node is allowed to know about a user, plus the fields
/// only the home node holds (`email`, `confirmed`), which MUST be cleared
/// before transit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub username: String,
    pub user_id: u64,
    pub flags: u64,
    pub avatar_url: String,

    /// Node that asserted this context. Empty while in flight; the receiving
    /// side stamps it from the validated envelope.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Blank unless this is the user's home node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    /// False unless this is the user's home node.
    #[serde(default)]
    pub confirmed: bool,
}

impl UserContext {
    /// Whether this context came from the local node.
    #[must_use]
    pub fn same_node(&self) -> bool {
        !self.email.is_empty()
    }

    /// Strip everything a remote node has no business seeing.
    pub fn redact_for_transit(&mut self) {
        self.hostname.clear();
        self.email.clear();
        self.confirmed = false;
    }

    /// `Authorization` header value for cross-node requests. Redacts first.
    pub fn to_auth_header(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.redact_for_transit();
        let json = serde_json::to_vec(&redacted).map_err(Error::internal)?;
        Ok(format!("cross-node {}", BASE64.encode(json)))
    }

    /// Parse a `cross-node` authorization header.
    pub fn from_auth_header(header: &str) -> Result<Self> {
        let mut parts = header.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default().to_lowercase();
        if scheme != "cross-node" {
            return Err(Error::unauthorized("authorization scheme is not cross-node"));
        }
        let blob = parts
            .next()
            .ok_or_else(|| Error::unauthorized("authorization header has no payload"))?;
        let json = BASE64
            .decode(blob.trim())
            .map_err(|_| Error::invalid("authorization payload is not base64"))?;
        serde_json::from_slice(&json).map_err(|_| Error::invalid("authorization payload is not a user context"))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn home_user() -> UserContext {
        UserContext {
            username: "ada".into(),
            user_id: 7,
            flags: flags::OWNER,
            avatar_url: "https://self.example.com/a.png".into(),
            hostname: "self.example.com".into(),
            email: "ada@example.com".into(),
            confirmed: true,
        }
    }

    #[test]
    fn test_same_node_follows_email() {
        assert!(home_user().same_node());
        let mut remote = home_user();
        remote.redact_for_transit();
        assert!(!remote.same_node());
    }

    #[test]
    fn test_redaction_clears_private_fields() {
        let mut user = home_user();
        user.redact_for_transit();
        assert!(user.hostname.is_empty());
        assert!(user.email.is_empty());
        assert!(!user.confirmed);
        // Public identity survives.
        assert_eq!(user.username, "ada");
        assert_eq!(user.user_id, 7);
    }

    #[test]
    fn test_auth_header_roundtrip_is_redacted() {
        let header = home_user().to_auth_header().unwrap();
        assert!(header.starts_with("cross-node "));

        let parsed = UserContext::from_auth_header(&header).unwrap();
        assert_eq!(parsed.username, "ada");
        assert!(parsed.email.is_empty());
        assert!(parsed.hostname.is_empty());
        assert!(!parsed.confirmed);
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(UserContext::from_auth_header("bearer abc").is_err());
        assert!(UserContext::from_auth_header("cross-node").is_err());
        assert!(UserContext::from_auth_header("cross-node not-base64!!").is_err());
    }
}
