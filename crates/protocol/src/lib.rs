//! Gateway wire protocol.
//!
//! Every frame is a length-delimited binary WebSocket message: a big-endian
//! 16-bit tag followed by a msgpack-encoded body (named fields, so bodies are
//! key-tagged maps). Disconnection is the one JSON special case: it rides in
//! the WebSocket close frame.
//!
//! | tag | payload       |
//! |-----|---------------|
//! | 0   | `Hello`       |
//! | 1   | `Accepted`    |
//! | 2   | `Heartbeat`   |
//! | 3   | `JoinGuild`   |
//! | 4   | `Ready`       |
//! | 5   | `GuildUpdate` |

pub mod compress;

use serde::{Deserialize, Serialize};

use spherical_common::{Error, Result};

// ── Constants ────────────────────────────────────────────────────────────────

/// Interval at which the server emits heartbeats.
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;
/// A heartbeat left unanswered for 2x the interval kills the socket.
pub const HEARTBEAT_TIMEOUT_MS: u64 = HEARTBEAT_INTERVAL_MS * 2;
/// The first (Hello) frame must arrive within this window.
pub const HELLO_TIMEOUT_MS: u64 = 5000;
/// Budget for cross-node guild discovery before Ready is sent regardless.
pub const DISCOVERY_BUDGET_MS: u64 = 5000;

/// Query parameter value that enables the persistent zlib stream.
pub const COMPRESS_ZLIB_STREAM: &str = "zlib-stream";

/// WebSocket close codes in use.
pub mod close_codes {
    /// Going away: timeouts and orderly shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Invalid frame: protocol violations and bad credentials.
    pub const INVALID_PAYLOAD: u16 = 1002;
    /// Internal error.
    pub const INTERNAL: u16 = 1011;
}

// ── Payload bodies ───────────────────────────────────────────────────────────

/// First frame a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub token: String,
    /// Set when `token` is a single-use node-auth token rather than a local
    /// session token. Clients can omit this; it is for nodes.
    #[serde(default)]
    pub cross_node: bool,
}

/// Sent after authentication, before the connection is "done"; the server
/// may still be dialling other nodes at this point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedPayload {
    /// Interval at which heartbeats will be sent, in milliseconds.
    pub heartbeat_interval: u64,
}

/// Whichever peer receives this must immediately respond with a heartbeat of
/// the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGuildPayload {
    /// Hostname where the guild lives. Blank on a cross-node socket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub invite_code: String,
    pub reply_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub available_guilds: Vec<Guild>,
    pub unavailable_guilds: Vec<Guild>,
}

/// A single guild on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildUpdatePayload {
    pub guild: Guild,
}

// ── Protocol objects ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub name: String,
    pub kind: ChannelKind,
    pub permissions: u64,
}

/// Partial member object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub hostname: String,
}

/// A guild as seen on the wire. When `available` is false the rest of the
/// struct is undefined and omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guild {
    pub id: u64,
    /// Hostname of the owning node. Blank on a cross-node socket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Member>,
}

impl Guild {
    /// An unavailable placeholder for a guild we know exists but could not
    /// load.
    #[must_use]
    pub fn unavailable(id: u64, hostname: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            available: false,
            ..Self::default()
        }
    }
}

/// Carried JSON-encoded in the close frame alongside a standard close code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: String,
    pub reconnect: bool,
}

impl DisconnectPayload {
    #[must_use]
    pub fn new(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            reason: reason.into(),
            reconnect,
        }
    }

    #[must_use]
    pub fn to_close_reason(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

// ── Tagged frame codec ───────────────────────────────────────────────────────

/// Discriminated union of every tagged payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hello(HelloPayload),
    Accepted(AcceptedPayload),
    Heartbeat(HeartbeatPayload),
    JoinGuild(JoinGuildPayload),
    Ready(ReadyPayload),
    GuildUpdate(GuildUpdatePayload),
}

impl Payload {
    #[must_use]
    pub fn tag(&self) -> u16 {
        match self {
            Self::Hello(_) => 0,
            Self::Accepted(_) => 1,
            Self::Heartbeat(_) => 2,
            Self::JoinGuild(_) => 3,
            Self::Ready(_) => 4,
            Self::GuildUpdate(_) => 5,
        }
    }

    /// Serialize to a tagged binary frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Self::Hello(p) => rmp_serde::to_vec_named(p),
            Self::Accepted(p) => rmp_serde::to_vec_named(p),
            Self::Heartbeat(p) => rmp_serde::to_vec_named(p),
            Self::JoinGuild(p) => rmp_serde::to_vec_named(p),
            Self::Ready(p) => rmp_serde::to_vec_named(p),
            Self::GuildUpdate(p) => rmp_serde::to_vec_named(p),
        }
        .map_err(Error::internal)?;

        let mut frame = Vec::with_capacity(2 + body.len());
        frame.extend_from_slice(&self.tag().to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parse a tagged binary frame. Short frames, unknown tags and malformed
    /// bodies are all `Invalid`.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 2 {
            return Err(Error::invalid("frame shorter than its tag"));
        }
        let tag = u16::from_be_bytes([frame[0], frame[1]]);
        let body = &frame[2..];

        fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
            rmp_serde::from_slice(body).map_err(|e| Error::invalid(format!("bad frame body: {e}")))
        }

        Ok(match tag {
            0 => Self::Hello(parse(body)?),
            1 => Self::Accepted(parse(body)?),
            2 => Self::Heartbeat(parse(body)?),
            3 => Self::JoinGuild(parse(body)?),
            4 => Self::Ready(parse(body)?),
            5 => Self::GuildUpdate(parse(body)?),
            other => return Err(Error::invalid(format!("unknown payload tag {other}"))),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let p = Payload::Hello(HelloPayload {
            token: "tok".into(),
            cross_node: true,
        });
        let frame = p.encode().unwrap();
        assert_eq!(&frame[..2], &[0, 0]);
        assert_eq!(Payload::decode(&frame).unwrap(), p);
    }

    #[test]
    fn test_tags_are_stable() {
        let cases: Vec<Payload> = vec![
            Payload::Hello(HelloPayload {
                token: String::new(),
                cross_node: false,
            }),
            Payload::Accepted(AcceptedPayload {
                heartbeat_interval: 2000,
            }),
            Payload::Heartbeat(HeartbeatPayload { id: "x".into() }),
            Payload::JoinGuild(JoinGuildPayload {
                hostname: String::new(),
                invite_code: "inv".into(),
                reply_id: "r".into(),
            }),
            Payload::Ready(ReadyPayload {
                available_guilds: vec![],
                unavailable_guilds: vec![],
            }),
            Payload::GuildUpdate(GuildUpdatePayload {
                guild: Guild::unavailable(1, "a.example.com"),
            }),
        ];
        for (want, p) in cases.iter().enumerate() {
            assert_eq!(p.tag(), want as u16);
            let frame = p.encode().unwrap();
            assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), want as u16);
        }
    }

    #[test]
    fn test_ready_with_guilds() {
        let p = Payload::Ready(ReadyPayload {
            available_guilds: vec![Guild {
                id: 42,
                hostname: "peer-a.example.com".into(),
                available: true,
                name: Some("general".into()),
                channels: vec![Channel {
                    id: 1,
                    name: "chat".into(),
                    kind: ChannelKind::Text,
                    permissions: 0,
                }],
                owner_id: Some(7),
                ..Guild::default()
            }],
            unavailable_guilds: vec![Guild::unavailable(9, "gone.example.com")],
        });
        let back = Payload::decode(&p.encode().unwrap()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_hello_cross_node_defaults_false() {
        // A client omitting cross_node entirely still parses.
        #[derive(serde::Serialize)]
        struct Partial<'a> {
            token: &'a str,
        }
        let body = rmp_serde::to_vec_named(&Partial { token: "t" }).unwrap();
        let mut frame = vec![0, 0];
        frame.extend_from_slice(&body);
        match Payload::decode(&frame).unwrap() {
            Payload::Hello(h) => assert!(!h.cross_node),
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Payload::decode(&[]).is_err());
        assert!(Payload::decode(&[0]).is_err());
        assert!(Payload::decode(&[0, 99, 1, 2, 3]).is_err());
        // Known tag, junk body.
        assert!(Payload::decode(&[0, 2, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_disconnect_payload_json() {
        let d = DisconnectPayload::new("connection timed out", true);
        let s = d.to_close_reason();
        let back: DisconnectPayload = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
    }
}
