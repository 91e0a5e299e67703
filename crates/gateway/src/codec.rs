//! Per-socket frame codec: tagged payloads plus the optional persistent zlib
//! stream wrappers.

use {
    spherical_common::Result,
    spherical_protocol::{
        Payload,
        compress::{ZlibStreamDecoder, ZlibStreamEncoder},
    },
};

/// Encodes outbound payloads. One per socket direction; the zlib context is
/// allocated once and reused for every frame.
pub struct FrameEncoder {
    zlib: Option<ZlibStreamEncoder>,
}

impl FrameEncoder {
    #[must_use]
    pub fn new(compress: bool) -> Self {
        Self {
            zlib: compress.then(ZlibStreamEncoder::new),
        }
    }

    pub fn encode(&mut self, payload: &Payload) -> Result<Vec<u8>> {
        let frame = payload.encode()?;
        match self.zlib.as_mut() {
            Some(zlib) => zlib.encode(&frame),
            None => Ok(frame),
        }
    }
}

/// Decodes inbound frames.
pub struct FrameDecoder {
    zlib: Option<ZlibStreamDecoder>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(compress: bool) -> Self {
        Self {
            zlib: compress.then(ZlibStreamDecoder::new),
        }
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<Payload> {
        match self.zlib.as_mut() {
            Some(zlib) => Payload::decode(&zlib.decode(bytes)?),
            None => Payload::decode(bytes),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, spherical_protocol::HeartbeatPayload};

    #[test]
    fn test_plain_roundtrip() {
        let mut enc = FrameEncoder::new(false);
        let mut dec = FrameDecoder::new(false);
        let p = Payload::Heartbeat(HeartbeatPayload { id: "hb-1".into() });
        assert_eq!(dec.decode(&enc.encode(&p).unwrap()).unwrap(), p);
    }

    #[test]
    fn test_compressed_roundtrip_over_many_frames() {
        let mut enc = FrameEncoder::new(true);
        let mut dec = FrameDecoder::new(true);
        for i in 0..20 {
            let p = Payload::Heartbeat(HeartbeatPayload {
                id: format!("hb-{i}"),
            });
            assert_eq!(dec.decode(&enc.encode(&p).unwrap()).unwrap(), p);
        }
    }

    #[test]
    fn test_compression_mismatch_fails() {
        let mut enc = FrameEncoder::new(true);
        let mut dec = FrameDecoder::new(false);
        let p = Payload::Heartbeat(HeartbeatPayload { id: "hb".into() });
        assert!(dec.decode(&enc.encode(&p).unwrap()).is_err());
    }
}
