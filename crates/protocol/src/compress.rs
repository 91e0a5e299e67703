//! Persistent zlib stream compression for gateway frames.
//!
//! When a client connects with `?compress=zlib-stream`, each direction is one
//! continuous zlib stream: the context is allocated once and every frame is a
//! continuation, sync-flushed so the peer can decode it on arrival. This is
//! NOT per-message deflate; a fresh context cannot decode a mid-stream frame.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use spherical_common::{Error, Result};

/// Write half of a compressed direction. One per socket, never reset.
pub struct ZlibStreamEncoder {
    ctx: Compress,
}

impl Default for ZlibStreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStreamEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: Compress::new(Compression::default(), true),
        }
    }

    /// Compress one frame as a continuation of the stream.
    pub fn encode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            let before = self.ctx.total_in();
            self.ctx
                .compress_vec(&frame[consumed..], &mut out, FlushCompress::Sync)
                .map_err(Error::internal)?;
            consumed += (self.ctx.total_in() - before) as usize;
            // The sync flush is complete once all input is taken and zlib
            // stopped short of filling the buffer we gave it.
            if consumed == frame.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(frame.len().max(256));
        }
    }
}

/// Read half of a compressed direction.
pub struct ZlibStreamDecoder {
    ctx: Decompress,
}

impl Default for ZlibStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: Decompress::new(true),
        }
    }

    /// Inflate one received frame. Corrupt input is `Invalid`; the caller
    /// should tear the socket down, the stream state is unrecoverable.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.len() * 2 + 64);
        let mut consumed = 0usize;
        loop {
            let before = self.ctx.total_in();
            let status = self
                .ctx
                .decompress_vec(&frame[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::invalid(format!("zlib stream corrupt: {e}")))?;
            consumed += (self.ctx.total_in() - before) as usize;
            if matches!(status, Status::StreamEnd) {
                return Err(Error::invalid("zlib stream ended mid-connection"));
            }
            if consumed == frame.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(frame.len().max(256));
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip() {
        let mut enc = ZlibStreamEncoder::new();
        let mut dec = ZlibStreamDecoder::new();

        let frames: Vec<Vec<u8>> = vec![
            b"first frame".to_vec(),
            b"second frame with a bit more text in it".to_vec(),
            vec![0u8; 4096],
            b"tail".to_vec(),
        ];
        for frame in &frames {
            let wire = enc.encode(frame).unwrap();
            let back = dec.decode(&wire).unwrap();
            assert_eq!(&back, frame);
        }
    }

    #[test]
    fn test_frames_are_continuations_not_messages() {
        // A fresh decoder must NOT be able to pick the stream up mid-way;
        // per-message deflate would pass this, a shared context must not.
        let mut enc = ZlibStreamEncoder::new();
        let first = enc.encode(b"carries the zlib header").unwrap();
        let second = enc.encode(b"continuation").unwrap();

        let mut fresh = ZlibStreamDecoder::new();
        assert!(fresh.decode(&second).is_err());

        let mut proper = ZlibStreamDecoder::new();
        proper.decode(&first).unwrap();
        assert_eq!(proper.decode(&second).unwrap(), b"continuation");
    }

    #[test]
    fn test_large_frame_growth() {
        let mut enc = ZlibStreamEncoder::new();
        let mut dec = ZlibStreamDecoder::new();
        // Incompressible data forces the encoder's output buffer to grow.
        let frame: Vec<u8> = (0..200_000u32)
            .map(|i| i.wrapping_mul(2_654_435_761) as u8)
            .collect();
        let wire = enc.encode(&frame).unwrap();
        assert_eq!(dec.decode(&wire).unwrap(), frame);
    }
}
