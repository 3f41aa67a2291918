//! Framed wire codec.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------------+---------------------------------------+
//! | 3-byte BE len  | LZ4 block (u32 LE decompressed size,  |
//! |                | then compressed bincode envelope)     |
//! +----------------+---------------------------------------+
//! ```
//!
//! The length prefix counts the compressed block only and bounds a single
//! frame to [`MAX_FRAME_BYTES`]. The declared decompressed size is checked
//! against the same bound before inflating, so an oversized or hostile frame
//! is rejected before any allocation or dispatch. The codec is symmetric:
//! both the authority and remote peers encode and decode the same way.
//!
//! [`FrameDecoder`] is incremental: feed it arbitrary byte chunks as they
//! arrive from the transport and drain complete envelopes as they become
//! available.

use crate::error::WireError;
use crate::messages::Envelope;

/// Upper bound for a single frame, compressed or decompressed.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Width of the big-endian length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 3;

/// Encodes an envelope into a complete frame ready to write to the
/// transport.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(envelope).map_err(WireError::Encode)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::BodyTooLarge {
            length: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let block = lz4_flex::compress_prepend_size(&body);
    if block.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            length: block.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + block.len());
    let len = block.len() as u32;
    frame.push((len >> 16) as u8);
    frame.push((len >> 8) as u8);
    frame.push(len as u8);
    frame.extend_from_slice(&block);
    Ok(frame)
}

/// Interprets a length prefix.
pub fn prefix_len(prefix: [u8; LENGTH_PREFIX_BYTES]) -> usize {
    ((prefix[0] as usize) << 16) | ((prefix[1] as usize) << 8) | (prefix[2] as usize)
}

/// Decodes one frame body (the compressed block, without the length
/// prefix) into an envelope.
pub fn decode_body(block: &[u8]) -> Result<Envelope, WireError> {
    let (declared, _) = lz4_flex::block::uncompressed_size(block)?;
    if declared > MAX_FRAME_BYTES {
        return Err(WireError::BodyTooLarge {
            length: declared,
            max: MAX_FRAME_BYTES,
        });
    }
    let body = lz4_flex::decompress_size_prepended(block)?;
    bincode::deserialize(&body).map_err(WireError::Decode)
}

/// Incremental frame decoder.
///
/// Owns a reassembly buffer. Callers feed raw transport chunks with
/// [`FrameDecoder::feed`] and then drain envelopes with
/// [`FrameDecoder::next_frame`] until it returns `Ok(None)`. A frame whose
/// declared length exceeds [`MAX_FRAME_BYTES`] is rejected without being
/// buffered further; the connection should be torn down at that point.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends a chunk received from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next complete envelope.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal to
    /// the stream: the buffer contents after a framing error are undefined.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, WireError> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let declared = prefix_len([self.buf[0], self.buf[1], self.buf[2]]);
        if declared > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge {
                length: declared,
                max: MAX_FRAME_BYTES,
            });
        }
        let total = LENGTH_PREFIX_BYTES + declared;
        if self.buf.len() < total {
            return Ok(None);
        }
        let envelope = decode_body(&self.buf[LENGTH_PREFIX_BYTES..total])?;
        self.buf.drain(..total);
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectReason;

    fn sample_envelope() -> Envelope {
        Envelope::TimeSync {
            tick: 42,
            server_time_ms: 123_456_789,
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(&sample_envelope()).unwrap();
        assert!(frame.len() > LENGTH_PREFIX_BYTES);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        match decoded {
            Envelope::TimeSync {
                tick,
                server_time_ms,
            } => {
                assert_eq!(tick, 42);
                assert_eq!(server_time_ms, 123_456_789);
            }
            other => panic!("wrong envelope: {:?}", other),
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_handles_byte_at_a_time_delivery() {
        let frame = encode_frame(&sample_envelope()).unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, byte) in frame.iter().enumerate() {
            decoder.feed(&[*byte]);
            let result = decoder.next_frame().unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                assert!(result.is_some());
            }
        }
    }

    #[test]
    fn test_decoder_handles_two_frames_in_one_chunk() {
        let a = encode_frame(&Envelope::TimeSync {
            tick: 1,
            server_time_ms: 10,
        })
        .unwrap();
        let b = encode_frame(&Envelope::Disconnect {
            reason: DisconnectReason::Shutdown,
        })
        .unwrap();

        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&joined);
        assert!(matches!(
            decoder.next_frame().unwrap(),
            Some(Envelope::TimeSync { tick: 1, .. })
        ));
        assert!(matches!(
            decoder.next_frame().unwrap(),
            Some(Envelope::Disconnect {
                reason: DisconnectReason::Shutdown
            })
        ));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversized_prefix_rejected_before_buffering_body() {
        let mut decoder = FrameDecoder::new();
        // Declares a 16 MiB frame, twice the allowed maximum.
        decoder.feed(&[0xFF, 0xFF, 0xFF]);
        match decoder.next_frame() {
            Err(WireError::FrameTooLarge { length, max }) => {
                assert_eq!(length, 0xFF_FF_FF);
                assert_eq!(max, MAX_FRAME_BYTES);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_declared_body_rejected_before_inflate() {
        // A block whose header claims a decompressed size over the limit.
        let huge = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
        let mut block = huge.to_vec();
        block.extend_from_slice(&[0u8; 16]);

        match decode_body(&block) {
            Err(WireError::BodyTooLarge { length, .. }) => {
                assert_eq!(length, MAX_FRAME_BYTES + 1);
            }
            other => panic!("expected BodyTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_block_is_an_error_not_a_panic() {
        let frame = encode_frame(&sample_envelope()).unwrap();
        let mut corrupt = frame.clone();
        // Flip bytes in the compressed payload, past the size header.
        let at = LENGTH_PREFIX_BYTES + 5;
        corrupt[at] ^= 0xFF;
        if corrupt.len() > at + 1 {
            corrupt[at + 1] ^= 0xFF;
        }

        let mut decoder = FrameDecoder::new();
        decoder.feed(&corrupt);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_truncated_frame_waits_for_more_bytes() {
        let frame = encode_frame(&sample_envelope()).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame[..frame.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.feed(&frame[frame.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_prefix_len_is_big_endian() {
        assert_eq!(prefix_len([0, 0, 1]), 1);
        assert_eq!(prefix_len([0, 1, 0]), 256);
        assert_eq!(prefix_len([1, 0, 0]), 65_536);
        assert_eq!(prefix_len([0x7F, 0xFF, 0xFF]), 8_388_607);
    }
}
