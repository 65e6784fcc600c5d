//! WebSocket frame construction, serialization and parsing.

use thiserror::Error;

use crate::close::CloseCode;
use crate::opcode::Opcode;

/// Maximum payload length of a control frame (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Pre-serialized empty, unmasked ping frame.
///
/// Shared by every heartbeat sweep and default broadping so the frame is
/// never rebuilt per session.
pub const EMPTY_PING_FRAME: [u8; 2] = [0x89, 0x00];

/// Errors produced by frame construction or parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload is {0} bytes, maximum is {MAX_CONTROL_PAYLOAD}")]
    ControlPayloadTooLong(usize),

    /// Input ended before the frame was complete.
    #[error("truncated frame: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required to finish the frame.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Reserved or unknown opcode nibble.
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    /// Control frames must not be fragmented.
    #[error("fragmented control frame")]
    FragmentedControl,
}

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key, present when the frame is masked.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a data or continuation frame.
    #[must_use]
    pub fn message(opcode: Opcode, payload: Vec<u8>, fin: bool) -> Self {
        Self {
            fin,
            opcode,
            mask_key: None,
            payload,
        }
    }

    /// Create an unmasked close frame carrying a status code and reason.
    ///
    /// The payload is the 2-byte big-endian code followed by the UTF-8
    /// reason.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ControlPayloadTooLong`] if code plus reason
    /// exceed the control-frame ceiling.
    pub fn close(code: CloseCode, reason: &str) -> Result<Self, FrameError> {
        let total = 2 + reason.len();
        if total > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLong(total));
        }
        let mut payload = Vec::with_capacity(total);
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Ok(Self {
            fin: true,
            opcode: Opcode::Close,
            mask_key: None,
            payload,
        })
    }

    /// Create a ping frame, masked with a random key when `masked` is true.
    ///
    /// Server-to-client pings are unmasked; the masked variant exists for
    /// client-mode use.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ControlPayloadTooLong`] if the payload exceeds
    /// the control-frame ceiling.
    pub fn ping(payload: Vec<u8>, masked: bool) -> Result<Self, FrameError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLong(payload.len()));
        }
        Ok(Self {
            fin: true,
            opcode: Opcode::Ping,
            mask_key: masked.then(rand::random::<[u8; 4]>),
            payload,
        })
    }

    /// Create an unmasked pong frame echoing a ping payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::ControlPayloadTooLong`] if the payload exceeds
    /// the control-frame ceiling.
    pub fn pong(payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLong(payload.len()));
        }
        Ok(Self {
            fin: true,
            opcode: Opcode::Pong,
            mask_key: None,
            payload,
        })
    }

    /// Check if this frame is masked.
    #[must_use]
    pub const fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Serialize the frame to wire bytes.
    ///
    /// Applies the 7-bit / 16-bit / 64-bit extended length encoding and the
    /// masking transform when a mask key is present.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        let fin_bit = if self.fin { 0x80 } else { 0x00 };
        out.push(fin_bit | self.opcode.as_u8());

        let mask_bit = if self.is_masked() { 0x80 } else { 0x00 };
        if len <= 125 {
            #[allow(clippy::cast_possible_truncation)]
            out.push(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            out.push(mask_bit | 126);
            #[allow(clippy::cast_possible_truncation)]
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask_key {
            Some(key) => {
                out.extend_from_slice(&key);
                out.extend(
                    self.payload
                        .iter()
                        .enumerate()
                        .map(|(i, b)| b ^ key[i % 4]),
                );
            }
            None => out.extend_from_slice(&self.payload),
        }

        out
    }

    /// Parse a single frame from the front of `input`.
    ///
    /// Returns the frame (payload unmasked) and the number of bytes
    /// consumed.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if `input` does not hold a complete
    /// frame, [`FrameError::ReservedOpcode`] on an unknown opcode, and
    /// [`FrameError::FragmentedControl`] or
    /// [`FrameError::ControlPayloadTooLong`] on malformed control frames.
    pub fn parse(input: &[u8]) -> Result<(Self, usize), FrameError> {
        if input.len() < 2 {
            return Err(FrameError::Truncated {
                needed: 2,
                available: input.len(),
            });
        }

        let fin = input[0] & 0x80 != 0;
        let opcode_bits = input[0] & 0x0F;
        let opcode =
            Opcode::from_u8(opcode_bits).ok_or(FrameError::ReservedOpcode(opcode_bits))?;

        let masked = input[1] & 0x80 != 0;
        let len7 = input[1] & 0x7F;

        let mut offset = 2usize;
        let payload_len = match len7 {
            126 => {
                let end = offset + 2;
                let bytes = input.get(offset..end).ok_or(FrameError::Truncated {
                    needed: end,
                    available: input.len(),
                })?;
                offset = end;
                usize::from(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            127 => {
                let end = offset + 8;
                let bytes = input.get(offset..end).ok_or(FrameError::Truncated {
                    needed: end,
                    available: input.len(),
                })?;
                offset = end;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                usize::try_from(u64::from_be_bytes(raw)).unwrap_or(usize::MAX)
            }
            n => usize::from(n),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlPayloadTooLong(payload_len));
            }
        }

        let mask_key = if masked {
            let end = offset + 4;
            let bytes = input.get(offset..end).ok_or(FrameError::Truncated {
                needed: end,
                available: input.len(),
            })?;
            offset = end;
            let mut key = [0u8; 4];
            key.copy_from_slice(bytes);
            Some(key)
        } else {
            None
        };

        let end = offset.checked_add(payload_len).ok_or(FrameError::Truncated {
            needed: usize::MAX,
            available: input.len(),
        })?;
        let raw_payload = input.get(offset..end).ok_or(FrameError::Truncated {
            needed: end,
            available: input.len(),
        })?;

        let payload = match mask_key {
            Some(key) => raw_payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % 4])
                .collect(),
            None => raw_payload.to_vec(),
        };

        Ok((
            Self {
                fin,
                opcode,
                mask_key,
                payload,
            },
            end,
        ))
    }
}

/// Split a data payload into a fragment chain at `fragment_size` bytes.
///
/// The first frame carries `opcode`, subsequent frames are continuations,
/// and only the last frame has fin set. A payload that fits in one fragment
/// yields a single final frame. An empty payload yields one empty final
/// frame.
#[must_use]
pub fn fragment(opcode: Opcode, payload: &[u8], fragment_size: usize) -> Vec<Frame> {
    let size = fragment_size.max(1);
    if payload.len() <= size {
        return vec![Frame::message(opcode, payload.to_vec(), true)];
    }

    let mut frames = Vec::with_capacity(payload.len().div_ceil(size));
    let mut chunks = payload.chunks(size).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let op = if first { opcode } else { Opcode::Continuation };
        first = false;
        frames.push(Frame::message(op, chunk.to_vec(), chunks.peek().is_none()));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Serialization Tests ====================

    #[test]
    fn test_serialize_short_text_frame() {
        let frame = Frame::message(Opcode::Text, b"hi".to_vec(), true);
        assert_eq!(frame.serialize(), vec![0x81, 0x02, 0x68, 0x69]);
    }

    #[test]
    fn test_serialize_empty_ping_matches_constant() {
        let frame = Frame::ping(Vec::new(), false).unwrap();
        assert_eq!(frame.serialize(), EMPTY_PING_FRAME.to_vec());
    }

    #[test]
    fn test_serialize_extended_16bit_length() {
        let frame = Frame::message(Opcode::Binary, vec![0xAB; 300], true);
        let bytes = frame.serialize();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1], 126);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 300);
        assert_eq!(bytes.len(), 4 + 300);
    }

    #[test]
    fn test_serialize_extended_64bit_length() {
        let frame = Frame::message(Opcode::Binary, vec![0; 70_000], true);
        let bytes = frame.serialize();
        assert_eq!(bytes[1], 127);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[2..10]);
        assert_eq!(u64::from_be_bytes(raw), 70_000);
    }

    #[test]
    fn test_serialize_non_final_frame_clears_fin() {
        let frame = Frame::message(Opcode::Binary, b"abc".to_vec(), false);
        assert_eq!(frame.serialize()[0], 0x02);
    }

    #[test]
    fn test_serialize_masked_frame() {
        let frame = Frame {
            fin: true,
            opcode: Opcode::Ping,
            mask_key: Some([1, 2, 3, 4]),
            payload: b"ab".to_vec(),
        };
        let bytes = frame.serialize();
        assert_eq!(bytes[1], 0x80 | 2);
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
        assert_eq!(bytes[6], b'a' ^ 1);
        assert_eq!(bytes[7], b'b' ^ 2);
    }

    // ==================== Factory Tests ====================

    #[test]
    fn test_close_frame_payload_layout() {
        let frame = Frame::close(CloseCode::Away, "bye").unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..2], &1001u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"bye");
    }

    #[test]
    fn test_close_frame_reason_too_long() {
        let reason = "x".repeat(124);
        let result = Frame::close(CloseCode::Normal, &reason);
        assert!(matches!(result, Err(FrameError::ControlPayloadTooLong(126))));
    }

    #[test]
    fn test_ping_frame_at_ceiling() {
        let frame = Frame::ping(vec![0; MAX_CONTROL_PAYLOAD], false).unwrap();
        assert_eq!(frame.payload.len(), 125);
    }

    #[test]
    fn test_ping_frame_over_ceiling() {
        let result = Frame::ping(vec![0; 126], false);
        assert!(matches!(result, Err(FrameError::ControlPayloadTooLong(126))));
    }

    #[test]
    fn test_masked_ping_has_key() {
        let frame = Frame::ping(b"x".to_vec(), true).unwrap();
        assert!(frame.is_masked());
    }

    #[test]
    fn test_pong_echoes_payload() {
        let frame = Frame::pong(b"beat".to_vec()).unwrap();
        assert_eq!(frame.opcode, Opcode::Pong);
        assert_eq!(frame.payload, b"beat");
    }

    // ==================== Parse Tests ====================

    #[test]
    fn test_parse_roundtrip_unmasked() {
        let original = Frame::message(Opcode::Text, b"hello".to_vec(), true);
        let bytes = original.serialize();
        let (parsed, consumed) = Frame::parse(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_parse_roundtrip_masked() {
        let original = Frame {
            fin: true,
            opcode: Opcode::Binary,
            mask_key: Some([9, 8, 7, 6]),
            payload: vec![1, 2, 3, 4, 5],
        };
        let (parsed, _) = Frame::parse(&original.serialize()).unwrap();
        // Payload comes back unmasked.
        assert_eq!(parsed.payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.mask_key, Some([9, 8, 7, 6]));
    }

    #[test]
    fn test_parse_roundtrip_extended_length() {
        let original = Frame::message(Opcode::Binary, vec![7; 600], true);
        let bytes = original.serialize();
        let (parsed, consumed) = Frame::parse(&bytes).unwrap();
        assert_eq!(parsed.payload.len(), 600);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_parse_truncated_header() {
        assert!(matches!(
            Frame::parse(&[0x81]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_truncated_payload() {
        // Declares 5 payload bytes, provides 2.
        assert!(matches!(
            Frame::parse(&[0x81, 0x05, 0x61, 0x62]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parse_reserved_opcode() {
        assert!(matches!(
            Frame::parse(&[0x83, 0x00]),
            Err(FrameError::ReservedOpcode(0x3))
        ));
    }

    #[test]
    fn test_parse_fragmented_control_rejected() {
        // Ping with fin clear.
        assert!(matches!(
            Frame::parse(&[0x09, 0x00]),
            Err(FrameError::FragmentedControl)
        ));
    }

    #[test]
    fn test_parse_trailing_bytes_ignored() {
        let mut bytes = Frame::message(Opcode::Text, b"hi".to_vec(), true).serialize();
        let frame_len = bytes.len();
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let (_, consumed) = Frame::parse(&bytes).unwrap();
        assert_eq!(consumed, frame_len);
    }

    // ==================== Fragmentation Tests ====================

    #[test]
    fn test_fragment_small_payload_single_frame() {
        let frames = fragment(Opcode::Binary, &[1, 2, 3], 1024);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, Opcode::Binary);
    }

    #[test]
    fn test_fragment_exact_boundary_single_frame() {
        let frames = fragment(Opcode::Binary, &[0; 1024], 1024);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_fragment_chain_shape() {
        let payload: Vec<u8> = (0..10).collect();
        let frames = fragment(Opcode::Text, &payload, 4);
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].opcode, Opcode::Text);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, Opcode::Continuation);
        assert!(!frames[1].fin);
        assert_eq!(frames[2].opcode, Opcode::Continuation);
        assert!(frames[2].fin);

        let reassembled: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_fragment_empty_payload() {
        let frames = fragment(Opcode::Binary, &[], 16);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_fragment_zero_size_clamped() {
        let frames = fragment(Opcode::Binary, &[1, 2], 0);
        assert_eq!(frames.len(), 2);
    }
}
