//! Tether wire protocol implementation.
//!
//! Every connection carries one or more transfers. A transfer is a single
//! newline-terminated JSON [`Description`] line followed by a run of frames,
//! the last of which has its `is_last` bit set.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────┬─────────────────────────────┬─────────────────────┐
//! │   Kind   │    Length << 1 | IsLast     │       Payload       │
//! │  1 byte  │   2 bytes (big-endian)      │   0..=32767 bytes   │
//! └──────────┴─────────────────────────────┴─────────────────────┘
//! ```
//!
//! - Kind: payload category (`0` file, `1` bytes)
//! - Length: payload length in the upper 15 bits
//! - IsLast: low bit, set on the final frame of a transfer

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 3;

/// Largest payload the 15-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = (u16::MAX >> 1) as usize;

/// Longest Description line accepted from a peer
pub const MAX_DESCRIPTION_LINE: usize = 64 * 1024;

/// Frame kind tag for file chunks
pub const KIND_FILE: u8 = 0;

/// Frame kind tag for byte-buffer chunks
pub const KIND_BYTES: u8 = 1;

/// Category of a transferred payload.
///
/// On the wire this is the raw kind byte. Zero means file; every other
/// value is reassembled as a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum PayloadKind {
    /// Streamed to disk on the receiving side
    File,
    /// Accumulated in memory on the receiving side
    Bytes,
}

impl PayloadKind {
    /// The kind byte written into frame headers.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::File => KIND_FILE,
            Self::Bytes => KIND_BYTES,
        }
    }
}

impl From<u8> for PayloadKind {
    fn from(byte: u8) -> Self {
        if byte == KIND_FILE {
            Self::File
        } else {
            Self::Bytes
        }
    }
}

impl From<PayloadKind> for u8 {
    fn from(kind: PayloadKind) -> Self {
        kind.as_byte()
    }
}

/// One unit of wire transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload category tag
    pub kind: u8,
    /// Frame payload
    pub payload: Vec<u8>,
    /// Whether this frame ends its transfer
    pub is_last: bool,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub fn new(kind: u8, payload: Vec<u8>, is_last: bool) -> Self {
        Self {
            kind,
            payload,
            is_last,
        }
    }

    /// Size of this frame once packed.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload category tag
    pub kind: u8,
    /// Payload length in bytes
    pub payload_length: usize,
    /// Whether the frame ends its transfer
    pub is_last: bool,
}

impl FrameHeader {
    /// Encode the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] if the length does not fit 15 bits.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        if self.payload_length > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge(self.payload_length));
        }
        let value = ((self.payload_length as u16) << 1) | u16::from(self.is_last);
        let [hi, lo] = value.to_be_bytes();
        Ok([self.kind, hi, lo])
    }

    /// Decode a header from bytes.
    #[must_use]
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let value = u16::from_be_bytes([buf[1], buf[2]]);
        Self {
            kind: buf[0],
            payload_length: usize::from(value >> 1),
            is_last: value & 0x01 == 1,
        }
    }
}

/// Pack a frame into its wire representation.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`]. Nothing is produced in that case.
pub fn pack(frame: &Frame) -> Result<Vec<u8>> {
    let header = FrameHeader {
        kind: frame.kind,
        payload_length: frame.payload.len(),
        is_last: frame.is_last,
    }
    .encode()?;

    let mut out = Vec::with_capacity(frame.wire_len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Unpack a single frame from the front of `bytes`.
///
/// Bytes past the declared payload length are ignored.
///
/// # Errors
///
/// Returns [`Error::Format`] if the buffer cannot hold a header or if the
/// declared payload length runs past the end of the buffer.
pub fn unpack(bytes: &[u8]) -> Result<Frame> {
    let Some(header) = bytes.first_chunk::<HEADER_SIZE>() else {
        return Err(Error::Format(format!(
            "frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    };
    let header = FrameHeader::decode(header);

    let end = HEADER_SIZE + header.payload_length;
    if end > bytes.len() {
        return Err(Error::Format(format!(
            "declared payload of {} bytes but only {} available",
            header.payload_length,
            bytes.len() - HEADER_SIZE
        )));
    }

    Ok(Frame {
        kind: header.kind,
        payload: bytes[HEADER_SIZE..end].to_vec(),
        is_last: header.is_last,
    })
}

/// Try to decode one complete frame from the front of `bytes`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// more bytes are needed.
#[must_use]
pub fn decode_frame(bytes: &[u8]) -> Option<(Frame, usize)> {
    let header = FrameHeader::decode(bytes.first_chunk::<HEADER_SIZE>()?);
    let end = HEADER_SIZE + header.payload_length;
    if bytes.len() < end {
        return None;
    }
    let frame = Frame {
        kind: header.kind,
        payload: bytes[HEADER_SIZE..end].to_vec(),
        is_last: header.is_last,
    };
    Some((frame, end))
}

/// Incremental frame decoder.
///
/// Socket reads land on arbitrary boundaries: one read may hold a partial
/// frame, a whole frame, or several frames. Push every read in and pull
/// frames out until [`FrameDecoder::next_frame`] returns `None`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (frame, consumed) = decode_frame(&self.buffer)?;
        self.buffer.drain(..consumed);
        Some(frame)
    }

    /// Number of bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take every buffered byte, leaving the decoder empty.
    ///
    /// Used when a transfer ends and the rest of the buffer belongs to the
    /// next Description line.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Transfer metadata, sent once per transfer ahead of its frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Transfer identifier
    pub id: Uuid,
    /// Payload category
    pub kind: PayloadKind,
    /// Declared total length in bytes
    pub size: u64,
    /// Ordering hint among concurrent transfers
    #[serde(default)]
    pub index: u32,
    /// Display or file name
    pub name: String,
    /// Hex-encoded SHA-256 of the content (empty when not computed)
    #[serde(default)]
    pub checksum: String,
}

impl Description {
    /// Create a Description with a fresh transfer id and no checksum.
    #[must_use]
    pub fn new(kind: PayloadKind, size: u64, index: u32, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            size,
            index,
            name: name.into(),
            checksum: String::new(),
        }
    }

    /// Set the content checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// Serialize to a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a Description line. A trailing `\n` or `\r\n` is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the line is not a valid Description.
    pub fn from_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        serde_json::from_str(line).map_err(|e| Error::Format(format!("bad description line: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_encode_decode() {
        let header = FrameHeader {
            kind: KIND_BYTES,
            payload_length: 458,
            is_last: true,
        };

        let encoded = header.encode().expect("encode");
        assert_eq!(encoded[0], 1);
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), (458 << 1) | 1);

        assert_eq!(FrameHeader::decode(&encoded), header);
    }

    #[test]
    fn test_header_roundtrip_full_length_range() {
        for length in 0..=MAX_PAYLOAD_LEN {
            for is_last in [false, true] {
                let header = FrameHeader {
                    kind: 7,
                    payload_length: length,
                    is_last,
                };
                let decoded = FrameHeader::decode(&header.encode().unwrap());
                assert_eq!(decoded, header);
            }
        }
    }

    #[test]
    fn test_pack_unpack() {
        let frame = Frame::new(KIND_FILE, b"hello tether".to_vec(), false);
        let packed = pack(&frame).expect("pack");
        assert_eq!(packed.len(), HEADER_SIZE + 12);
        assert_eq!(unpack(&packed).expect("unpack"), frame);
    }

    #[test]
    fn test_pack_empty_terminal_frame() {
        let frame = Frame::new(KIND_BYTES, Vec::new(), true);
        let packed = pack(&frame).expect("pack");
        assert_eq!(packed, vec![1, 0, 1]);
        assert_eq!(unpack(&packed).expect("unpack"), frame);
    }

    #[test]
    fn test_unsigned_kind_bytes() {
        let frame = Frame::new(0xFF, vec![0xFE; 3], true);
        let decoded = unpack(&pack(&frame).unwrap()).unwrap();
        assert_eq!(decoded.kind, 0xFF);
        assert_eq!(decoded.payload, vec![0xFE; 3]);
    }

    #[test]
    fn test_pack_rejects_oversized_payload() {
        let frame = Frame::new(KIND_BYTES, vec![0; MAX_PAYLOAD_LEN + 1], false);
        assert!(matches!(pack(&frame), Err(Error::PayloadTooLarge(32768))));
    }

    #[test]
    fn test_unpack_too_short() {
        assert!(matches!(unpack(&[]), Err(Error::Format(_))));
        assert!(matches!(unpack(&[1, 0]), Err(Error::Format(_))));
    }

    #[test]
    fn test_unpack_declared_length_past_end() {
        let mut packed = pack(&Frame::new(KIND_BYTES, vec![9; 10], true)).unwrap();
        packed.truncate(HEADER_SIZE + 4);
        assert!(matches!(unpack(&packed), Err(Error::Format(_))));
    }

    #[test]
    fn test_unpack_ignores_trailing_bytes() {
        let mut packed = pack(&Frame::new(KIND_BYTES, vec![1, 2, 3], false)).unwrap();
        packed.resize(1024, 0);
        let frame = unpack(&packed).unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert!(!frame.is_last);
    }

    #[test]
    fn test_decoder_across_read_boundaries() {
        let frames = vec![
            Frame::new(KIND_FILE, vec![1; 5], false),
            Frame::new(KIND_FILE, vec![2; 300], false),
            Frame::new(KIND_FILE, vec![3; 2], true),
        ];
        let wire: Vec<u8> = frames.iter().flat_map(|f| pack(f).unwrap()).collect();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(7) {
            decoder.push(piece);
            while let Some(frame) = decoder.next_frame() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_keeps_partial_frame() {
        let packed = pack(&Frame::new(KIND_BYTES, vec![4; 20], true)).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&packed[..10]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 10);
        decoder.push(&packed[10..]);
        assert_eq!(decoder.next_frame().unwrap().payload, vec![4; 20]);
    }

    #[test]
    fn test_description_line_roundtrip() {
        let description = Description::new(PayloadKind::File, 2500, 3, "photo.jpg")
            .with_checksum("abcdef");

        let line = description.to_line().expect("encode");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let decoded = Description::from_line(&line).expect("decode");
        assert_eq!(decoded, description);
    }

    #[test]
    fn test_description_kind_is_numeric() {
        let description = Description::new(PayloadKind::Bytes, 4, 0, "note");
        let line = description.to_line().unwrap();
        assert!(line.contains("\"kind\":1"));

        let file_line = line.replace("\"kind\":1", "\"kind\":0");
        assert_eq!(
            Description::from_line(&file_line).unwrap().kind,
            PayloadKind::File
        );
    }

    #[test]
    fn test_description_field_order_irrelevant() {
        let id = Uuid::new_v4();
        let line = format!(
            r#"{{"name":"a.bin","checksum":"","size":10,"kind":0,"id":"{id}","index":2}}"#
        );
        let decoded = Description::from_line(&line).unwrap();
        assert_eq!(decoded.id, id);
        assert_eq!(decoded.size, 10);
        assert_eq!(decoded.index, 2);
    }

    #[test]
    fn test_description_malformed_line() {
        assert!(matches!(
            Description::from_line("not json\n"),
            Err(Error::Format(_))
        ));
    }
}
