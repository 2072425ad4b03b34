//! # Binary Wire Frame Codec
//!
//! The streaming speech vendors speak a compact binary framing over their
//! WebSocket connections. Clients of this service may speak it too when they
//! stream raw audio for live recognition.
//!
//! ## Layout:
//! ```text
//! byte 0: version (high 4 bits) | header size in 4-byte words (low 4 bits)
//! byte 1: message type (high 4) | flags (low 4)
//! byte 2: serialization (high 4) | compression (low 4)
//! byte 3: reserved
//! [4 bytes big-endian signed sequence number, only if flags has SEQUENCE]
//! 4 bytes big-endian payload length (length of the payload *after* compression)
//! payload
//! ```
//!
//! ## Key Rust Concepts:
//! - **Layout as data**: header fields are described by a [`BitField`] table,
//!   and encode/decode are driven by the table instead of ad-hoc shifts
//! - **TryFrom**: unknown nibble values become typed [`CodecError`]s
//! - **byteorder**: explicit big-endian integer reads and writes

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte words written by the encoder.
pub const HEADER_WORDS: u8 = 0b0001;

pub const HEADER_LEN: usize = 4;
const SEQUENCE_LEN: usize = 4;
const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound on a single payload, compressed or not.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Flag bit: a sequence number follows the header.
pub const FLAG_SEQUENCE: u8 = 0b0001;
/// Flag bit: last frame of the stream.
pub const FLAG_FINAL: u8 = 0b0010;

/// A bit range inside the fixed 4-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub byte: usize,
    pub shift: u8,
    pub width: u8,
}

impl BitField {
    const fn mask(self) -> u8 {
        ((1u16 << self.width) - 1) as u8
    }

    pub fn read(self, header: &[u8; HEADER_LEN]) -> u8 {
        (header[self.byte] >> self.shift) & self.mask()
    }

    pub fn write(self, header: &mut [u8; HEADER_LEN], value: u8) {
        let mask = self.mask() << self.shift;
        header[self.byte] = (header[self.byte] & !mask) | ((value << self.shift) & mask);
    }
}

pub const VERSION: BitField = BitField { byte: 0, shift: 4, width: 4 };
pub const HEADER_SIZE: BitField = BitField { byte: 0, shift: 0, width: 4 };
pub const MESSAGE_TYPE: BitField = BitField { byte: 1, shift: 4, width: 4 };
pub const FLAGS: BitField = BitField { byte: 1, shift: 0, width: 4 };
pub const SERIALIZATION: BitField = BitField { byte: 2, shift: 4, width: 4 };
pub const COMPRESSION: BitField = BitField { byte: 2, shift: 0, width: 4 };
pub const RESERVED: BitField = BitField { byte: 3, shift: 0, width: 8 };

/// Every header field, in wire order.
pub const HEADER_LAYOUT: [(&str, BitField); 7] = [
    ("version", VERSION),
    ("header_size", HEADER_SIZE),
    ("message_type", MESSAGE_TYPE),
    ("flags", FLAGS),
    ("serialization", SERIALIZATION),
    ("compression", COMPRESSION),
    ("reserved", RESERVED),
];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid header size {0}")]
    InvalidHeaderSize(u8),

    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u8),

    #[error("unknown serialization method {0}")]
    UnknownSerialization(u8),

    #[error("unknown compression method {0}")]
    UnknownCompression(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("payload compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("payload decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("payload is not structured text")]
    NotStructured,

    #[error("structured payload invalid: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    ServerAck = 0b1011,
    ServerError = 0b1111,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::FullClientRequest,
        MessageType::AudioOnlyRequest,
        MessageType::FullServerResponse,
        MessageType::ServerAck,
        MessageType::ServerError,
    ];

    pub fn is_client_request(self) -> bool {
        matches!(self, MessageType::FullClientRequest | MessageType::AudioOnlyRequest)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageType::ALL
            .into_iter()
            .find(|kind| *kind as u8 == value)
            .ok_or(CodecError::UnknownMessageType(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Serialization {
    None = 0b0000,
    Json = 0b0001,
}

impl TryFrom<u8> for Serialization {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Serialization::None),
            1 => Ok(Serialization::Json),
            other => Err(CodecError::UnknownSerialization(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    None = 0b0000,
    Gzip = 0b0001,
}

impl TryFrom<u8> for Compression {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(CodecError::UnknownCompression(other)),
        }
    }
}

/// One decoded frame. `payload` is always the *uncompressed* bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn new(
        message_type: MessageType,
        serialization: Serialization,
        compression: Compression,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            flags: 0,
            serialization,
            compression,
            sequence: None,
            payload,
        }
    }

    /// A structured-text frame carrying `value` as JSON.
    pub fn json<T: Serialize>(
        message_type: MessageType,
        value: &T,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(message_type, Serialization::Json, compression, payload))
    }

    /// A raw audio frame.
    pub fn audio(payload: Vec<u8>, compression: Compression) -> Self {
        Self::new(MessageType::AudioOnlyRequest, Serialization::None, compression, payload)
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = Some(sequence);
        self.flags |= FLAG_SEQUENCE;
        self
    }

    pub fn mark_final(mut self) -> Self {
        self.flags |= FLAG_FINAL;
        self
    }

    /// Last frame of the stream: either flagged, or carrying a negative sequence.
    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0 || self.sequence.is_some_and(|seq| seq < 0)
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if self.serialization != Serialization::Json {
            return Err(CodecError::NotStructured);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(
            self.message_type,
            self.flags,
            self.serialization,
            self.compression,
            self.sequence,
            &self.payload,
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

/// Encode a frame. The SEQUENCE flag is derived from `sequence`, whatever
/// `flags` says about it.
pub fn encode(
    message_type: MessageType,
    flags: u8,
    serialization: Serialization,
    compression: Compression,
    sequence: Option<i32>,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let flags = match sequence {
        Some(_) => flags | FLAG_SEQUENCE,
        None => flags & !FLAG_SEQUENCE,
    };

    let body = match compression {
        Compression::None => payload.to_vec(),
        Compression::Gzip => gzip(payload)?,
    };
    if body.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(body.len()));
    }

    let mut header = [0u8; HEADER_LEN];
    VERSION.write(&mut header, PROTOCOL_VERSION);
    HEADER_SIZE.write(&mut header, HEADER_WORDS);
    MESSAGE_TYPE.write(&mut header, message_type as u8);
    FLAGS.write(&mut header, flags);
    SERIALIZATION.write(&mut header, serialization as u8);
    COMPRESSION.write(&mut header, compression as u8);
    RESERVED.write(&mut header, 0);

    let mut out = Vec::with_capacity(HEADER_LEN + SEQUENCE_LEN + LENGTH_PREFIX_LEN + body.len());
    out.extend_from_slice(&header);
    if let Some(seq) = sequence {
        out.write_i32::<BigEndian>(seq).map_err(CodecError::Compress)?;
    }
    out.write_u32::<BigEndian>(body.len() as u32)
        .map_err(CodecError::Compress)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one frame from `bytes`. Trailing bytes after the payload are ignored.
pub fn decode(bytes: &[u8]) -> Result<WireFrame, CodecError> {
    let available = bytes.len();
    let need = |needed: usize| -> Result<(), CodecError> {
        if available < needed {
            Err(CodecError::Truncated { needed, available })
        } else {
            Ok(())
        }
    };

    need(HEADER_LEN)?;
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);

    let version = VERSION.read(&header);
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let header_words = HEADER_SIZE.read(&header);
    if header_words == 0 {
        return Err(CodecError::InvalidHeaderSize(header_words));
    }
    let mut offset = header_words as usize * 4;
    need(offset)?;

    let message_type = MessageType::try_from(MESSAGE_TYPE.read(&header))?;
    let flags = FLAGS.read(&header);
    let serialization = Serialization::try_from(SERIALIZATION.read(&header))?;
    let compression = Compression::try_from(COMPRESSION.read(&header))?;

    let sequence = if flags & FLAG_SEQUENCE != 0 {
        need(offset + SEQUENCE_LEN)?;
        let seq = BigEndian::read_i32(&bytes[offset..offset + SEQUENCE_LEN]);
        offset += SEQUENCE_LEN;
        Some(seq)
    } else {
        None
    };

    need(offset + LENGTH_PREFIX_LEN)?;
    let payload_len = BigEndian::read_u32(&bytes[offset..offset + LENGTH_PREFIX_LEN]) as usize;
    offset += LENGTH_PREFIX_LEN;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }
    need(offset + payload_len)?;

    let raw = &bytes[offset..offset + payload_len];
    let payload = match compression {
        Compression::None => raw.to_vec(),
        Compression::Gzip => gunzip(raw)?,
    };

    Ok(WireFrame {
        message_type,
        flags,
        serialization,
        compression,
        sequence,
        payload,
    })
}

/// Cheap sniff: does `bytes` start with a client-request header this codec
/// understands? Used to tell wire frames apart from raw audio uploads.
pub fn looks_like_client_frame(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_LEN + LENGTH_PREFIX_LEN {
        return false;
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);

    VERSION.read(&header) == PROTOCOL_VERSION
        && HEADER_SIZE.read(&header) == HEADER_WORDS
        && MessageType::try_from(MESSAGE_TYPE.read(&header))
            .map(MessageType::is_client_request)
            .unwrap_or(false)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).map_err(CodecError::Compress)?;
    encoder.finish().map_err(CodecError::Compress)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_PAYLOAD_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    if out.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_layout_matches_vendor_config_frame() {
        let frame = WireFrame::json(
            MessageType::FullClientRequest,
            &json!({"request": {"model_name": "asr"}}),
            Compression::Gzip,
        )
        .unwrap()
        .with_sequence(1);

        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..4], &[0x11, 0x11, 0x11, 0x00]);
        assert_eq!(&bytes[4..8], &1i32.to_be_bytes());

        // Length prefix counts the compressed bytes.
        let declared = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        assert_eq!(declared, bytes.len() - 12);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let cases = vec![
            WireFrame::audio(vec![1, 2, 3, 4], Compression::None).with_sequence(2),
            WireFrame::audio(vec![0; 3200], Compression::Gzip)
                .with_sequence(-9)
                .mark_final(),
            WireFrame::new(
                MessageType::FullServerResponse,
                Serialization::Json,
                Compression::Gzip,
                br#"{"result":{"text":"hello"}}"#.to_vec(),
            ),
            WireFrame::new(
                MessageType::ServerError,
                Serialization::None,
                Compression::None,
                Vec::new(),
            ),
        ];

        for frame in cases {
            let decoded = decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_sequence_flag_follows_sequence() {
        let bytes = encode(
            MessageType::AudioOnlyRequest,
            FLAG_SEQUENCE,
            Serialization::None,
            Compression::None,
            None,
            b"pcm",
        )
        .unwrap();
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.flags & FLAG_SEQUENCE, 0);
        assert_eq!(frame.sequence, None);
        assert_eq!(frame.payload, b"pcm");
    }

    #[test]
    fn test_every_truncated_prefix_fails() {
        let bytes = WireFrame::audio(b"some audio bytes".to_vec(), Compression::None)
            .with_sequence(5)
            .encode()
            .unwrap();

        for len in 0..bytes.len() {
            match decode(&bytes[..len]) {
                Err(CodecError::Truncated { available, .. }) => assert_eq!(available, len),
                other => panic!("prefix of {} bytes decoded as {:?}", len, other),
            }
        }
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn test_declared_length_longer_than_buffer() {
        let mut bytes = vec![0x11, 0x20, 0x00, 0x00];
        bytes.extend_from_slice(&500u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 200]);

        match decode(&bytes) {
            Err(CodecError::Truncated { needed, available }) => {
                assert_eq!(needed, 508);
                assert_eq!(available, 208);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_header_values() {
        let good = WireFrame::audio(vec![1], Compression::None).encode().unwrap();

        let mut bad_version = good.clone();
        bad_version[0] = 0x21;
        assert!(matches!(decode(&bad_version), Err(CodecError::UnsupportedVersion(2))));

        let mut bad_type = good.clone();
        bad_type[1] = 0x30;
        assert!(matches!(decode(&bad_type), Err(CodecError::UnknownMessageType(3))));

        let mut bad_compression = good;
        bad_compression[2] = 0x07;
        assert!(matches!(decode(&bad_compression), Err(CodecError::UnknownCompression(7))));
    }

    #[test]
    fn test_corrupt_gzip_payload() {
        let mut bytes = vec![0x11, 0x20, 0x01, 0x00];
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(b"nope");
        assert!(matches!(decode(&bytes), Err(CodecError::Decompress(_))));
    }

    #[test]
    fn test_negative_sequence_is_final() {
        let frame = decode(
            &WireFrame::audio(Vec::new(), Compression::None)
                .with_sequence(-3)
                .encode()
                .unwrap(),
        )
        .unwrap();
        assert!(frame.is_final());
    }

    #[test]
    fn test_sniffs_client_frames_only() {
        let audio = WireFrame::audio(vec![9; 10], Compression::None).encode().unwrap();
        assert!(looks_like_client_frame(&audio));

        let server = WireFrame::new(
            MessageType::FullServerResponse,
            Serialization::Json,
            Compression::None,
            b"{}".to_vec(),
        )
        .encode()
        .unwrap();
        assert!(!looks_like_client_frame(&server));

        // A WAV header is not a frame.
        assert!(!looks_like_client_frame(b"RIFF\x24\x08\x00\x00WAVE"));
    }

    #[test]
    fn test_header_layout_covers_every_bit_once() {
        let mut covered = [0u8; HEADER_LEN];
        for (name, field) in HEADER_LAYOUT {
            let mask = field.mask() << field.shift;
            assert_eq!(covered[field.byte] & mask, 0, "{} overlaps another field", name);
            covered[field.byte] |= mask;
        }
        assert_eq!(covered, [0xFF; HEADER_LEN]);
    }

    #[test]
    fn test_header_fields_are_independent() {
        for (name, field) in HEADER_LAYOUT {
            let max = field.mask();
            let mut header = [0u8; HEADER_LEN];
            field.write(&mut header, max);

            for (other_name, other) in HEADER_LAYOUT {
                let expected = if other == field { max } else { 0 };
                assert_eq!(other.read(&header), expected, "writing {} changed {}", name, other_name);
            }
        }
    }

    #[test]
    fn test_bitfield_write_is_masked() {
        let mut header = [0u8; HEADER_LEN];
        FLAGS.write(&mut header, 0xFF);
        MESSAGE_TYPE.write(&mut header, 0x2);
        assert_eq!(header[1], 0x2F);
        assert_eq!(FLAGS.read(&header), 0x0F);
        assert_eq!(MESSAGE_TYPE.read(&header), 0x2);
    }
}
