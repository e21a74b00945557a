use std::collections::BTreeMap;
use std::fmt;

pub const MAGIC: u32 = 0x5450_4D50; // "TPMP"
pub const PROTOCOL_VERSION: u16 = 1;
pub const HEADER_SIZE_BYTES: usize = 24;
pub const LENGTH_PREFIX_SIZE_BYTES: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = 1024 * 1024;

/// Payload storage: every value travels as a string (decimal text for
/// numbers, "true"/"false" for booleans, comma-separated bytes for blobs).
pub type PayloadMap = BTreeMap<String, String>;

#[derive(Debug)]
pub enum CodecError {
    FrameTooShort {
        size: usize,
    },
    ZeroLengthFrame,
    FrameTooLarge {
        length: usize,
        limit: usize,
    },
    PayloadLengthMismatch {
        declared: usize,
        available: usize,
    },
    PayloadTruncated {
        offset: usize,
    },
    PayloadKeyNotUtf8 {
        offset: usize,
    },
    PayloadValueNotUtf8 {
        offset: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooShort { size } => {
                write!(f, "frame of {size} bytes is smaller than the {HEADER_SIZE_BYTES}-byte header")
            }
            Self::ZeroLengthFrame => write!(f, "stream frame length cannot be zero"),
            Self::FrameTooLarge { length, limit } => {
                write!(f, "frame length {length} exceeds maximum {limit}")
            }
            Self::PayloadLengthMismatch {
                declared,
                available,
            } => write!(
                f,
                "header declares {declared} payload bytes but frame carries {available}"
            ),
            Self::PayloadTruncated { offset } => {
                write!(f, "payload ends mid-pair at byte {offset}")
            }
            Self::PayloadKeyNotUtf8 { offset } => {
                write!(f, "payload key at byte {offset} is not valid UTF-8")
            }
            Self::PayloadValueNotUtf8 { offset } => {
                write!(f, "payload value at byte {offset} is not valid UTF-8")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Fixed wire header, packed big-endian, 24 bytes.
///
/// `session_ref` is the reserved numeric session field; the session token a
/// client echoes back travels in the payload, never here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u16,
    pub type_code: u16,
    pub payload_length: u32,
    pub sequence_id: u32,
    pub session_ref: u32,
    pub checksum: u32,
}

impl Header {
    pub fn new(type_code: u16) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            type_code,
            payload_length: 0,
            sequence_id: 0,
            session_ref: 0,
            checksum: 0,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.type_code.to_be_bytes());
        out.extend_from_slice(&self.payload_length.to_be_bytes());
        out.extend_from_slice(&self.sequence_id.to_be_bytes());
        out.extend_from_slice(&self.session_ref.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: bytes.len() });
        }

        Ok(Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u16::from_be_bytes([bytes[4], bytes[5]]),
            type_code: u16::from_be_bytes([bytes[6], bytes[7]]),
            payload_length: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            sequence_id: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            session_ref: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            checksum: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        })
    }
}

/// CRC-32 of the full header+payload with the checksum field zeroed.
/// Reflected polynomial 0xEDB88320, init and final XOR 0xFFFFFFFF, which is
/// crc32fast's default variant.
pub fn frame_checksum(frame_with_zeroed_checksum: &[u8]) -> u32 {
    crc32fast::hash(frame_with_zeroed_checksum)
}

pub fn encode_payload(data: &PayloadMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 16);
    for (key, value) in data {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

pub fn decode_payload(bytes: &[u8]) -> Result<PayloadMap, CodecError> {
    let mut data = PayloadMap::new();
    let mut pos = 0_usize;

    while pos < bytes.len() {
        let key_start = pos;
        let key = read_chunk(bytes, &mut pos)
            .ok_or(CodecError::PayloadTruncated { offset: key_start })?;
        let key = std::str::from_utf8(key)
            .map_err(|_| CodecError::PayloadKeyNotUtf8 { offset: key_start })?;

        let value_start = pos;
        let value = read_chunk(bytes, &mut pos)
            .ok_or(CodecError::PayloadTruncated { offset: value_start })?;
        let value = std::str::from_utf8(value)
            .map_err(|_| CodecError::PayloadValueNotUtf8 { offset: value_start })?;

        data.insert(key.to_owned(), value.to_owned());
    }

    Ok(data)
}

fn read_chunk<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if *pos + 4 > bytes.len() {
        return None;
    }
    let len = u32::from_be_bytes([bytes[*pos], bytes[*pos + 1], bytes[*pos + 2], bytes[*pos + 3]])
        as usize;
    *pos += 4;
    if *pos + len > bytes.len() {
        return None;
    }
    let chunk = &bytes[*pos..*pos + len];
    *pos += len;
    Some(chunk)
}

/// Accumulates raw bytes from a stream transport and yields complete
/// length-prefixed frames. The length prefix, header, and payload may each
/// arrive split across any number of reads.
pub struct FrameReader {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame (header+payload, prefix stripped), or
    /// `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE_BYTES {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if declared == 0 {
            return Err(CodecError::ZeroLengthFrame);
        }
        if declared > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                length: declared,
                limit: self.max_frame_size,
            });
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE_BYTES + declared {
            return Ok(None);
        }

        let frame = self.buffer[LENGTH_PREFIX_SIZE_BYTES..LENGTH_PREFIX_SIZE_BYTES + declared]
            .to_vec();
        self.buffer.drain(..LENGTH_PREFIX_SIZE_BYTES + declared);
        Ok(Some(frame))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_payload, encode_payload, CodecError, FrameReader, Header, PayloadMap,
        HEADER_SIZE_BYTES, MAGIC, PROTOCOL_VERSION,
    };

    fn sample_payload() -> PayloadMap {
        let mut data = PayloadMap::new();
        data.insert("urn".to_owned(), "1234567890123".to_owned());
        data.insert("passengers".to_owned(), "3".to_owned());
        data.insert("success".to_owned(), "true".to_owned());
        data.insert("note".to_owned(), String::new());
        data
    }

    #[test]
    fn header_round_trip_preserves_all_fields() {
        let mut header = Header::new(7);
        header.payload_length = 42;
        header.sequence_id = 99;
        header.session_ref = 12;
        header.checksum = 0xDEAD_BEEF;

        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        assert_eq!(bytes.len(), HEADER_SIZE_BYTES);

        let decoded = Header::decode(&bytes).expect("header should decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.magic, MAGIC);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn header_rejects_short_input() {
        let error = Header::decode(&[0_u8; 10]).expect_err("short header should fail");
        assert!(matches!(error, CodecError::FrameTooShort { size: 10 }));
    }

    #[test]
    fn payload_round_trip_preserves_pairs_and_empty_values() {
        let data = sample_payload();
        let encoded = encode_payload(&data);
        let decoded = decode_payload(&encoded).expect("payload should decode");
        assert_eq!(decoded, data);
    }

    #[test]
    fn payload_ends_exactly_at_declared_length() {
        let encoded = encode_payload(&sample_payload());
        // A payload cut mid-pair must be rejected, never silently truncated.
        let error = decode_payload(&encoded[..encoded.len() - 1])
            .expect_err("truncated payload should fail");
        assert!(matches!(error, CodecError::PayloadTruncated { .. }));
    }

    #[test]
    fn empty_payload_decodes_to_empty_map() {
        let decoded = decode_payload(&[]).expect("empty payload should decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn frame_reader_handles_arbitrary_chunking() {
        let frame_a = vec![1_u8, 2, 3, 4, 5];
        let frame_b = vec![9_u8, 8, 7];

        let mut stream = Vec::new();
        stream.extend_from_slice(&(frame_a.len() as u32).to_be_bytes());
        stream.extend_from_slice(&frame_a);
        stream.extend_from_slice(&(frame_b.len() as u32).to_be_bytes());
        stream.extend_from_slice(&frame_b);

        // Feed one byte at a time; exactly [frame_a, frame_b] must come out.
        let mut reader = FrameReader::default();
        let mut frames = Vec::new();
        for byte in &stream {
            reader.push(std::slice::from_ref(byte));
            while let Some(frame) = reader.next_frame().expect("frames should parse") {
                frames.push(frame);
            }
        }

        assert_eq!(frames, vec![frame_a, frame_b]);
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn frame_reader_rejects_zero_length_frame() {
        let mut reader = FrameReader::default();
        reader.push(&0_u32.to_be_bytes());
        let error = reader.next_frame().expect_err("zero-length frame should fail");
        assert!(matches!(error, CodecError::ZeroLengthFrame));
    }

    #[test]
    fn frame_reader_rejects_frame_above_limit() {
        let mut reader = FrameReader::new(64);
        reader.push(&65_u32.to_be_bytes());
        let error = reader.next_frame().expect_err("oversized frame should fail");
        assert!(matches!(error, CodecError::FrameTooLarge { length: 65, limit: 64 }));
    }

    #[test]
    fn frame_reader_waits_for_full_frame() {
        let mut reader = FrameReader::default();
        reader.push(&8_u32.to_be_bytes());
        reader.push(&[1, 2, 3]);
        assert!(reader
            .next_frame()
            .expect("partial frame should not error")
            .is_none());

        reader.push(&[4, 5, 6, 7, 8]);
        let frame = reader
            .next_frame()
            .expect("complete frame should parse")
            .expect("frame should be ready");
        assert_eq!(frame, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
