//! WebSocket frame codec
//!
//! Decodes masked client frames and encodes unmasked server text frames
//! (RFC 6455 subset). Only one frame is decoded per call; bytes past the
//! declared frame length are ignored and fragmented messages are rejected.

use thiserror::Error;

/// FIN bit in the first header byte
const FIN_BIT: u8 = 0x80;

/// MASK bit in the second header byte
const MASK_BIT: u8 = 0x80;

/// Low 7 bits of the second header byte
const LENGTH_MASK: u8 = 0x7F;

/// Length indicator announcing a 16-bit extended length
const LENGTH_16: u8 = 126;

/// Length indicator announcing a 64-bit extended length
const LENGTH_64: u8 = 127;

/// Largest payload that fits in the single length byte
const MAX_SHORT_LENGTH: usize = 125;

/// Minimal frame header: flags/opcode byte plus length byte
pub const MIN_HEADER_LEN: usize = 2;

/// Size of the client masking key
pub const MASK_LEN: usize = 4;

/// Errors produced while decoding a frame
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("declared payload length {0} does not fit in memory")]
    LengthOverflow(u64),

    #[error("client frame is not masked")]
    Unmasked,

    #[error("fragmented frames are not supported")]
    Fragmented,

    #[error("unsupported opcode {0:?}")]
    UnsupportedOpcode(OpCode),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcodes (RFC 6455 section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    /// Wire value of this opcode
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(b) => b & 0x0F,
        }
    }
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, present on client-originated frames
    pub mask: Option<[u8; MASK_LEN]>,
    /// Unmasked payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Interpret the payload as UTF-8 text
    pub fn into_text(self) -> FrameResult<String> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }
}

/// Bounds-checked view over the input buffer
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> FrameResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(FrameError::Truncated {
            needed: usize::MAX,
            available: self.buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(FrameError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> FrameResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Decode one frame from the start of `buf`
///
/// Accepts both masked and unmasked frames; the extended length field is
/// consumed before the mask so the mask offset is correct for every length
/// form.
pub fn decode_frame(buf: &[u8]) -> FrameResult<Frame> {
    let mut cursor = Cursor::new(buf);
    let [first, second] = cursor.take_array::<MIN_HEADER_LEN>()?;

    let fin = first & FIN_BIT != 0;
    let opcode = OpCode::from_u8(first);
    let masked = second & MASK_BIT != 0;

    let declared = match second & LENGTH_MASK {
        LENGTH_16 => u64::from(u16::from_be_bytes(cursor.take_array::<2>()?)),
        LENGTH_64 => u64::from_be_bytes(cursor.take_array::<8>()?),
        short => u64::from(short),
    };
    let len = usize::try_from(declared).map_err(|_| FrameError::LengthOverflow(declared))?;

    let mask = if masked {
        Some(cursor.take_array::<MASK_LEN>()?)
    } else {
        None
    };

    let raw = cursor.take(len)?;
    let payload = match mask {
        Some(key) => raw
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % MASK_LEN])
            .collect(),
        None => raw.to_vec(),
    };

    Ok(Frame {
        fin,
        opcode,
        mask,
        payload,
    })
}

/// Decode a client text frame from a single read
///
/// The frame must be masked, final and carry the text opcode.
pub fn parse_frame(buf: &[u8]) -> FrameResult<String> {
    let frame = decode_frame(buf)?;

    if frame.mask.is_none() {
        return Err(FrameError::Unmasked);
    }
    if !frame.fin || frame.opcode == OpCode::Continuation {
        return Err(FrameError::Fragmented);
    }
    if frame.opcode != OpCode::Text {
        return Err(FrameError::UnsupportedOpcode(frame.opcode));
    }

    frame.into_text()
}

/// Encode `text` as a final, unmasked server text frame
pub fn create_frame(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut frame = encode_header(OpCode::Text, payload.len(), false);
    frame.extend_from_slice(payload);
    frame
}

fn encode_header(opcode: OpCode, len: usize, masked: bool) -> Vec<u8> {
    let mut header = Vec::with_capacity(14 + len);
    header.push(FIN_BIT | opcode.as_u8());

    let mask_bit = if masked { MASK_BIT } else { 0 };
    if len <= MAX_SHORT_LENGTH {
        header.push(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        header.push(mask_bit | LENGTH_16);
        header.extend_from_slice(&short.to_be_bytes());
    } else {
        header.push(mask_bit | LENGTH_64);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    header
}

/// Build a masked client text frame, as a browser would send it
#[cfg(test)]
pub fn create_masked_frame(text: &str, mask: [u8; MASK_LEN]) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut frame = encode_header(OpCode::Text, payload.len(), true);
    frame.extend_from_slice(&mask);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % MASK_LEN]),
    );
    frame
}

/// Read exactly one frame from a stream
#[cfg(test)]
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; MIN_HEADER_LEN];
    reader.read_exact(&mut buf).await?;

    let extended = match buf[1] & LENGTH_MASK {
        LENGTH_16 => 2,
        LENGTH_64 => 8,
        _ => 0,
    };
    let mask_len = if buf[1] & MASK_BIT != 0 { MASK_LEN } else { 0 };
    buf.resize(MIN_HEADER_LEN + extended + mask_len, 0);
    reader.read_exact(&mut buf[MIN_HEADER_LEN..]).await?;

    let len = match buf[1] & LENGTH_MASK {
        LENGTH_16 => usize::from(u16::from_be_bytes([buf[2], buf[3]])),
        LENGTH_64 => {
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            u64::from_be_bytes(be) as usize
        }
        short => usize::from(short),
    };
    let start = buf.len();
    buf.resize(start + len, 0);
    reader.read_exact(&mut buf[start..]).await?;

    decode_frame(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
