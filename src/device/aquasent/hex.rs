//! Uppercase hex codec for modem payloads

use bytes::BytesMut;
use thiserror::Error;

const HEX_TABLE: &[u8; 16] = b"0123456789ABCDEF";

/// Errors raised while decoding hex text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    /// Input length is odd
    #[error("odd hex length: {0}")]
    OddLength(usize),

    /// Character outside `0-9A-F`
    #[error("invalid hex character 0x{byte:02x} at {index}")]
    InvalidChar {
        /// Offending byte
        byte: u8,
        /// Position in the input
        index: usize,
    },
}

/// Append the hex form of `src` to `dst`
pub fn encode_into(dst: &mut BytesMut, src: &[u8]) {
    dst.reserve(src.len() * 2);
    for byte in src {
        dst.extend_from_slice(&[
            HEX_TABLE[(byte >> 4) as usize],
            HEX_TABLE[(byte & 0x0f) as usize],
        ]);
    }
}

/// Hex-encode `src`
pub fn encode(src: &[u8]) -> String {
    let mut dst = BytesMut::with_capacity(src.len() * 2);
    encode_into(&mut dst, src);
    // Table output is ASCII.
    dst.iter().map(|&b| b as char).collect()
}

fn nibble(byte: u8, index: usize) -> Result<u8, HexError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(HexError::InvalidChar { byte, index }),
    }
}

/// Decode uppercase hex text
pub fn decode(src: &[u8]) -> Result<Vec<u8>, HexError> {
    if src.len() % 2 != 0 {
        return Err(HexError::OddLength(src.len()));
    }
    src.chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| Ok(nibble(pair[0], i * 2)? << 4 | nibble(pair[1], i * 2 + 1)?))
        .collect()
}
