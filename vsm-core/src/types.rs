//! Shared error enum, hex helpers and port constants for vsm-core.

use thiserror::Error;

use crate::codec::CodecError;

/// All errors produced by vsm-core and surfaced by vsm-server.
#[derive(Debug, Error)]
pub enum VsmError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("codec integrity: {0}")]
    CodecIntegrity(#[from] CodecError),
    #[error("protocol abort: {0}")]
    ProtocolAbort(String),
    #[error("downlink send failed: {0}")]
    Downlink(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VsmError>;

// ---------------------------------------------------------------------------
// LoRaWAN ports
// ---------------------------------------------------------------------------

/// FPort used for the rules CRC status request.
pub const PORT_STATUS: u8 = 15;

/// FPort used for GNSS commands (assistance, clock delta, almanac).
pub const PORT_GNSS: u8 = 21;

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive, must be even length.
pub fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let high = hex_digit(chunk[0])?;
        let low = hex_digit(chunk[1])?;
        bytes.push((high << 4) | low);
    }
    Some(bytes)
}

/// Encode bytes as lowercase hex, the form devices and the store use.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Round half toward positive infinity, matching how device firmware
/// tooling rounds fixed-point coordinates and clock deltas.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
