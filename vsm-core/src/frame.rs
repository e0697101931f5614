//! Downlink frames sent to VSM devices.
//!
//! Every payload starts with a one-byte tag identifying its meaning:
//!
//! | Tag    | Meaning                         | Port | Payload                  |
//! |--------|---------------------------------|------|--------------------------|
//! | `0x00` | rules CRC / status request      | 15   | tag only                 |
//! | `0x01` | assisted position               | 21   | lat16, lng16 (BE)        |
//! | `0x02` | begin almanac                   | 21   | chunk                    |
//! | `0x03` | almanac segment                 | 21   | chunk                    |
//! | `0x04` | end almanac (uncompressed)      | 21   | chunk                    |
//! | `0x05` | end almanac (compressed)        | 21   | chunk                    |
//! | `0x08` | clock delta                     | 21   | i32 seconds (BE)         |

use serde::Serialize;

use crate::types::{hex_encode, round_half_up, PORT_GNSS, PORT_STATUS};

// ---------------------------------------------------------------------------
// Frame tags
// ---------------------------------------------------------------------------

/// First byte of every downlink payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum FrameTag {
    StatusRequest = 0x00,
    AssistancePosition = 0x01,
    AlmanacBegin = 0x02,
    AlmanacSegment = 0x03,
    AlmanacEndFull = 0x04,
    AlmanacEndCompressed = 0x05,
    ClockDelta = 0x08,
}

impl FrameTag {
    pub fn from_byte(b: u8) -> Option<FrameTag> {
        match b {
            0x00 => Some(FrameTag::StatusRequest),
            0x01 => Some(FrameTag::AssistancePosition),
            0x02 => Some(FrameTag::AlmanacBegin),
            0x03 => Some(FrameTag::AlmanacSegment),
            0x04 => Some(FrameTag::AlmanacEndFull),
            0x05 => Some(FrameTag::AlmanacEndCompressed),
            0x08 => Some(FrameTag::ClockDelta),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs and tables.
    pub fn name(self) -> &'static str {
        match self {
            FrameTag::StatusRequest => "status request",
            FrameTag::AssistancePosition => "assistance position",
            FrameTag::AlmanacBegin => "almanac begin",
            FrameTag::AlmanacSegment => "almanac segment",
            FrameTag::AlmanacEndFull => "almanac end (full)",
            FrameTag::AlmanacEndCompressed => "almanac end (compressed)",
            FrameTag::ClockDelta => "clock delta",
        }
    }

    /// Closing tag for an almanac image.
    pub fn almanac_end(compressed: bool) -> FrameTag {
        if compressed {
            FrameTag::AlmanacEndCompressed
        } else {
            FrameTag::AlmanacEndFull
        }
    }
}

// ---------------------------------------------------------------------------
// Downlink
// ---------------------------------------------------------------------------

/// A single downlink: built, sent once, dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Downlink {
    pub port: u8,
    pub payload: Vec<u8>,
    pub confirmed: bool,
}

impl Downlink {
    /// Ask the device to report its rules CRC (tag only, port 15).
    pub fn status_request() -> Self {
        Downlink {
            port: PORT_STATUS,
            payload: vec![FrameTag::StatusRequest.byte()],
            confirmed: false,
        }
    }

    /// Shift the device clock by `delta_s` seconds.
    pub fn clock_delta(delta_s: i32) -> Self {
        let mut payload = Vec::with_capacity(5);
        payload.push(FrameTag::ClockDelta.byte());
        payload.extend_from_slice(&delta_s.to_be_bytes());
        Downlink {
            port: PORT_GNSS,
            payload,
            confirmed: false,
        }
    }

    /// Coarse reference position for the device's GNSS search.
    ///
    /// Latitude is scaled by 2048/90 and longitude by 2048/180, rounded and
    /// truncated to 16 bits (two's complement for negative values).
    pub fn assistance_position(lat: f64, lng: f64) -> Self {
        let lat16 = round_half_up(2048.0 * lat / 90.0) as i32 as u16;
        let lng16 = round_half_up(2048.0 * lng / 180.0) as i32 as u16;

        let mut payload = Vec::with_capacity(5);
        payload.push(FrameTag::AssistancePosition.byte());
        payload.extend_from_slice(&lat16.to_be_bytes());
        payload.extend_from_slice(&lng16.to_be_bytes());
        Downlink {
            port: PORT_GNSS,
            payload,
            confirmed: false,
        }
    }

    /// One confirmed almanac chunk.
    pub fn almanac_chunk(tag: FrameTag, chunk: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(chunk.len() + 1);
        payload.push(tag.byte());
        payload.extend_from_slice(chunk);
        Downlink {
            port: PORT_GNSS,
            payload,
            confirmed: true,
        }
    }

    /// Arbitrary payload (operator-initiated downlinks).
    pub fn raw(port: u8, payload: Vec<u8>, confirmed: bool) -> Self {
        Downlink {
            port,
            payload,
            confirmed,
        }
    }

    /// Tag of this payload, if it carries a known one.
    pub fn tag(&self) -> Option<FrameTag> {
        self.payload.first().copied().and_then(FrameTag::from_byte)
    }

    pub fn payload_hex(&self) -> String {
        hex_encode(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
