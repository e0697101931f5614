//! Split an almanac image into tagged downlink frames.
//!
//! Frames carry no sequence number. The device relies on the tags:
//! `0x02` opens a new image, `0x03` appends, `0x04`/`0x05` append and close
//! (uncompressed/compressed). Order on the air is advisory only, so the
//! sender paces frames and stops at the first failed send.

use crate::almanac::Almanac;
use crate::frame::{Downlink, FrameTag};
use crate::types::{Result, VsmError};

/// Bytes of each downlink reserved for MAC commands piggy-backing on it.
pub const FRAME_OVERHEAD: usize = 6;

/// Below this many data bytes per frame an almanac transfer is not worth it.
pub const MIN_CHUNK_SIZE: usize = 30;

/// Data bytes per frame for a network max payload size.
pub fn chunk_budget(max_size: usize) -> Result<usize> {
    let budget = max_size.saturating_sub(FRAME_OVERHEAD);
    if budget < MIN_CHUNK_SIZE {
        return Err(VsmError::ProtocolAbort(format!(
            "max payload {max_size} leaves {budget} bytes per frame (need {MIN_CHUNK_SIZE})"
        )));
    }
    Ok(budget)
}

/// Plan the frames that deliver `almanac` within `max_size` byte payloads.
///
/// Uses the compressed image when present. A one-chunk image is sent as a
/// begin frame followed by an empty end frame, so the device always sees
/// both markers.
pub fn plan_almanac(almanac: &Almanac, max_size: usize) -> Result<Vec<Downlink>> {
    let budget = chunk_budget(max_size)?;
    let image = almanac.payload();
    if image.is_empty() {
        return Err(VsmError::ProtocolAbort("empty almanac image".into()));
    }

    let end = FrameTag::almanac_end(almanac.is_compressed());
    let chunks: Vec<&[u8]> = image.chunks(budget).collect();
    let last = chunks.len() - 1;

    let mut frames: Vec<Downlink> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let tag = if i == 0 {
                FrameTag::AlmanacBegin
            } else if i == last {
                end
            } else {
                FrameTag::AlmanacSegment
            };
            Downlink::almanac_chunk(tag, chunk)
        })
        .collect();

    if chunks.len() == 1 {
        frames.push(Downlink::almanac_chunk(end, &[]));
    }

    Ok(frames)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
