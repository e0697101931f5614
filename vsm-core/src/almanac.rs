//! Almanac image as served by the solver, with an optional verified
//! compressed form.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;

use crate::codec::{self, CodecError};
use crate::types::{hex_encode, Result, VsmError};

/// A full almanac image ready for chunked delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Almanac {
    pub image: Vec<u8>,
    /// Present only if it round-trips and is strictly smaller than `image`.
    pub compressed: Option<Vec<u8>>,
}

impl Almanac {
    pub fn uncompressed(image: Vec<u8>) -> Self {
        Almanac {
            image,
            compressed: None,
        }
    }

    /// Build from a raw image, attaching the compressed form when it verifies.
    ///
    /// A failed verification is not an error for the almanac itself; the
    /// reason is handed back so the caller can log it.
    pub fn with_compression(image: Vec<u8>) -> (Self, Option<CodecError>) {
        match codec::compress_verified(&image) {
            Ok(compressed) => (
                Almanac {
                    image,
                    compressed: Some(compressed),
                },
                None,
            ),
            Err(e) => (Almanac::uncompressed(image), Some(e)),
        }
    }

    /// Decode the base64 image delivered by the almanac endpoint.
    pub fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| VsmError::Upstream(format!("almanac image is not base64: {e}")))
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    /// Bytes that go on the air: compressed form if available.
    pub fn payload(&self) -> &[u8] {
        self.compressed.as_deref().unwrap_or(&self.image)
    }

    pub fn image_hex(&self) -> String {
        hex_encode(&self.image)
    }

    pub fn compressed_hex(&self) -> Option<String> {
        self.compressed.as_deref().map(hex_encode)
    }
}

/// JSON shape of a cached almanac.
#[derive(Debug, Serialize)]
pub struct AlmanacView {
    pub almanac_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub almanac_compressed: Option<String>,
}

impl From<&Almanac> for AlmanacView {
    fn from(a: &Almanac) -> Self {
        AlmanacView {
            almanac_image: a.image_hex(),
            almanac_compressed: a.compressed_hex(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_image_gets_compressed() {
        let mut image = vec![0u8; 512];
        image[3] = 0x42;
        let (almanac, err) = Almanac::with_compression(image.clone());
        assert!(err.is_none());
        assert!(almanac.is_compressed());
        assert!(almanac.payload().len() < image.len());
        assert_eq!(almanac.image, image);
    }

    #[test]
    fn test_dense_image_stays_uncompressed() {
        let image = vec![0x5A; 200];
        let (almanac, err) = Almanac::with_compression(image.clone());
        assert!(matches!(err, Some(CodecError::NotSmaller { .. })));
        assert!(!almanac.is_compressed());
        assert_eq!(almanac.payload(), image.as_slice());
    }

    #[test]
    fn test_decode_base64() {
        assert_eq!(Almanac::decode_base64("AAEC").unwrap(), vec![0, 1, 2]);
        assert!(Almanac::decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_view_hex() {
        let almanac = Almanac::uncompressed(vec![0xDE, 0xAD]);
        let view = AlmanacView::from(&almanac);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["almanac_image"], "dead");
        assert!(json.get("almanac_compressed").is_none());
    }
}
