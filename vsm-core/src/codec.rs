//! Reverse run-length codec for sparse binary images (almanacs).
//!
//! The encoded buffer is a sequence of segments, each terminated by a
//! control byte, and is decoded from its last byte backwards:
//!
//! - `0xxx xxxx`: zero run of `x` bytes (1..=127). No payload bytes.
//! - `1xxx xxxx`: literal run of `x` bytes (1..=127), preceded by those bytes.
//! - `1000 0000`: zero run of 128 bytes. A zero-length literal run is never
//!   emitted, so the otherwise meaningless value carries the longest zero run.
//!
//! Decoding needs the original length up front; the device allocates the
//! output buffer before the first segment arrives and fills it back to front.

use thiserror::Error;

/// Longest zero run a single control byte can describe.
pub const MAX_ZERO_RUN: usize = 128;

/// Longest literal run a single control byte can describe.
pub const MAX_LITERAL_RUN: usize = 127;

/// Shortest zero run worth a control byte; single zeros travel as literals.
const MIN_ZERO_RUN: usize = 2;

const LITERAL_FLAG: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

/// Integrity failures while decoding or verifying a compressed image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("zero-length run at input offset {at}")]
    ZeroLengthRun { at: usize },
    #[error("run of {len} at input offset {at} overruns output ({remaining} bytes left)")]
    OutputUnderrun {
        at: usize,
        len: usize,
        remaining: usize,
    },
    #[error("literal run of {len} at input offset {at} overruns input ({remaining} bytes left)")]
    InputUnderrun {
        at: usize,
        len: usize,
        remaining: usize,
    },
    #[error("cursors did not end at zero: input {input}, output {output}")]
    Misaligned { input: usize, output: usize },
    #[error("compressed size {compressed} is not smaller than original {original}")]
    NotSmaller { compressed: usize, original: usize },
    #[error("decoded image differs from original")]
    RoundTripMismatch,
}

/// One decoded control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Zeros(usize),
    Literal(usize),
}

impl Segment {
    fn from_control(control: u8, at: usize) -> Result<Self, CodecError> {
        let len = (control & LENGTH_MASK) as usize;
        if control == LITERAL_FLAG {
            return Ok(Segment::Zeros(MAX_ZERO_RUN));
        }
        if len == 0 {
            return Err(CodecError::ZeroLengthRun { at });
        }
        if control & LITERAL_FLAG != 0 {
            Ok(Segment::Literal(len))
        } else {
            Ok(Segment::Zeros(len))
        }
    }
}

/// Encode `input`. Always succeeds; the result may be larger than the input.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / MAX_LITERAL_RUN + 1);
    let mut literals = 0usize;
    let mut pos = 0usize;

    while pos < input.len() {
        let zeros = input[pos..]
            .iter()
            .take(MAX_ZERO_RUN)
            .take_while(|&&b| b == 0)
            .count();

        if zeros >= MIN_ZERO_RUN {
            flush_literals(&mut out, &mut literals);
            // 128 lands on 0x80, see module docs
            out.push(zeros as u8);
            pos += zeros;
        } else {
            out.push(input[pos]);
            literals += 1;
            pos += 1;
            if literals == MAX_LITERAL_RUN {
                flush_literals(&mut out, &mut literals);
            }
        }
    }
    flush_literals(&mut out, &mut literals);

    out
}

fn flush_literals(out: &mut Vec<u8>, literals: &mut usize) {
    if *literals > 0 {
        out.push(LITERAL_FLAG | *literals as u8);
        *literals = 0;
    }
}

/// Decode `encoded` into exactly `original_len` bytes.
///
/// Walks input and output backwards in lock-step. Any control byte that
/// would move either cursor below zero, or leftover input/output after the
/// walk, is an error: no partial result is ever returned.
pub fn decode(encoded: &[u8], original_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![0u8; original_len];
    let mut in_pos = encoded.len();
    let mut out_pos = original_len;

    while in_pos > 0 {
        in_pos -= 1;
        match Segment::from_control(encoded[in_pos], in_pos)? {
            Segment::Zeros(len) => {
                if len > out_pos {
                    return Err(CodecError::OutputUnderrun {
                        at: in_pos,
                        len,
                        remaining: out_pos,
                    });
                }
                // Buffer is already zero-filled
                out_pos -= len;
            }
            Segment::Literal(len) => {
                if len > out_pos {
                    return Err(CodecError::OutputUnderrun {
                        at: in_pos,
                        len,
                        remaining: out_pos,
                    });
                }
                if len > in_pos {
                    return Err(CodecError::InputUnderrun {
                        at: in_pos,
                        len,
                        remaining: in_pos,
                    });
                }
                out[out_pos - len..out_pos].copy_from_slice(&encoded[in_pos - len..in_pos]);
                out_pos -= len;
                in_pos -= len;
            }
        }
    }

    if in_pos != 0 || out_pos != 0 {
        return Err(CodecError::Misaligned {
            input: in_pos,
            output: out_pos,
        });
    }
    Ok(out)
}

/// Encode `input` and prove the result is usable.
///
/// Returns the compressed form only if it is strictly smaller than the
/// input and decodes back to exactly the input.
pub fn compress_verified(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let compressed = encode(input);
    if compressed.len() >= input.len() {
        return Err(CodecError::NotSmaller {
            compressed: compressed.len(),
            original: input.len(),
        });
    }
    let decoded = decode(&compressed, input.len())?;
    if decoded != input {
        return Err(CodecError::RoundTripMismatch);
    }
    Ok(compressed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zeros_300() {
        let input = vec![0u8; 300];
        let encoded = encode(&input);
        assert_eq!(encoded, vec![128, 128, 44]);
        assert_eq!(decode(&encoded, 300).unwrap(), input);
    }

    #[test]
    fn test_nonzero_200() {
        let input: Vec<u8> = (0..200).map(|i| (i % 255) as u8 + 1).collect();
        let encoded = encode(&input);
        assert_eq!(encoded.len(), 202);
        assert_eq!(encoded[127], 0x80 + 127);
        assert_eq!(encoded[201], 0x80 + 73);
        assert_eq!(&encoded[..127], &input[..127]);
        assert_eq!(&encoded[128..201], &input[127..]);
        assert_eq!(decode(&encoded, 200).unwrap(), input);
    }

    #[test]
    fn test_nonzero_not_compressible() {
        let input = vec![0xAB; 200];
        assert_eq!(
            compress_verified(&input),
            Err(CodecError::NotSmaller {
                compressed: 202,
                original: 200,
            })
        );
    }

    #[test]
    fn test_mixed_segments() {
        let input = [1, 2, 0, 0, 0, 3, 0, 4];
        let encoded = encode(&input);
        // [1,2] literal, 3 zeros, [3,0,4] literal (single zero absorbed)
        assert_eq!(encoded, vec![1, 2, 0x82, 3, 3, 0, 4, 0x83]);
        assert_eq!(decode(&encoded, input.len()).unwrap(), input);
    }

    #[test]
    fn test_single_zero_is_literal() {
        assert_eq!(encode(&[0]), vec![0, 0x81]);
        assert_eq!(encode(&[7, 0]), vec![7, 0, 0x82]);
    }

    #[test]
    fn test_empty() {
        assert!(encode(&[]).is_empty());
        assert_eq!(decode(&[], 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_many_literal_runs_decode() {
        // Two full literal runs: more input than output remains for most of the walk
        let input: Vec<u8> = (0..254).map(|i| (i % 200) as u8 + 1).collect();
        let encoded = encode(&input);
        assert_eq!(encoded.len(), 256);
        assert_eq!(decode(&encoded, input.len()).unwrap(), input);
    }

    #[test]
    fn test_decode_zero_run_overruns_output() {
        assert_eq!(
            decode(&[5], 3),
            Err(CodecError::OutputUnderrun {
                at: 0,
                len: 5,
                remaining: 3,
            })
        );
    }

    #[test]
    fn test_decode_literal_overruns_input() {
        assert_eq!(
            decode(&[1, 2, 0x83], 3),
            Err(CodecError::InputUnderrun {
                at: 2,
                len: 3,
                remaining: 2,
            })
        );
    }

    #[test]
    fn test_decode_literal_overruns_output() {
        assert!(matches!(
            decode(&[1, 2, 3, 0x83], 2),
            Err(CodecError::OutputUnderrun { .. })
        ));
    }

    #[test]
    fn test_decode_short_output_is_misaligned() {
        assert_eq!(
            decode(&[0x02], 5),
            Err(CodecError::Misaligned {
                input: 0,
                output: 3,
            })
        );
    }

    #[test]
    fn test_decode_truncated_input() {
        let input = [9, 8, 7, 0, 0, 0, 0, 6];
        let encoded = encode(&input);
        assert!(decode(&encoded[1..], input.len()).is_err());
    }

    #[test]
    fn test_decode_zero_length_control() {
        assert_eq!(decode(&[0x00], 0), Err(CodecError::ZeroLengthRun { at: 0 }));
    }

    #[test]
    fn test_compress_verified_sparse() {
        let mut input = vec![0u8; 1024];
        input[10] = 0x11;
        input[500] = 0x22;
        let compressed = compress_verified(&input).unwrap();
        assert!(compressed.len() < input.len());
        assert_eq!(decode(&compressed, input.len()).unwrap(), input);
    }

    proptest! {
        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let encoded = encode(&data);
            prop_assert_eq!(decode(&encoded, data.len()).unwrap(), data);
        }

        #[test]
        fn prop_round_trip_sparse(
            data in proptest::collection::vec(prop_oneof![4 => Just(0u8), 1 => any::<u8>()], 0..4096)
        ) {
            let encoded = encode(&data);
            prop_assert_eq!(decode(&encoded, data.len()).unwrap(), data);
        }
    }
}
