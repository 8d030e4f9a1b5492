//! QFS/RefPack block codec.
//!
//! The codec operates on whole resource payloads.  Compressed form is a
//! 9-byte framing header followed by an opcode stream (see [`control`]):
//!
//! ```text
//! [ compressed size (u32 LE) | 0x10 0xFB | uncompressed size (u24 BE) ]
//! ```
//!
//! The compressed size counts the header itself, matching the entry size
//! recorded in the package index.
//!
//! # Compression contract
//!
//! [`compress`] returns `Some` only when the encoded form (header
//! included) is strictly smaller than the input; it gives up as soon as
//! the running output reaches the input size.  Inputs larger than the
//! 24-bit size field can hold are never compressed.
//!
//! # Decompression contract
//!
//! [`decompress`] rejects streams that read past their input, reference
//! output before its start, or produce a length other than the declared
//! one.  Back-reference copies run one byte at a time: an offset smaller
//! than the copy length replays the just-written bytes into a repeating
//! pattern.

mod control;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

/// Bytes 4–5 of every compressed payload.
pub const SIGNATURE: [u8; 2] = [0x10, 0xFB];
/// Length of the framing header.
pub const HEADER_LEN: usize = 9;
/// Largest payload the 24-bit uncompressed-size field can describe.
pub const MAX_UNCOMPRESSED: usize = 0xFF_FFFF;

const HASH_BITS: u32 = 16;
const HASH_LEN: usize = 1 << HASH_BITS;
const MAX_CHAIN: usize = 128;
/// A match this long is good enough to stop searching the chain.
const NICE_LEN: usize = 128;
const NO_POS: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum QfsError {
    #[error("payload shorter than the 9-byte compression header")]
    MissingHeader,
    #[error("compression signature 0x10FB not found")]
    BadSignature,
    #[error("compressed stream truncated at byte {0}")]
    Truncated(usize),
    #[error("back-reference offset {offset} reaches before the start of output")]
    BadOffset { offset: usize },
    #[error("decompressed {actual} bytes, header declares {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// True when `payload` carries the QFS framing header.
pub fn is_compressed(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload[4..6] == SIGNATURE
}

/// Uncompressed size declared in the framing header, if present.
pub fn uncompressed_size(payload: &[u8]) -> Option<u32> {
    if is_compressed(payload) {
        Some(BigEndian::read_u24(&payload[6..9]))
    } else {
        None
    }
}

// ── Decompression ─────────────────────────────────────────────────────────────

/// Decode a compressed payload back to its original bytes.
pub fn decompress(src: &[u8]) -> Result<Vec<u8>, QfsError> {
    if src.len() < HEADER_LEN {
        return Err(QfsError::MissingHeader);
    }
    if src[4..6] != SIGNATURE {
        return Err(QfsError::BadSignature);
    }
    let declared = BigEndian::read_u24(&src[6..9]) as usize;

    let mut out: Vec<u8> = Vec::with_capacity(declared);
    let mut pos = HEADER_LEN;

    loop {
        let op = control::decode(&src[pos..]).ok_or(QfsError::Truncated(pos))?;
        pos += op.consumed;

        if pos + op.literal > src.len() {
            return Err(QfsError::Truncated(src.len()));
        }
        out.extend_from_slice(&src[pos..pos + op.literal]);
        pos += op.literal;

        if op.copy > 0 {
            if op.offset > out.len() {
                return Err(QfsError::BadOffset { offset: op.offset });
            }
            // Byte-at-a-time so an offset below the copy length repeats
            // the pattern it is reading.
            let mut from = out.len() - op.offset;
            for _ in 0..op.copy {
                let b = out[from];
                out.push(b);
                from += 1;
            }
        }

        if out.len() > declared {
            return Err(QfsError::LengthMismatch {
                declared,
                actual: out.len(),
            });
        }
        if op.terminator {
            break;
        }
    }

    if out.len() != declared {
        return Err(QfsError::LengthMismatch {
            declared,
            actual: out.len(),
        });
    }
    Ok(out)
}

// ── Compression ───────────────────────────────────────────────────────────────

fn hash3(window: &[u8]) -> usize {
    let v = u32::from(window[0]) | (u32::from(window[1]) << 8) | (u32::from(window[2]) << 16);
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

fn insert(src: &[u8], pos: usize, head: &mut [u32], prev: &mut [u32]) {
    let h = hash3(&src[pos..]);
    prev[pos] = head[h];
    head[h] = pos as u32;
}

/// Longest acceptable match for `pos`, as `(length, offset)`.
///
/// A candidate is acceptable only when its length clears the minimum for
/// the opcode family its offset falls in.  The chain runs nearest-first,
/// so among equal lengths the smallest offset (and thus the shortest
/// encoding) wins.
fn find_match(src: &[u8], pos: usize, head: &[u32], prev: &[u32]) -> (usize, usize) {
    let max_len = (src.len() - pos).min(control::MAX_MATCH);
    let mut best_len = 0usize;
    let mut best_off = 0usize;

    let mut cand = head[hash3(&src[pos..])];
    let mut steps = 0usize;

    while cand != NO_POS && steps < MAX_CHAIN {
        let cpos = cand as usize;
        let dist = pos - cpos;
        if dist > control::MAX_OFFSET {
            break;
        }

        let mut len = 0usize;
        while len < max_len && src[cpos + len] == src[pos + len] {
            len += 1;
        }

        let usable = len >= control::MIN_LONG_LEN
            || (len >= control::MIN_MEDIUM_LEN && dist <= control::MAX_MEDIUM_OFFSET)
            || (len >= control::MIN_SHORT_LEN && dist <= control::MAX_SHORT_OFFSET);

        if usable && len > best_len {
            best_len = len;
            best_off = dist;
            if len >= NICE_LEN || len == max_len {
                break;
            }
        }

        cand = prev[cpos];
        steps += 1;
    }

    (best_len, best_off)
}

/// Drain the pending literal run down to at most 3 bytes, emitting
/// 4–112-byte literal blocks.  `None` means the output can no longer beat
/// the input size.
fn flush_literals(
    out: &mut Vec<u8>,
    src: &[u8],
    lit_start: &mut usize,
    upto: usize,
) -> Option<()> {
    while upto - *lit_start >= 4 {
        let n = ((upto - *lit_start) & !3).min(control::MAX_LITERAL_RUN);
        control::push_literal_run(out, n);
        out.extend_from_slice(&src[*lit_start..*lit_start + n]);
        *lit_start += n;
        if out.len() >= src.len() {
            return None;
        }
    }
    Some(())
}

/// Compress `src`, or `None` when no strictly smaller encoding exists.
pub fn compress(src: &[u8]) -> Option<Vec<u8>> {
    if src.len() <= HEADER_LEN || src.len() > MAX_UNCOMPRESSED {
        return None;
    }

    let mut out = vec![0u8; HEADER_LEN];
    let mut head = vec![NO_POS; HASH_LEN];
    let mut prev = vec![NO_POS; src.len()];

    // Positions at or past this point have no full 3-byte prefix.
    let hash_end = src.len() - 2;

    let mut i = 0usize;
    let mut lit_start = 0usize;

    while i < hash_end {
        let (best_len, best_off) = find_match(src, i, &head, &prev);

        if best_len >= control::MIN_SHORT_LEN {
            flush_literals(&mut out, src, &mut lit_start, i)?;
            let carry = i - lit_start;
            control::push_reference(&mut out, best_off, best_len, carry);
            out.extend_from_slice(&src[lit_start..i]);
            if out.len() >= src.len() {
                return None;
            }

            let match_end = i + best_len;
            while i < match_end.min(hash_end) {
                insert(src, i, &mut head, &mut prev);
                i += 1;
            }
            i = match_end;
            lit_start = i;
        } else {
            insert(src, i, &mut head, &mut prev);
            i += 1;
        }
    }

    flush_literals(&mut out, src, &mut lit_start, src.len())?;
    let carry = src.len() - lit_start;
    control::push_terminator(&mut out, carry);
    out.extend_from_slice(&src[lit_start..]);
    if out.len() >= src.len() {
        return None;
    }

    let total = out.len() as u32;
    LittleEndian::write_u32(&mut out[0..4], total);
    out[4] = SIGNATURE[0];
    out[5] = SIGNATURE[1];
    BigEndian::write_u24(&mut out[6..9], src.len() as u32);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes, incompressible in practice.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn roundtrip_zeros() {
        let src = vec![0u8; 4096];
        let packed = compress(&src).expect("zeros compress");
        assert!(packed.len() < src.len());
        assert_eq!(&packed[4..6], &SIGNATURE);
        assert_eq!(BigEndian::read_u24(&packed[6..9]), 4096);
        assert_eq!(LittleEndian::read_u32(&packed[0..4]) as usize, packed.len());
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn roundtrip_text() {
        let src: Vec<u8> = b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .copied()
            .cycle()
            .take(10_000)
            .collect();
        let packed = compress(&src).expect("repetitive text compresses");
        assert!(packed.len() < src.len());
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn roundtrip_mixed() {
        // Runs of noise separated by repeated blocks, exercising all three
        // reference families and literal flushing.
        let mut src = noise(300);
        let block = noise(40);
        for _ in 0..50 {
            src.extend_from_slice(&block);
        }
        src.extend(noise(130));
        let tail = src[..2000].to_vec();
        src.extend_from_slice(&tail);

        let packed = compress(&src).expect("mixed input compresses");
        assert!(packed.len() < src.len());
        assert_eq!(decompress(&packed).unwrap(), src);
    }

    #[test]
    fn incompressible_returns_none() {
        assert!(compress(&noise(64)).is_none());
        assert!(compress(&[]).is_none());
        assert!(compress(&[1, 2, 3]).is_none());
    }

    #[test]
    fn oversized_input_returns_none() {
        let src = vec![0u8; MAX_UNCOMPRESSED + 1];
        assert!(compress(&src).is_none());
    }

    #[test]
    fn repeating_pattern_from_short_offset() {
        // offset 1, count 7 after a single literal replays that byte.
        let src = [
            0x00, 0x00, 0x00, 0x00, // compressed size, unchecked on decode
            0x10, 0xFB, // signature
            0x00, 0x00, 0x08, // uncompressed size 8
            0x11, 0x00, // short ref: literal 1, count 7, offset 1
            b'A', // the literal
            0xFC, // terminator, no trailing literals
        ];
        assert_eq!(decompress(&src).unwrap(), b"AAAAAAAA");
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(decompress(&[0u8; 4]), Err(QfsError::MissingHeader)));
        let unsigned = [0u8; 16];
        assert!(matches!(decompress(&unsigned), Err(QfsError::BadSignature)));
    }

    #[test]
    fn rejects_truncated_stream() {
        let src = [
            0x00, 0x00, 0x00, 0x00, 0x10, 0xFB, 0x00, 0x00, 0x08,
            0xE0, // literal run of 4, but no bytes follow
        ];
        assert!(matches!(decompress(&src), Err(QfsError::Truncated(_))));
    }

    #[test]
    fn rejects_offset_before_start() {
        let src = [
            0x00, 0x00, 0x00, 0x00, 0x10, 0xFB, 0x00, 0x00, 0x08,
            0x10, 0x01, // short ref: no literals, count 7, offset 2
            0xFC,
        ];
        assert!(matches!(decompress(&src), Err(QfsError::BadOffset { .. })));
    }

    #[test]
    fn rejects_length_mismatch() {
        let src = [
            0x00, 0x00, 0x00, 0x00, 0x10, 0xFB, 0x00, 0x00, 0x04, // declares 4
            0xFD, b'x', // terminator with a single literal
        ];
        assert!(matches!(
            decompress(&src),
            Err(QfsError::LengthMismatch { declared: 4, actual: 1 })
        ));
    }

    #[test]
    fn header_probes() {
        let packed = compress(&vec![7u8; 500]).unwrap();
        assert!(is_compressed(&packed));
        assert_eq!(uncompressed_size(&packed), Some(500));
        assert!(!is_compressed(b"plain bytes"));
        assert_eq!(uncompressed_size(b"plain bytes"), None);
    }
}
