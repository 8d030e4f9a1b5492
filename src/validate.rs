//! Post-write integrity gate.
//!
//! Re-reads the freshly written package and compares it against the
//! pre-write model of the source.  Any disagreement rejects the output;
//! the caller keeps the original file and deletes the temp.
//!
//! Decompress mode skips the signature-hole audit (no hole is written)
//! but still compares every decompressed payload.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use crate::header::HEADER_LEN;
use crate::package::{read_payload, Mode, Package, SIGNATURE};
use crate::qfs;

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("New header does not match the old header")]
    HeaderMismatch,
    #[error("Wrong hole index count")]
    WrongHoleCount,
    #[error("Wrong hole index size")]
    WrongHoleIndexSize,
    #[error("Wrong hole size")]
    WrongHoleSize,
    #[error("Compressor signature not found")]
    SignatureMissing,
    #[error("File size in signature does not match the actual file size")]
    SignatureSizeMismatch,
    #[error("Number of entries between old package and new package not matching")]
    EntryCountMismatch,
    #[error("Types, groups, instances, or resources of entries not matching")]
    KeyMismatch,
    #[error("Incorrect compression information")]
    CompressionInfoMismatch,
    #[error("Mismatch between the uncompressed size in the compression header and the uncompressed size in the CLST")]
    UncompressedSizeMismatch,
    #[error("Mismatch between the compressed size in the compression header and the compressed size in the index")]
    CompressedSizeMismatch,
    #[error("Compressed size is not smaller than the uncompressed size for one entry")]
    CompressedNotSmaller,
    #[error("Mismatch between old entry and new entry")]
    PayloadMismatch,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn stream_len<R: Seek>(file: &mut R) -> io::Result<u64> {
    file.seek(SeekFrom::End(0))
}

/// Decoded form of a payload for comparison; undecodable streams compare
/// as their raw bytes, mirroring how the writer leaves them in place.
fn decoded_form(content: Vec<u8>, compressed: bool) -> Vec<u8> {
    if compressed {
        match qfs::decompress(&content) {
            Ok(raw) => raw,
            Err(_) => content,
        }
    } else {
        content
    }
}

/// Check the just-written package against the pre-write model.
pub fn validate_package<R1, R2>(
    old_pkg: &Package,
    new_pkg: &Package,
    old_file: &mut R1,
    new_file: &mut R2,
    mode: Mode,
) -> Result<(), ValidateError>
where
    R1: Read + Seek,
    R2: Read + Seek,
{
    // Bytes 36–59 hold the rewritten index and hole layout; everything
    // else in the header must survive untouched.
    let old_header = read_payload(old_file, 0, HEADER_LEN as u32)?;
    let new_header = read_payload(new_file, 0, HEADER_LEN as u32)?;
    if old_header[..36] != new_header[..36] || old_header[60..] != new_header[60..] {
        return Err(ValidateError::HeaderMismatch);
    }

    if mode == Mode::Recompress {
        if new_pkg.header.hole_index_entry_count != 1 {
            return Err(ValidateError::WrongHoleCount);
        }
        if new_pkg.header.hole_index_size != 8 {
            return Err(ValidateError::WrongHoleIndexSize);
        }
        let hole = new_pkg.holes[0];
        if hole.size != 8 {
            return Err(ValidateError::WrongHoleSize);
        }

        let hole_data = read_payload(new_file, hole.location, 8)?;
        if LittleEndian::read_u32(&hole_data[0..4]) != SIGNATURE {
            return Err(ValidateError::SignatureMissing);
        }
        let size_in_hole = LittleEndian::read_u32(&hole_data[4..8]);
        if u64::from(size_in_hole) != stream_len(new_file)? {
            return Err(ValidateError::SignatureSizeMismatch);
        }
    }

    // Both sides exclude the CLST, so the counts must line up exactly.
    if old_pkg.entries.len() != new_pkg.entries.len() {
        return Err(ValidateError::EntryCountMismatch);
    }

    for (old_entry, new_entry) in old_pkg.entries.iter().zip(&new_pkg.entries) {
        if old_entry.key != new_entry.key {
            return Err(ValidateError::KeyMismatch);
        }

        let old_content = read_payload(old_file, old_entry.location, old_entry.size)?;
        let new_content = read_payload(new_file, new_entry.location, new_entry.size)?;

        // The CLST and the framing header must agree on who is compressed.
        let compressed_in_header = qfs::is_compressed(&new_content);
        let clst_size = new_pkg.clst.get(&new_entry.key);
        if compressed_in_header != clst_size.is_some() {
            return Err(ValidateError::CompressionInfoMismatch);
        }

        if let Some(&clst_uncompressed) = clst_size {
            let header_uncompressed = BigEndian::read_u24(&new_content[6..9]);
            let header_compressed = LittleEndian::read_u32(&new_content[0..4]);

            if header_uncompressed != clst_uncompressed {
                return Err(ValidateError::UncompressedSizeMismatch);
            }
            if header_compressed != new_entry.size {
                return Err(ValidateError::CompressedSizeMismatch);
            }
            if header_compressed >= header_uncompressed {
                return Err(ValidateError::CompressedNotSmaller);
            }
        }

        let old_plain = decoded_form(old_content, old_entry.compressed);
        let new_plain = decoded_form(new_content, new_entry.compressed);
        if old_plain != new_plain {
            return Err(ValidateError::PayloadMismatch);
        }
    }

    Ok(())
}
