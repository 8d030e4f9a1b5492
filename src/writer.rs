//! Streaming package writer.
//!
//! # Phases
//!
//! The writer produces a complete package in one pass over three phases.
//! First every entry's payload is pulled from the source file behind a
//! single cursor.  The transform phase then recompresses or decompresses
//! one task per entry; with the `parallel` feature (default) it runs on
//! the Rayon pool, and each task owns its entry and payload outright.
//! Finally payloads are appended in entry order with each entry's
//! location and size fixed up, followed by the regenerated CLST, the
//! index, and (when recompressing) the signature hole.  Output order is
//! deterministic.
//!
//! The header is written first with its index and hole fields zeroed and
//! patched at offset 36 once the final layout is known.
//!
//! # Keeping undecodable payloads
//!
//! A payload whose framing header is valid but whose opcode stream this
//! codec cannot decode is kept byte-for-byte and stays marked compressed.
//! Older compressors produced such streams; dropping them would corrupt
//! the package.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, warn};

use crate::entry::{Entry, CLST_KEY};
use crate::header::LAYOUT_PATCH_OFFSET;
use crate::package::{read_payload, Mode, Package, SIGNATURE};
use crate::qfs;

fn decompress_entry(entry: &mut Entry, content: Vec<u8>) -> Vec<u8> {
    if !entry.compressed {
        return content;
    }
    match qfs::decompress(&content) {
        Ok(raw) => {
            entry.compressed = false;
            raw
        }
        Err(err) => {
            warn!("entry {}: kept undecodable compressed payload: {err}", entry.key);
            content
        }
    }
}

/// Recompress one payload, keeping the result only when it beats the
/// original size.  Repeated entries are never compressed.
fn recompress_entry(entry: &mut Entry, content: Vec<u8>) -> Vec<u8> {
    if entry.compressed {
        let raw = match qfs::decompress(&content) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("entry {}: kept undecodable compressed payload: {err}", entry.key);
                return content;
            }
        };
        if !entry.repeated {
            if let Some(packed) = qfs::compress(&raw) {
                if packed.len() < content.len() {
                    return packed;
                }
            }
        }
        // No gain over the original encoding; in the odd case the raw
        // form is smaller than the old compressed form, prefer it.
        if raw.len() < content.len() {
            entry.compressed = false;
            return raw;
        }
        content
    } else {
        if !entry.repeated {
            if let Some(packed) = qfs::compress(&content) {
                entry.compressed = true;
                return packed;
            }
        }
        content
    }
}

fn transform_entry(entry: &mut Entry, content: Vec<u8>, mode: Mode) -> Vec<u8> {
    let content = match mode {
        Mode::Recompress => recompress_entry(entry, content),
        Mode::Decompress => decompress_entry(entry, content),
    };

    entry.size = content.len() as u32;
    if entry.compressed {
        if let Some(uncompressed_size) = qfs::uncompressed_size(&content) {
            entry.uncompressed_size = uncompressed_size;
        }
    }
    content
}

#[cfg(feature = "parallel")]
fn transform_all(entries: &mut [Entry], payloads: Vec<Vec<u8>>, mode: Mode) -> Vec<Vec<u8>> {
    use rayon::prelude::*;
    entries
        .par_iter_mut()
        .zip(payloads)
        .map(|(entry, content)| transform_entry(entry, content, mode))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn transform_all(entries: &mut [Entry], payloads: Vec<Vec<u8>>, mode: Mode) -> Vec<Vec<u8>> {
    entries
        .iter_mut()
        .zip(payloads)
        .map(|(entry, content)| transform_entry(entry, content, mode))
        .collect()
}

/// Write `package` to `dst`, reading payloads from `src` and transforming
/// them per `mode`.  Entry locations and sizes are reassigned in place;
/// the CLST entry is appended to `package.entries` when any entry ends up
/// compressed.
pub fn write_package<W, R>(
    dst: &mut W,
    src: &mut R,
    package: &mut Package,
    mode: Mode,
) -> io::Result<()>
where
    W: Write + Seek,
    R: Read + Seek,
{
    // Header goes out with zeroed layout fields; patched at the end.
    let mut header = package.header.clone();
    header.index_entry_count = 0;
    header.index_location = 0;
    header.index_size = 0;
    header.hole_index_entry_count = 0;
    header.hole_index_location = 0;
    header.hole_index_size = 0;
    header.write(&mut *dst)?;

    // Read phase.
    let mut payloads = Vec::with_capacity(package.entries.len());
    for entry in &package.entries {
        payloads.push(read_payload(src, entry.location, entry.size)?);
    }

    // Transform phase.
    let transformed = transform_all(&mut package.entries, payloads, mode);

    // Write phase.
    for (entry, content) in package.entries.iter_mut().zip(&transformed) {
        entry.location = dst.stream_position()? as u32;
        dst.write_all(content)?;
    }

    let with_resource = package.header.has_resource_field();

    // Regenerate the directory of compressed resources.
    let mut clst_content = Vec::new();
    for entry in package.entries.iter().filter(|e| e.compressed) {
        entry.key.write(&mut clst_content, with_resource)?;
        clst_content.write_u32::<LittleEndian>(entry.uncompressed_size)?;
    }

    if !clst_content.is_empty() {
        let clst_entry = Entry::new(
            CLST_KEY,
            dst.stream_position()? as u32,
            clst_content.len() as u32,
        );
        dst.write_all(&clst_content)?;
        package.entries.push(clst_entry);
    }

    // Index.
    let index_start = dst.stream_position()?;
    for entry in &package.entries {
        entry.key.write(&mut *dst, with_resource)?;
        dst.write_u32::<LittleEndian>(entry.location)?;
        dst.write_u32::<LittleEndian>(entry.size)?;
    }
    let index_end = dst.stream_position()?;

    // Signature hole: an 8-byte hole index record followed by the 8-byte
    // hole carrying "BRG5" and the final file size.
    let hole_index_location = index_end;
    if mode == Mode::Recompress {
        let hole_location = hole_index_location + 8;
        let file_size = hole_location + 8;
        dst.write_u32::<LittleEndian>(hole_location as u32)?;
        dst.write_u32::<LittleEndian>(8)?;
        dst.write_u32::<LittleEndian>(SIGNATURE)?;
        dst.write_u32::<LittleEndian>(file_size as u32)?;
    }

    // Patch the layout fields.
    dst.seek(SeekFrom::Start(LAYOUT_PATCH_OFFSET))?;
    dst.write_u32::<LittleEndian>(package.entries.len() as u32)?;
    dst.write_u32::<LittleEndian>(index_start as u32)?;
    dst.write_u32::<LittleEndian>((index_end - index_start) as u32)?;
    if mode == Mode::Recompress {
        dst.write_u32::<LittleEndian>(1)?;
        dst.write_u32::<LittleEndian>(hole_index_location as u32)?;
        dst.write_u32::<LittleEndian>(8)?;
    }
    dst.flush()?;

    debug!(
        entries = package.entries.len(),
        compressed = package.entries.iter().filter(|e| e.compressed).count(),
        "package written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Tgir;

    fn entry(compressed: bool, repeated: bool) -> Entry {
        Entry {
            key: Tgir {
                type_id: 1,
                group: 2,
                instance: 3,
                resource: 0,
            },
            location: 0,
            size: 0,
            uncompressed_size: 0,
            compressed,
            repeated,
        }
    }

    #[test]
    fn recompress_compresses_shrinkable_payload() {
        let mut e = entry(false, false);
        let raw = vec![0u8; 2048];
        let out = recompress_entry(&mut e, raw.clone());
        assert!(e.compressed);
        assert!(out.len() < raw.len());
        assert_eq!(qfs::decompress(&out).unwrap(), raw);
    }

    #[test]
    fn recompress_keeps_incompressible_payload() {
        let mut e = entry(false, false);
        let raw: Vec<u8> = (0u8..64).collect();
        let out = recompress_entry(&mut e, raw.clone());
        assert!(!e.compressed);
        assert_eq!(out, raw);
    }

    #[test]
    fn recompress_skips_repeated_entries() {
        let mut e = entry(false, true);
        let raw = vec![0u8; 2048];
        let out = recompress_entry(&mut e, raw.clone());
        assert!(!e.compressed);
        assert_eq!(out, raw);
    }

    #[test]
    fn recompress_keeps_undecodable_payload() {
        let mut e = entry(true, false);
        // Valid framing, garbage stream: an offset with no output behind it.
        let bogus = vec![0x00, 0x00, 0x00, 0x00, 0x10, 0xFB, 0x00, 0x01, 0x00, 0x10, 0x01, 0xFC];
        let out = recompress_entry(&mut e, bogus.clone());
        assert!(e.compressed);
        assert_eq!(out, bogus);
    }

    #[test]
    fn decompress_restores_original_bytes() {
        let mut e = entry(true, false);
        let raw = b"abcabcabcabc".repeat(40);
        let packed = qfs::compress(&raw).unwrap();
        let out = decompress_entry(&mut e, packed);
        assert!(!e.compressed);
        assert_eq!(out, raw);
    }

    #[test]
    fn transform_refreshes_uncompressed_size() {
        let mut e = entry(false, false);
        let raw = vec![9u8; 3000];
        let out = transform_entry(&mut e, raw, Mode::Recompress);
        assert!(e.compressed);
        assert_eq!(e.uncompressed_size, 3000);
        assert_eq!(e.size as usize, out.len());
    }
}
