//! Package model and reader.
//!
//! # Reader
//! [`Package::read`] parses a seekable byte source into a [`Package`]:
//! header, hole table, resource index, and the directory of compressed
//! resources (CLST).  The CLST is consumed into [`Package::clst`] — it
//! never appears in [`Package::entries`]; the writer regenerates it from
//! scratch.
//!
//! # Signature detection
//! A package written by this tool carries a single 8-byte hole holding
//! the signature word `"BRG5"` and the file size at the time of writing.
//! When both still match, [`Package::signature_present`] is set and the
//! caller can skip the file entirely.
//!
//! # Rejection
//! Any malformed structure yields a [`ReadError`] whose display text is
//! the single-line diagnostic printed next to the file's path.

use std::collections::hash_map::Entry as MapSlot;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::entry::{Entry, Hole, Tgir, CLST_TYPE};
use crate::header::{Header, HeaderError, HEADER_LEN};

/// Signature word "BRG5" stored in the tool's hole.
pub const SIGNATURE: u32 = 0x3547_5242;

/// What to do with each package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Decompress every entry, then compress the ones that shrink.
    Recompress,
    /// Decompress every entry.
    Decompress,
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Header not found")]
    HeaderTooShort,
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("Entry index outside of bounds")]
    IndexOutOfBounds,
    #[error("Entry count larger than index size")]
    IndexCountMismatch,
    #[error("Hole index outside of bounds")]
    HoleIndexOutOfBounds,
    #[error("Hole count larger than hole index size")]
    HoleCountMismatch,
    #[error("Hole location outside of bounds")]
    HoleOutOfBounds,
    #[error("Entry location outside of bounds")]
    EntryOutOfBounds,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One parsed package file.
#[derive(Debug, Clone)]
pub struct Package {
    pub header: Header,
    /// Every resource except the CLST, in index order.
    pub entries: Vec<Entry>,
    pub holes: Vec<Hole>,
    /// Directory of compressed resources: key → uncompressed size.
    pub clst: HashMap<Tgir, u32>,
    /// The tool's signature hole matches the current file size.
    pub signature_present: bool,
}

pub(crate) fn read_payload<R: Read + Seek>(
    file: &mut R,
    location: u32,
    size: u32,
) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(u64::from(location)))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

impl Package {
    /// Parse `file` into a package.  `mode` only affects whether repeated
    /// keys are detected (they matter to recompression alone).
    pub fn read<R: Read + Seek>(file: &mut R, mode: Mode) -> Result<Self, ReadError> {
        let file_size = file.seek(SeekFrom::End(0))?;
        if file_size < HEADER_LEN as u64 {
            return Err(ReadError::HeaderTooShort);
        }
        file.seek(SeekFrom::Start(0))?;

        let mut header_buf = [0u8; HEADER_LEN];
        file.read_exact(&mut header_buf)?;
        let header = Header::read(Cursor::new(&header_buf))?;

        if u64::from(header.index_location) + u64::from(header.index_size) > file_size {
            return Err(ReadError::IndexOutOfBounds);
        }
        if u64::from(header.index_entry_count) * u64::from(header.index_stride())
            > u64::from(header.index_size)
        {
            return Err(ReadError::IndexCountMismatch);
        }
        if u64::from(header.hole_index_location) + u64::from(header.hole_index_size) > file_size {
            return Err(ReadError::HoleIndexOutOfBounds);
        }
        if u64::from(header.hole_index_entry_count) * 8 != u64::from(header.hole_index_size) {
            return Err(ReadError::HoleCountMismatch);
        }

        // Hole table.
        let hole_buf = read_payload(file, header.hole_index_location, header.hole_index_size)?;
        let mut cursor = Cursor::new(&hole_buf);
        let mut holes = Vec::with_capacity(header.hole_index_entry_count as usize);
        for _ in 0..header.hole_index_entry_count {
            let location = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            holes.push(Hole { location, size });
        }

        // Signature detection: exactly one 8-byte hole holding "BRG5" and
        // the current file size marks a package this tool already wrote.
        let mut signature_present = false;
        if header.hole_index_entry_count == 1 && holes[0].size == 8 {
            let hole = holes[0];
            if u64::from(hole.location) + u64::from(hole.size) > file_size {
                return Err(ReadError::HoleOutOfBounds);
            }
            let sig_buf = read_payload(file, hole.location, 8)?;
            let mut cursor = Cursor::new(&sig_buf);
            let sig = cursor.read_u32::<LittleEndian>()?;
            let size_in_hole = cursor.read_u32::<LittleEndian>()?;
            if sig == SIGNATURE && u64::from(size_in_hole) == file_size {
                signature_present = true;
            }
        }

        // Resource index.  The CLST payload is consumed on the spot.
        let index_buf = read_payload(file, header.index_location, header.index_size)?;
        let mut cursor = Cursor::new(&index_buf);
        let with_resource = header.has_resource_field();

        let mut entries = Vec::with_capacity(header.index_entry_count as usize);
        let mut clst_content: Vec<u8> = Vec::new();

        for _ in 0..header.index_entry_count {
            let key = Tgir::read(&mut cursor, with_resource)?;
            let location = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;

            if u64::from(location) + u64::from(size) > file_size {
                return Err(ReadError::EntryOutOfBounds);
            }

            if key.type_id == CLST_TYPE {
                clst_content = read_payload(file, location, size)?;
            } else {
                entries.push(Entry::new(key, location, size));
            }
        }

        // Directory of compressed resources.
        let record_len = if with_resource { 20 } else { 16 };
        let mut clst = HashMap::with_capacity(clst_content.len() / record_len);
        let mut cursor = Cursor::new(&clst_content);
        while clst_content.len() - cursor.position() as usize >= record_len {
            let key = Tgir::read(&mut cursor, with_resource)?;
            let uncompressed_size = cursor.read_u32::<LittleEndian>()?;
            clst.insert(key, uncompressed_size);
        }

        for entry in &mut entries {
            if let Some(&uncompressed_size) = clst.get(&entry.key) {
                entry.compressed = true;
                entry.uncompressed_size = uncompressed_size;
            }
        }

        // Entries sharing a key may alias each other's payloads; they are
        // never recompressed, so only that mode pays for the scan.
        if mode == Mode::Recompress {
            let mut first_seen: HashMap<Tgir, usize> = HashMap::with_capacity(entries.len());
            for i in 0..entries.len() {
                match first_seen.entry(entries[i].key) {
                    MapSlot::Occupied(slot) => {
                        let j = *slot.get();
                        entries[i].repeated = true;
                        entries[j].repeated = true;
                    }
                    MapSlot::Vacant(slot) => {
                        slot.insert(i);
                    }
                }
            }
        }

        Ok(Self {
            header,
            entries,
            holes,
            clst,
            signature_present,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn minimal_header(index_location: u32, index_size: u32, entry_count: u32) -> Vec<u8> {
        let header = Header {
            major_version: 1,
            minor_version: 1,
            major_user_version: 0,
            minor_user_version: 0,
            flags: 0,
            created_date: 0,
            modified_date: 0,
            index_major_version: 7,
            index_entry_count: entry_count,
            index_location,
            index_size,
            hole_index_entry_count: 0,
            hole_index_location: 0,
            hole_index_size: 0,
            index_minor_version: 1,
            remainder: [0; 32],
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn empty_package_parses() {
        let bytes = minimal_header(96, 0, 0);
        let pkg = Package::read(&mut Cursor::new(bytes), Mode::Recompress).unwrap();
        assert!(pkg.entries.is_empty());
        assert!(pkg.holes.is_empty());
        assert!(pkg.clst.is_empty());
        assert!(!pkg.signature_present);
    }

    #[test]
    fn rejects_truncated_file() {
        let err = Package::read(&mut Cursor::new(vec![0u8; 40]), Mode::Recompress).unwrap_err();
        assert!(matches!(err, ReadError::HeaderTooShort));
    }

    #[test]
    fn rejects_index_out_of_bounds() {
        let bytes = minimal_header(96, 400, 0);
        let err = Package::read(&mut Cursor::new(bytes), Mode::Recompress).unwrap_err();
        assert!(matches!(err, ReadError::IndexOutOfBounds));
    }

    #[test]
    fn rejects_oversized_entry_count() {
        let mut bytes = minimal_header(96, 20, 4);
        bytes.extend_from_slice(&[0u8; 20]);
        let err = Package::read(&mut Cursor::new(bytes), Mode::Recompress).unwrap_err();
        assert!(matches!(err, ReadError::IndexCountMismatch));
    }

    #[test]
    fn rejects_entry_out_of_bounds() {
        // One index record pointing past the end of the file.
        let mut bytes = minimal_header(96, 20, 1);
        let mut record = Vec::new();
        let key = Tgir {
            type_id: 1,
            group: 2,
            instance: 3,
            resource: 0,
        };
        key.write(&mut record, false).unwrap();
        record.write_u32::<LittleEndian>(500).unwrap();
        record.write_u32::<LittleEndian>(100).unwrap();
        bytes.extend_from_slice(&record);
        let err = Package::read(&mut Cursor::new(bytes), Mode::Recompress).unwrap_err();
        assert!(matches!(err, ReadError::EntryOutOfBounds));
    }

    #[test]
    fn marks_repeated_keys_in_recompress_mode() {
        let key = Tgir {
            type_id: 0x10,
            group: 0x20,
            instance: 0x30,
            resource: 0,
        };
        let mut index = Vec::new();
        for _ in 0..2 {
            key.write(&mut index, false).unwrap();
            index.write_u32::<LittleEndian>(96).unwrap();
            index.write_u32::<LittleEndian>(0).unwrap();
        }
        let mut bytes = minimal_header(96, 40, 2);
        bytes.extend_from_slice(&index);

        let pkg = Package::read(&mut Cursor::new(bytes.clone()), Mode::Recompress).unwrap();
        assert!(pkg.entries.iter().all(|e| e.repeated));

        let pkg = Package::read(&mut Cursor::new(bytes), Mode::Decompress).unwrap();
        assert!(pkg.entries.iter().all(|e| !e.repeated));
    }
}
