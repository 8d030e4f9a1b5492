use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC: u32 = 0x4650_4244; // "DBPF"
pub const HEADER_LEN: usize = 96;
/// Offset of the index/hole layout fields patched after writing payloads.
pub const LAYOUT_PATCH_OFFSET: u64 = 36;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Magic header not found")]
    BadMagic,
    #[error("Not a Sims 2 package file")]
    UnsupportedVersion,
    #[error("Unrecognized index version")]
    UnsupportedIndexVersion,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The fixed 96-byte package header.  `remainder` carries bytes 64–95
/// verbatim; the game stores reserved data there that must survive a
/// rewrite.
#[derive(Debug, Clone)]
pub struct Header {
    pub major_version: u32,
    pub minor_version: u32,
    pub major_user_version: u32,
    pub minor_user_version: u32,
    pub flags: u32,
    pub created_date: u32,
    pub modified_date: u32,
    pub index_major_version: u32,
    pub index_entry_count: u32,
    pub index_location: u32,
    pub index_size: u32,
    pub hole_index_entry_count: u32,
    pub hole_index_location: u32,
    pub hole_index_size: u32,
    pub index_minor_version: u32,
    pub remainder: [u8; 32],
}

impl Header {
    /// Index stride in bytes: minor version 2 adds the resource field.
    pub fn index_stride(&self) -> u32 {
        if self.index_minor_version == 2 {
            24
        } else {
            20
        }
    }

    /// True when index entries carry the fourth (resource) key field.
    pub fn has_resource_field(&self) -> bool {
        self.index_minor_version == 2
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(HeaderError::BadMagic);
        }

        let major_version = reader.read_u32::<LittleEndian>()?;
        let minor_version = reader.read_u32::<LittleEndian>()?;
        let major_user_version = reader.read_u32::<LittleEndian>()?;
        let minor_user_version = reader.read_u32::<LittleEndian>()?;
        let flags = reader.read_u32::<LittleEndian>()?;
        let created_date = reader.read_u32::<LittleEndian>()?;
        let modified_date = reader.read_u32::<LittleEndian>()?;
        let index_major_version = reader.read_u32::<LittleEndian>()?;
        let index_entry_count = reader.read_u32::<LittleEndian>()?;
        let index_location = reader.read_u32::<LittleEndian>()?;
        let index_size = reader.read_u32::<LittleEndian>()?;
        let hole_index_entry_count = reader.read_u32::<LittleEndian>()?;
        let hole_index_location = reader.read_u32::<LittleEndian>()?;
        let hole_index_size = reader.read_u32::<LittleEndian>()?;
        let index_minor_version = reader.read_u32::<LittleEndian>()?;
        let mut remainder = [0u8; 32];
        reader.read_exact(&mut remainder)?;

        // Other values belong to package files of later games.
        if major_version != 1 || minor_version > 2 || index_major_version != 7 {
            return Err(HeaderError::UnsupportedVersion);
        }
        if index_minor_version > 2 {
            return Err(HeaderError::UnsupportedIndexVersion);
        }

        Ok(Self {
            major_version,
            minor_version,
            major_user_version,
            minor_user_version,
            flags,
            created_date,
            modified_date,
            index_major_version,
            index_entry_count,
            index_location,
            index_size,
            hole_index_entry_count,
            hole_index_location,
            hole_index_size,
            index_minor_version,
            remainder,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.major_version)?;
        writer.write_u32::<LittleEndian>(self.minor_version)?;
        writer.write_u32::<LittleEndian>(self.major_user_version)?;
        writer.write_u32::<LittleEndian>(self.minor_user_version)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.created_date)?;
        writer.write_u32::<LittleEndian>(self.modified_date)?;
        writer.write_u32::<LittleEndian>(self.index_major_version)?;
        writer.write_u32::<LittleEndian>(self.index_entry_count)?;
        writer.write_u32::<LittleEndian>(self.index_location)?;
        writer.write_u32::<LittleEndian>(self.index_size)?;
        writer.write_u32::<LittleEndian>(self.hole_index_entry_count)?;
        writer.write_u32::<LittleEndian>(self.hole_index_location)?;
        writer.write_u32::<LittleEndian>(self.hole_index_size)?;
        writer.write_u32::<LittleEndian>(self.index_minor_version)?;
        writer.write_all(&self.remainder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Header {
        Header {
            major_version: 1,
            minor_version: 1,
            major_user_version: 0,
            minor_user_version: 0,
            flags: 0,
            created_date: 0x5F00_0000,
            modified_date: 0x5F00_0001,
            index_major_version: 7,
            index_entry_count: 3,
            index_location: 96,
            index_size: 60,
            hole_index_entry_count: 0,
            hole_index_location: 0,
            hole_index_size: 0,
            index_minor_version: 1,
            remainder: [0xAB; 32],
        }
    }

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let parsed = Header::read(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.index_entry_count, 3);
        assert_eq!(parsed.index_minor_version, 1);
        assert_eq!(parsed.remainder, [0xAB; 32]);
        assert_eq!(parsed.index_stride(), 20);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            Header::read(Cursor::new(&buf)),
            Err(HeaderError::BadMagic)
        ));
    }

    #[test]
    fn rejects_foreign_versions() {
        let mut wrong_major = sample();
        wrong_major.major_version = 2;
        let mut buf = Vec::new();
        wrong_major.write(&mut buf).unwrap();
        assert!(matches!(
            Header::read(Cursor::new(&buf)),
            Err(HeaderError::UnsupportedVersion)
        ));

        let mut wrong_index = sample();
        wrong_index.index_minor_version = 3;
        let mut buf = Vec::new();
        wrong_index.write(&mut buf).unwrap();
        assert!(matches!(
            Header::read(Cursor::new(&buf)),
            Err(HeaderError::UnsupportedIndexVersion)
        ));
    }

    #[test]
    fn v2_stride() {
        let mut h = sample();
        h.index_minor_version = 2;
        assert_eq!(h.index_stride(), 24);
        assert!(h.has_resource_field());
    }
}
