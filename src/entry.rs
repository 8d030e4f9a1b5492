use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};

/// Resource type of the directory-of-compressed-resources.
pub const CLST_TYPE: u32 = 0xE86B_1EEF;

/// Key under which the regenerated directory is filed in the index.
pub const CLST_KEY: Tgir = Tgir {
    type_id: 0xE86B_1EEF,
    group: 0xE86B_1EEF,
    instance: 0x286B_1F03,
    resource: 0,
};

/// Resource key: the (type, group, instance, resource) tuple.  The
/// resource field is meaningful only for index minor version 2 and is
/// zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tgir {
    pub type_id: u32,
    pub group: u32,
    pub instance: u32,
    pub resource: u32,
}

impl Tgir {
    pub fn read<R: Read>(reader: &mut R, with_resource: bool) -> io::Result<Self> {
        let type_id = reader.read_u32::<LittleEndian>()?;
        let group = reader.read_u32::<LittleEndian>()?;
        let instance = reader.read_u32::<LittleEndian>()?;
        let resource = if with_resource {
            reader.read_u32::<LittleEndian>()?
        } else {
            0
        };
        Ok(Self {
            type_id,
            group,
            instance,
            resource,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W, with_resource: bool) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.type_id)?;
        writer.write_u32::<LittleEndian>(self.group)?;
        writer.write_u32::<LittleEndian>(self.instance)?;
        if with_resource {
            writer.write_u32::<LittleEndian>(self.resource)?;
        }
        Ok(())
    }
}

impl fmt::Display for Tgir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:08X}-{:08X}-{:08X}",
            self.type_id, self.group, self.instance, self.resource
        )
    }
}

/// One resource in the package.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Tgir,
    pub location: u32,
    pub size: u32,
    /// Valid only while `compressed` is set.
    pub uncompressed_size: u32,
    pub compressed: bool,
    /// Another entry with the same key exists in this package.
    pub repeated: bool,
}

impl Entry {
    pub fn new(key: Tgir, location: u32, size: u32) -> Self {
        Self {
            key,
            location,
            size,
            uncompressed_size: 0,
            compressed: false,
            repeated: false,
        }
    }
}

/// A hole: space in the file the game ignores.
#[derive(Debug, Clone, Copy)]
pub struct Hole {
    pub location: u32,
    pub size: u32,
}
