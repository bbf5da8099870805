//! Cache file image layouts: the 0x800-byte file header in its standard and
//! demo arrangements, the tag-data header, tag records, and the per-engine
//! memory budgets.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::Result;
use crate::common::errors::MapError;
use crate::types::{TagId, TagString};

/// Byte length of the cache file header, both layouts.
pub const HEADER_SIZE: usize = 0x800;

/// `head`
pub const HEAD_LITERAL: u32 = 0x6865_6164;
/// `foot`
pub const FOOT_LITERAL: u32 = 0x666F_6F74;
/// `tags`
pub const TAGS_LITERAL: u32 = 0x7461_6773;
/// `Ehed`, the demo head literal
pub const HEAD_LITERAL_DEMO: u32 = 0x4568_6564;
/// `Gfot`, the demo foot literal
pub const FOOT_LITERAL_DEMO: u32 = 0x4766_6F74;

/// Byte length of one model vertex record in the model data section.
pub const VERTEX_RECORD_SIZE: usize = 68;

/// Largest file any target engine will memory-map.
pub const MAXIMUM_FILE_LENGTH: u64 = 0xFFFF_FFFF;

/// Most tags a cache file can carry.
pub const MAXIMUM_TAG_COUNT: usize = 65535;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
/// Target engine codes as stored in the cache file header.
pub enum CacheFileEngine {
    Xbox = 0x5,
    Demo = 0x6,
    Retail = 0x7,
    CustomEdition = 0x261,
    DarkCirclet = 0x1A86,
    /// Demo image holding a zstd frame after the header.
    DemoCompressed = 0x486,
    /// Retail image holding a zstd frame after the header.
    RetailCompressed = 0x487,
    /// Custom Edition image holding a zstd frame after the header.
    CustomEditionCompressed = 0x661,
}

impl CacheFileEngine {
    /// Virtual address the tag-data section is mapped to.
    pub fn base_address(self) -> u32 {
        match self {
            Self::Demo | Self::DemoCompressed => 0x4BF1_0000,
            Self::DarkCirclet => 0x0000_0000,
            _ => 0x4044_0000,
        }
    }

    /// Length of the tag-data address window.
    pub fn memory_length(self) -> u64 {
        match self {
            Self::DarkCirclet => 0x1_0000_0000 - u64::from(self.base_address()),
            _ => 0x170_0000,
        }
    }

    /// True for targets that can reference bitmaps.map / sounds.map /
    /// loc.map instead of carrying asset data in the image.
    pub fn uses_external_resource_maps(self) -> bool {
        matches!(self, Self::Demo | Self::Retail | Self::CustomEdition)
    }

    /// True when resource indexing may drop whole tags, not just asset
    /// blobs.
    pub fn indexes_whole_tags(self) -> bool {
        self == Self::CustomEdition
    }

    /// Engine code stamped into the header when a zstd image is written.
    pub fn compressed_variant(self) -> Option<Self> {
        match self {
            Self::Demo => Some(Self::DemoCompressed),
            Self::Retail => Some(Self::RetailCompressed),
            Self::CustomEdition => Some(Self::CustomEditionCompressed),
            _ => None,
        }
    }

    /// Inverse of [`compressed_variant`](`Self::compressed_variant`).
    pub fn decompressed_variant(self) -> Option<Self> {
        match self {
            Self::DemoCompressed => Some(Self::Demo),
            Self::RetailCompressed => Some(Self::Retail),
            Self::CustomEditionCompressed => Some(Self::CustomEdition),
            _ => None,
        }
    }

    /// True for the engine whose uncompressed header uses the shuffled demo
    /// layout and `Ehed`/`Gfot` literals.
    pub fn uses_demo_layout(self) -> bool {
        self == Self::Demo
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
/// What kind of map the cache file is, inferred from the scenario.
pub enum CacheFileType {
    Singleplayer = 0,
    #[default]
    Multiplayer = 1,
    UserInterface = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
/// Compression discriminator carried by Dark Circlet headers.
pub enum CompressionType {
    #[default]
    Uncompressed = 0,
    Zstd = 1,
}

#[derive(Clone, Debug)]
/// The 0x800-byte cache file header.
///
/// Two wire arrangements exist: the standard one, and the shuffled demo one
/// used by uncompressed Demo maps. [`read`](`Self::read`) accepts either;
/// [`write`](`Self::write`) picks the arrangement from the engine field.
pub struct CacheFileHeader {
    pub engine: CacheFileEngine,
    pub file_size: u32,
    /// Bytes of zero padding after the Xbox deflate stream.
    pub compressed_padding: u32,
    pub tag_data_offset: u32,
    pub tag_data_size: u32,
    /// Total image size before compression; zero on uncompressed PC maps.
    pub decompressed_file_size: u32,
    /// Dark Circlet compression discriminator; zero elsewhere.
    pub compression_type: CompressionType,
    /// Scenario base name.
    pub name: TagString,
    /// Build string of the target engine.
    pub build: TagString,
    pub map_type: CacheFileType,
    pub crc32: u32,
}

impl CacheFileHeader {
    /// Reads and validates a header from the start of `reader`.
    ///
    /// # Errors
    /// - If neither layout's literals check out [`MapError::IncorrectLiteral`]
    /// - If the engine or map type code is unknown [`MapError::UnknownEngine`] / [`MapError::UnknownType`]
    /// - If the reader fails [`ReadError`](`crate::Error::ReadError`)
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buffer = vec![0u8; HEADER_SIZE];
        reader.read_exact(&mut buffer)?;
        let mut cursor = Cursor::new(buffer.as_slice());

        let head = cursor.read_u32::<LE>()?;
        if head == HEAD_LITERAL {
            return Self::read_standard(&mut cursor);
        }
        cursor.seek(SeekFrom::Start(0x2C0))?;
        if cursor.read_u32::<LE>()? == HEAD_LITERAL_DEMO {
            return Self::read_demo(&mut cursor);
        }
        Err(MapError::IncorrectLiteral(head).into())
    }

    fn read_standard(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let engine = CacheFileEngine::try_from(cursor.read_u32::<LE>()?)
            .map_err(MapError::UnknownEngine)?;
        let file_size = cursor.read_u32::<LE>()?;
        let compressed_padding = cursor.read_u32::<LE>()?;
        let tag_data_offset = cursor.read_u32::<LE>()?;
        let tag_data_size = cursor.read_u32::<LE>()?;
        let decompressed_file_size = cursor.read_u32::<LE>()?;
        let compression_type = CompressionType::try_from(cursor.read_u32::<LE>()?)
            .unwrap_or_default();
        let name = TagString::read(cursor)?;
        let build = TagString::read(cursor)?;
        let map_type =
            CacheFileType::try_from(cursor.read_u16::<LE>()?).map_err(MapError::UnknownType)?;
        cursor.seek(SeekFrom::Current(2))?;
        let crc32 = cursor.read_u32::<LE>()?;

        cursor.seek(SeekFrom::Start(0x7FC))?;
        let foot = cursor.read_u32::<LE>()?;
        if foot != FOOT_LITERAL {
            return Err(MapError::IncorrectLiteral(foot).into());
        }

        Ok(Self {
            engine,
            file_size,
            compressed_padding,
            tag_data_offset,
            tag_data_size,
            decompressed_file_size,
            compression_type,
            name,
            build,
            map_type,
            crc32,
        })
    }

    fn read_demo(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        cursor.seek(SeekFrom::Start(0x2))?;
        let map_type =
            CacheFileType::try_from(cursor.read_u16::<LE>()?).map_err(MapError::UnknownType)?;
        cursor.seek(SeekFrom::Start(0x2C4))?;
        let tag_data_size = cursor.read_u32::<LE>()?;
        let build = TagString::read(cursor)?;
        cursor.seek(SeekFrom::Start(0x588))?;
        let engine = CacheFileEngine::try_from(cursor.read_u32::<LE>()?)
            .map_err(MapError::UnknownEngine)?;
        let name = TagString::read(cursor)?;
        cursor.seek(SeekFrom::Start(0x5B0))?;
        let crc32 = cursor.read_u32::<LE>()?;
        cursor.seek(SeekFrom::Start(0x5E8))?;
        let file_size = cursor.read_u32::<LE>()?;
        let tag_data_offset = cursor.read_u32::<LE>()?;
        let foot = cursor.read_u32::<LE>()?;
        if foot != FOOT_LITERAL_DEMO {
            return Err(MapError::IncorrectLiteral(foot).into());
        }

        Ok(Self {
            engine,
            file_size,
            compressed_padding: 0,
            tag_data_offset,
            tag_data_size,
            decompressed_file_size: 0,
            compression_type: CompressionType::Uncompressed,
            name,
            build,
            map_type,
            crc32,
        })
    }

    /// Writes the header in the arrangement the engine field calls for.
    ///
    /// # Errors
    /// - If the writer fails [`ReadError`](`crate::Error::ReadError`)
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut cursor = Cursor::new(vec![0u8; HEADER_SIZE]);
        if self.engine.uses_demo_layout() {
            self.write_demo(&mut cursor)?;
        } else {
            self.write_standard(&mut cursor)?;
        }
        writer.write_all(&cursor.into_inner())?;
        Ok(())
    }

    fn write_standard(&self, cursor: &mut Cursor<Vec<u8>>) -> Result<()> {
        cursor.write_u32::<LE>(HEAD_LITERAL)?;
        cursor.write_u32::<LE>(self.engine as u32)?;
        cursor.write_u32::<LE>(self.file_size)?;
        cursor.write_u32::<LE>(self.compressed_padding)?;
        cursor.write_u32::<LE>(self.tag_data_offset)?;
        cursor.write_u32::<LE>(self.tag_data_size)?;
        cursor.write_u32::<LE>(self.decompressed_file_size)?;
        cursor.write_u32::<LE>(self.compression_type as u32)?;
        self.name.write(cursor)?;
        self.build.write(cursor)?;
        cursor.write_u16::<LE>(self.map_type as u16)?;
        cursor.seek(SeekFrom::Current(2))?;
        cursor.write_u32::<LE>(self.crc32)?;
        cursor.seek(SeekFrom::Start(0x7FC))?;
        cursor.write_u32::<LE>(FOOT_LITERAL)?;
        Ok(())
    }

    fn write_demo(&self, cursor: &mut Cursor<Vec<u8>>) -> Result<()> {
        cursor.seek(SeekFrom::Start(0x2))?;
        cursor.write_u16::<LE>(self.map_type as u16)?;
        cursor.seek(SeekFrom::Start(0x2C0))?;
        cursor.write_u32::<LE>(HEAD_LITERAL_DEMO)?;
        cursor.write_u32::<LE>(self.tag_data_size)?;
        self.build.write(cursor)?;
        cursor.seek(SeekFrom::Start(0x588))?;
        cursor.write_u32::<LE>(self.engine as u32)?;
        self.name.write(cursor)?;
        cursor.seek(SeekFrom::Start(0x5B0))?;
        cursor.write_u32::<LE>(self.crc32)?;
        cursor.seek(SeekFrom::Start(0x5E8))?;
        cursor.write_u32::<LE>(self.file_size)?;
        cursor.write_u32::<LE>(self.tag_data_offset)?;
        cursor.write_u32::<LE>(FOOT_LITERAL_DEMO)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// Header at the start of the tag-data section.
///
/// Xbox images carry the bare 0x14-byte form; every other target appends the
/// model-section fields and the `tags` literal for 0x28 bytes.
pub struct TagDataHeader {
    /// Virtual address of the tag record array.
    pub tag_array_address: u32,
    pub scenario_tag: TagId,
    pub random_number: u32,
    pub tag_count: u32,
    pub model_part_count: u32,
    /// File offset of the model data section.
    pub model_data_file_offset: u32,
    /// Part count again, kept equal to [`model_part_count`](`Self::model_part_count`).
    pub model_part_count_2: u32,
    pub vertex_size: u32,
    pub model_data_size: u32,
}

impl TagDataHeader {
    pub const SIZE: usize = 0x14;
    pub const SIZE_PC: usize = 0x28;

    /// Wire size of the header for the given engine.
    pub fn size_for(engine: CacheFileEngine) -> usize {
        if engine == CacheFileEngine::Xbox {
            Self::SIZE
        } else {
            Self::SIZE_PC
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W, engine: CacheFileEngine) -> Result<()> {
        writer.write_u32::<LE>(self.tag_array_address)?;
        self.scenario_tag.write(writer)?;
        writer.write_u32::<LE>(self.random_number)?;
        writer.write_u32::<LE>(self.tag_count)?;
        writer.write_u32::<LE>(self.model_part_count)?;
        if engine != CacheFileEngine::Xbox {
            writer.write_u32::<LE>(self.model_data_file_offset)?;
            writer.write_u32::<LE>(self.model_part_count_2)?;
            writer.write_u32::<LE>(self.vertex_size)?;
            writer.write_u32::<LE>(self.model_data_size)?;
            writer.write_u32::<LE>(TAGS_LITERAL)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R, engine: CacheFileEngine) -> Result<Self> {
        let mut header = Self {
            tag_array_address: reader.read_u32::<LE>()?,
            scenario_tag: TagId::read(reader)?,
            random_number: reader.read_u32::<LE>()?,
            tag_count: reader.read_u32::<LE>()?,
            model_part_count: reader.read_u32::<LE>()?,
            ..Self::default()
        };
        if engine != CacheFileEngine::Xbox {
            header.model_data_file_offset = reader.read_u32::<LE>()?;
            header.model_part_count_2 = reader.read_u32::<LE>()?;
            header.vertex_size = reader.read_u32::<LE>()?;
            header.model_data_size = reader.read_u32::<LE>()?;
            let literal = reader.read_u32::<LE>()?;
            if literal != TAGS_LITERAL {
                return Err(MapError::IncorrectLiteral(literal).into());
            }
        }
        Ok(header)
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// One 0x20-byte entry of the tag record array.
pub struct TagRecord {
    pub primary_class: u32,
    pub secondary_class: u32,
    pub tertiary_class: u32,
    pub id: TagId,
    /// Virtual address of the tag path string.
    pub path_address: u32,
    /// Virtual address of the payload, or the resource index for indexed
    /// tags.
    pub data: u32,
    pub indexed: u32,
}

impl TagRecord {
    pub const SIZE: usize = 0x20;

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.primary_class)?;
        writer.write_u32::<LE>(self.secondary_class)?;
        writer.write_u32::<LE>(self.tertiary_class)?;
        self.id.write(writer)?;
        writer.write_u32::<LE>(self.path_address)?;
        writer.write_u32::<LE>(self.data)?;
        writer.write_u32::<LE>(self.indexed)?;
        writer.write_u32::<LE>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let record = Self {
            primary_class: reader.read_u32::<LE>()?,
            secondary_class: reader.read_u32::<LE>()?,
            tertiary_class: reader.read_u32::<LE>()?,
            id: TagId::read(reader)?,
            path_address: reader.read_u32::<LE>()?,
            data: reader.read_u32::<LE>()?,
            indexed: reader.read_u32::<LE>()?,
        };
        reader.read_u32::<LE>()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(engine: CacheFileEngine) -> CacheFileHeader {
        CacheFileHeader {
            engine,
            file_size: 0x1_2000,
            compressed_padding: 0,
            tag_data_offset: 0x1000,
            tag_data_size: 0x2000,
            decompressed_file_size: 0,
            compression_type: CompressionType::Uncompressed,
            name: TagString::new("wizard"),
            build: TagString::new("01.00.00.0609"),
            map_type: CacheFileType::Multiplayer,
            crc32: 0x1234_5678,
        }
    }

    #[test]
    fn standard_header_round_trips_at_exactly_0x800() {
        let header = sample_header(CacheFileEngine::Retail);
        let mut buffer = Vec::new();
        header.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), HEADER_SIZE);

        let read = CacheFileHeader::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read.engine, CacheFileEngine::Retail);
        assert_eq!(read.file_size, 0x1_2000);
        assert_eq!(read.tag_data_offset, 0x1000);
        assert_eq!(read.tag_data_size, 0x2000);
        assert_eq!(read.name.as_str(), "wizard");
        assert_eq!(read.map_type, CacheFileType::Multiplayer);
        assert_eq!(read.crc32, 0x1234_5678);
    }

    #[test]
    fn demo_header_uses_demo_literals() {
        let header = sample_header(CacheFileEngine::Demo);
        let mut buffer = Vec::new();
        header.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), HEADER_SIZE);
        assert_eq!(
            u32::from_le_bytes(buffer[0x2C0..0x2C4].try_into().unwrap()),
            HEAD_LITERAL_DEMO
        );
        assert_eq!(
            u32::from_le_bytes(buffer[0x5F0..0x5F4].try_into().unwrap()),
            FOOT_LITERAL_DEMO
        );

        let read = CacheFileHeader::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read.engine, CacheFileEngine::Demo);
        assert_eq!(read.name.as_str(), "wizard");
        assert_eq!(read.crc32, 0x1234_5678);
    }

    #[test]
    fn garbage_header_is_rejected() {
        let buffer = vec![0u8; HEADER_SIZE];
        assert!(CacheFileHeader::read(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn tag_data_header_sizes() {
        let header = TagDataHeader {
            vertex_size: VERTEX_RECORD_SIZE as u32,
            ..TagDataHeader::default()
        };
        let mut xbox = Vec::new();
        header.write(&mut xbox, CacheFileEngine::Xbox).unwrap();
        assert_eq!(xbox.len(), TagDataHeader::SIZE);

        let mut pc = Vec::new();
        header.write(&mut pc, CacheFileEngine::Retail).unwrap();
        assert_eq!(pc.len(), TagDataHeader::SIZE_PC);

        let read = TagDataHeader::read(&mut pc.as_slice(), CacheFileEngine::Retail).unwrap();
        assert_eq!(read.vertex_size, VERTEX_RECORD_SIZE as u32);
    }

    #[test]
    fn tag_record_is_0x20_bytes() {
        let record = TagRecord::default();
        let mut buffer = Vec::new();
        record.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), TagRecord::SIZE);
    }

    #[test]
    fn memory_budgets_per_engine() {
        assert_eq!(CacheFileEngine::Retail.base_address(), 0x4044_0000);
        assert_eq!(CacheFileEngine::Demo.base_address(), 0x4BF1_0000);
        assert_eq!(CacheFileEngine::DarkCirclet.base_address(), 0);
        assert_eq!(CacheFileEngine::Retail.memory_length(), 0x170_0000);
        assert_eq!(CacheFileEngine::DarkCirclet.memory_length(), 0x1_0000_0000);
        assert!(CacheFileEngine::CustomEdition.uses_external_resource_maps());
        assert!(!CacheFileEngine::DarkCirclet.uses_external_resource_maps());
    }
}
