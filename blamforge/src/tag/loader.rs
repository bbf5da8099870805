//! On-disk tag files: the 64-byte container header, ordered-root probing,
//! and the read/write entry points tooling and the build workload share.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::Result;
use crate::common::errors::TagError;
use crate::common::extensions::{ReaderExt, WriterExt};
use crate::tag::TagData;
use crate::types::class::TagClass;

/// Four-cc closing every tag file header.
pub const BLAM_FOURCC: u32 = 0x626C_616D;

/// Byte length of the tag file header.
pub const TAG_FILE_HEADER_SIZE: usize = 0x40;

/// Checksum value that disables verification.
pub const IGNORED_CHECKSUM: u32 = u32::MAX;

const TAG_FILE_VERSION: u16 = 1;

#[derive(Clone, Debug)]
/// The 64-byte header at the start of every tag file.
pub struct TagFileHeader {
    /// Unused id slot, kept zero.
    pub id: u32,
    /// Unused name slot, kept empty.
    pub name: String,
    pub class: TagClass,
    /// CRC32 of the body; [`IGNORED_CHECKSUM`] disables the check.
    pub crc32: u32,
    pub version: u16,
}

impl TagFileHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let id = reader.read_u32::<LE>()?;
        let name = reader.read_fixed_string(32)?;
        let fourcc = reader.read_u32::<LE>()?;
        let class = TagClass::try_from(fourcc).map_err(TagError::UnknownClass)?;
        let crc32 = reader.read_u32::<LE>()?;
        let header_size = reader.read_u32::<LE>()?;
        let mut padding = [0u8; 8];
        reader.read_exact(&mut padding)?;
        let version = reader.read_u16::<LE>()?;
        reader.read_u16::<LE>()?;
        let magic = reader.read_u32::<LE>()?;
        if magic != BLAM_FOURCC || header_size != TAG_FILE_HEADER_SIZE as u32 {
            return Err(TagError::IncorrectMagic(magic).into());
        }
        Ok(Self {
            id,
            name,
            class,
            crc32,
            version,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.id)?;
        writer.write_fixed_string(&self.name, 32)?;
        writer.write_u32::<LE>(self.class.fourcc())?;
        writer.write_u32::<LE>(self.crc32)?;
        writer.write_u32::<LE>(TAG_FILE_HEADER_SIZE as u32)?;
        writer.write_all(&[0u8; 8])?;
        writer.write_u16::<LE>(self.version)?;
        writer.write_u16::<LE>(0x00FF)?;
        writer.write_u32::<LE>(BLAM_FOURCC)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
/// A tag file: header plus parsed body.
pub struct TagFile {
    pub header: TagFileHeader,
    pub data: TagData,
}

impl TagFile {
    /// Wraps parsed data for writing out as a tag file.
    pub fn new(class: TagClass, data: TagData) -> Self {
        Self {
            header: TagFileHeader {
                id: 0,
                name: String::new(),
                class,
                crc32: IGNORED_CHECKSUM,
                version: TAG_FILE_VERSION,
            },
            data,
        }
    }

    /// Parses a tag file image, verifying the class and the body checksum.
    ///
    /// `path` only labels errors.
    pub fn parse(bytes: &[u8], expected_class: TagClass, path: &str) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let header = TagFileHeader::read(&mut reader)?;
        if header.class != expected_class {
            return Err(TagError::IncorrectClass {
                expected: expected_class,
                found: header.class.fourcc(),
            }
            .into());
        }
        let body = &bytes[TAG_FILE_HEADER_SIZE..];
        if header.crc32 != IGNORED_CHECKSUM {
            let actual = crc32fast::hash(body);
            if actual != header.crc32 {
                return Err(TagError::ChecksumMismatch {
                    path: String::from(path),
                    expected: header.crc32,
                    found: actual,
                }
                .into());
            }
        }
        let data = TagData::parse(expected_class, body)?;
        Ok(Self { header, data })
    }

    /// Reads and parses a tag file from disk.
    pub fn read_path(path: &Path, expected_class: TagClass, virtual_path: &str) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes, expected_class, virtual_path)
    }

    /// Serialises the tag file, stamping a fresh body checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.data.write_body(&mut body)?;
        let mut header = self.header.clone();
        header.crc32 = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(TAG_FILE_HEADER_SIZE + body.len());
        header.write(&mut out)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Writes the tag file to disk, creating parent directories as needed.
    pub fn write_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

/// Converts a virtual tag path to its path under one tag root.
pub fn file_path_for(root: &Path, virtual_path: &str, class: TagClass) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in virtual_path.split('\\') {
        path.push(component);
    }
    path.set_extension(class.extension());
    path
}

/// Probes the ordered tag roots for a tag; the first root containing the
/// file shadows the rest.
pub fn find_tag_file(roots: &[PathBuf], virtual_path: &str, class: TagClass) -> Result<PathBuf> {
    for root in roots {
        let candidate = file_path_for(root, virtual_path, class);
        if candidate.is_file() {
            log::debug!("{virtual_path}.{} found in {}", class.extension(), root.display());
            return Ok(candidate);
        }
    }
    Err(TagError::NotFound {
        path: String::from(virtual_path),
        extension: class.extension(),
    }
    .into())
}
