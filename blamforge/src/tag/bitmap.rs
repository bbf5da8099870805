//! Bitmap tags. Pixel data is staged as asset blobs during emit so the
//! assembler appends it after the tag-data section, or the indexer replaces
//! it with a resource-map offset.

use bitflags::bitflags;
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::tag::Emitter;
use crate::types::class::TagClass;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Per-bitmap-record flags.
    pub struct BitmapDataFlags: u16 {
        const POWER_OF_TWO_DIMENSIONS = 1 << 0;
        const COMPRESSED = 1 << 1;
        /// Pixel data lives in bitmaps.map rather than in this cache file.
        const EXTERNAL = 1 << 8;
    }
}

/// Byte distance from a record's pixel-data-offset field back to its flags
/// field in the emitted layout; the indexer patches
/// [`EXTERNAL`](`BitmapDataFlags::EXTERNAL`) through it.
pub(crate) const FLAGS_BEFORE_PIXEL_OFFSET: u32 = 6;

#[derive(Clone, Copy, Debug, Default)]
/// One mipmapped image inside a bitmap tag.
pub struct BitmapData {
    pub kind: u16,
    pub width: u16,
    pub height: u16,
    pub depth: u16,
    pub format: u16,
    pub flags: BitmapDataFlags,
    pub mipmap_count: u16,
    /// Offset into the tag's pixel buffer on disk; rewritten to a file or
    /// resource offset during assembly.
    pub pixel_data_offset: u32,
    pub pixel_data_size: u32,
}

#[derive(Clone, Debug, Default)]
/// A bitmap tag.
pub struct Bitmap {
    pub kind: u16,
    pub usage: u16,
    pub bitmaps: Vec<BitmapData>,
    pub pixel_data: Vec<u8>,
}

impl Bitmap {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bitmap = Self {
            kind: reader.read_u16::<LE>()?,
            usage: reader.read_u16::<LE>()?,
            ..Self::default()
        };
        let record_count = reader.read_u32::<LE>()?;
        for _ in 0..record_count {
            bitmap.bitmaps.push(BitmapData {
                kind: reader.read_u16::<LE>()?,
                width: reader.read_u16::<LE>()?,
                height: reader.read_u16::<LE>()?,
                depth: reader.read_u16::<LE>()?,
                format: reader.read_u16::<LE>()?,
                flags: BitmapDataFlags::from_bits_truncate(reader.read_u16::<LE>()?),
                mipmap_count: reader.read_u16::<LE>()?,
                pixel_data_offset: {
                    reader.read_u16::<LE>()?;
                    reader.read_u32::<LE>()?
                },
                pixel_data_size: reader.read_u32::<LE>()?,
            });
        }
        let pixel_count = reader.read_u32::<LE>()?;
        bitmap.pixel_data = vec![0; pixel_count as usize];
        reader.read_exact(&mut bitmap.pixel_data)?;
        Ok(bitmap)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LE>(self.kind)?;
        writer.write_u16::<LE>(self.usage)?;
        writer.write_u32::<LE>(self.bitmaps.len() as u32)?;
        for record in &self.bitmaps {
            writer.write_u16::<LE>(record.kind)?;
            writer.write_u16::<LE>(record.width)?;
            writer.write_u16::<LE>(record.height)?;
            writer.write_u16::<LE>(record.depth)?;
            writer.write_u16::<LE>(record.format)?;
            writer.write_u16::<LE>(record.flags.bits())?;
            writer.write_u16::<LE>(record.mipmap_count)?;
            writer.write_u16::<LE>(0)?;
            writer.write_u32::<LE>(record.pixel_data_offset)?;
            writer.write_u32::<LE>(record.pixel_data_size)?;
        }
        writer.write_u32::<LE>(self.pixel_data.len() as u32)?;
        writer.write_all(&self.pixel_data)?;
        Ok(())
    }

    /// Validates that every record's pixel range falls inside the tag's
    /// pixel buffer.
    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        let buffer_size = self.pixel_data.len();
        for (index, record) in self.bitmaps.iter().enumerate() {
            let offset = record.pixel_data_offset as usize;
            let end = offset.checked_add(record.pixel_data_size as usize);
            if end.is_none_or(|end| end > buffer_size) {
                return Err(workload.fatal(
                    tag_index,
                    format!(
                        "bitmap #{index} pixel range ({offset} + {}) is outside the pixel buffer ({buffer_size})",
                        record.pixel_data_size
                    ),
                ));
            }
        }
        Ok(())
    }

    /// 20-byte engine main struct; each record is 32 bytes and owns one
    /// asset blob cut from the pixel buffer.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u16(self.kind)?;
        emitter.write_u16(self.usage)?;
        emitter.pad(4)?;
        let records_stub = emitter.reserve_block()?;
        emitter.commit_block(records_stub, self.bitmaps.len())?;
        for record in &self.bitmaps {
            let start = record.pixel_data_offset as usize;
            let end = start + record.pixel_data_size as usize;
            let asset = emitter.add_asset(self.pixel_data[start..end].to_vec());
            emitter.write_u32(TagClass::Bitmap.fourcc())?;
            emitter.write_u16(record.width)?;
            emitter.write_u16(record.height)?;
            emitter.write_u16(record.depth)?;
            emitter.write_u16(record.kind)?;
            emitter.write_u16(record.format)?;
            emitter.write_u16(record.flags.bits())?;
            emitter.write_u16(record.mipmap_count)?;
            emitter.pad(2)?;
            emitter.write_asset_offset(asset)?;
            emitter.write_u32(record.pixel_data_size)?;
            emitter.pad(4)?;
        }
        Ok(())
    }
}
