//! Unicode string list tags, the payloads loc.map externalises.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::common::extensions::{ReaderExt, WriterExt};
use crate::tag::{Emitter, RelocationTarget};

#[derive(Clone, Debug, Default)]
/// A unicode string list tag.
pub struct StringList {
    pub strings: Vec<String>,
}

impl StringList {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32::<LE>()?;
        let mut strings = Vec::with_capacity(count as usize);
        for _ in 0..count {
            strings.push(reader.read_prefixed_string()?);
        }
        Ok(Self { strings })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.strings.len() as u32)?;
        for string in &self.strings {
            writer.write_prefixed_string(string)?;
        }
        Ok(())
    }

    /// 12-byte main struct; 12-byte records pointing at NUL-terminated
    /// UTF-16 payloads.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        let strings_stub = emitter.reserve_block()?;
        emitter.commit_block(strings_stub, self.strings.len())?;
        let mut offset_slots = Vec::with_capacity(self.strings.len());
        for string in &self.strings {
            let encoded_length = (string.encode_utf16().count() + 1) * 2;
            emitter.write_u32(encoded_length as u32)?;
            offset_slots.push(emitter.offset());
            emitter.write_u32(0)?;
            emitter.pad(4)?;
        }
        for (string, slot) in self.strings.iter().zip(offset_slots) {
            emitter.add_relocation(slot, RelocationTarget::Payload(emitter.offset()));
            for unit in string.encode_utf16() {
                emitter.write_u16(unit)?;
            }
            emitter.write_u16(0)?;
        }
        Ok(())
    }
}
