//! Sound tags. Sample data is staged per pitch-range permutation as asset
//! blobs, mirroring how the engine streams them back out of the cache file
//! or a resource map.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::tag::Emitter;
use crate::types::TagString;

#[derive(Clone, Debug, Default)]
/// One playable variant of a pitch range.
pub struct SoundPermutation {
    pub name: TagString,
    pub gain: f32,
    pub samples: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct PitchRange {
    pub name: TagString,
    pub natural_pitch: f32,
    pub permutations: Vec<SoundPermutation>,
}

#[derive(Clone, Debug, Default)]
/// A sound tag.
pub struct Sound {
    pub flags: u32,
    pub sound_class: u16,
    pub sample_rate: u16,
    /// Scaled for the menu click quirk on non-native targets.
    pub random_gain_modifier: f32,
    pub pitch_ranges: Vec<PitchRange>,
}

impl Sound {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut sound = Self {
            flags: reader.read_u32::<LE>()?,
            sound_class: reader.read_u16::<LE>()?,
            sample_rate: reader.read_u16::<LE>()?,
            random_gain_modifier: reader.read_f32::<LE>()?,
            ..Self::default()
        };
        let range_count = reader.read_u32::<LE>()?;
        for _ in 0..range_count {
            let name = TagString::read(reader)?;
            let natural_pitch = reader.read_f32::<LE>()?;
            let permutation_count = reader.read_u32::<LE>()?;
            let mut permutations = Vec::with_capacity(permutation_count as usize);
            for _ in 0..permutation_count {
                let name = TagString::read(reader)?;
                let gain = reader.read_f32::<LE>()?;
                let sample_count = reader.read_u32::<LE>()?;
                let mut samples = vec![0; sample_count as usize];
                reader.read_exact(&mut samples)?;
                permutations.push(SoundPermutation {
                    name,
                    gain,
                    samples,
                });
            }
            sound.pitch_ranges.push(PitchRange {
                name,
                natural_pitch,
                permutations,
            });
        }
        Ok(sound)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.flags)?;
        writer.write_u16::<LE>(self.sound_class)?;
        writer.write_u16::<LE>(self.sample_rate)?;
        writer.write_f32::<LE>(self.random_gain_modifier)?;
        writer.write_u32::<LE>(self.pitch_ranges.len() as u32)?;
        for range in &self.pitch_ranges {
            range.name.write(writer)?;
            writer.write_f32::<LE>(range.natural_pitch)?;
            writer.write_u32::<LE>(range.permutations.len() as u32)?;
            for permutation in &range.permutations {
                permutation.name.write(writer)?;
                writer.write_f32::<LE>(permutation.gain)?;
                writer.write_u32::<LE>(permutation.samples.len() as u32)?;
                writer.write_all(&permutation.samples)?;
            }
        }
        Ok(())
    }

    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        for range in &self.pitch_ranges {
            for permutation in &range.permutations {
                if permutation.samples.is_empty() {
                    workload.warn(
                        tag_index,
                        format!(
                            "permutation {} of pitch range {} has no sample data",
                            permutation.name, range.name
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    /// 28-byte engine main struct; 52-byte pitch range records, 48-byte
    /// permutation records each owning one sample blob.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u32(self.flags)?;
        emitter.write_u16(self.sound_class)?;
        emitter.write_u16(self.sample_rate)?;
        emitter.write_f32(self.random_gain_modifier)?;
        emitter.pad(4)?;
        let ranges_stub = emitter.reserve_block()?;
        emitter.commit_block(ranges_stub, self.pitch_ranges.len())?;
        let mut permutation_stubs = Vec::with_capacity(self.pitch_ranges.len());
        for range in &self.pitch_ranges {
            emitter.write_tag_string(&range.name)?;
            emitter.write_f32(range.natural_pitch)?;
            emitter.pad(4)?;
            permutation_stubs.push(emitter.reserve_block()?);
        }
        for (range, stub) in self.pitch_ranges.iter().zip(permutation_stubs) {
            emitter.commit_block(stub, range.permutations.len())?;
            for permutation in &range.permutations {
                let asset = emitter.add_asset(permutation.samples.clone());
                emitter.write_tag_string(&permutation.name)?;
                emitter.write_f32(permutation.gain)?;
                emitter.write_u32(permutation.samples.len() as u32)?;
                emitter.write_asset_offset(asset)?;
                emitter.pad(4)?;
            }
        }
        Ok(())
    }
}
