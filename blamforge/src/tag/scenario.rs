//! Scenario tags: the root of every build, carrying the cache file type,
//! the sky and structure BSP references, and the encounters and command
//! lists whose points get BSP-leaf fixups before assembly.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::map::CacheFileType;
use crate::tag::{Emitter, TagReference};
use crate::types::{FlaggedU32, NULL_INDEX, Point3D, TagString};

#[derive(Clone, Copy, Debug, Default)]
/// A spot AI can fire from; the containing BSP leaf is stashed during the
/// scenario fixup pass.
pub struct FiringPosition {
    pub position: Point3D,
    pub group_index: u16,
    pub cluster_index: u16,
    pub leaf_index: FlaggedU32,
}

#[derive(Clone, Debug, Default)]
pub struct Encounter {
    pub name: TagString,
    pub flags: u32,
    pub team_index: u16,
    /// Which structure BSP the encounter lives in; fixed up before
    /// assembly.
    pub precomputed_bsp_index: u16,
    pub firing_positions: Vec<FiringPosition>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommandPoint {
    pub position: Point3D,
    pub leaf_index: FlaggedU32,
}

#[derive(Clone, Debug, Default)]
pub struct CommandList {
    pub name: TagString,
    pub flags: u32,
    pub precomputed_bsp_index: u16,
    pub points: Vec<CommandPoint>,
}

#[derive(Clone, Debug, Default)]
/// A scenario tag.
pub struct Scenario {
    pub map_type: CacheFileType,
    pub flags: u16,
    pub skies: Vec<TagReference>,
    /// Additional tags the scenario keeps loaded (sounds, string lists,
    /// palettes distilled to plain references).
    pub resources: Vec<TagReference>,
    pub encounters: Vec<Encounter>,
    pub command_lists: Vec<CommandList>,
    pub structure_bsps: Vec<TagReference>,
}

impl Scenario {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let map_type = CacheFileType::try_from(reader.read_u16::<LE>()?)
            .map_err(crate::common::errors::MapError::UnknownType)?;
        let flags = reader.read_u16::<LE>()?;
        let mut scenario = Self {
            map_type,
            flags,
            ..Self::default()
        };
        let sky_count = reader.read_u32::<LE>()?;
        for _ in 0..sky_count {
            scenario.skies.push(TagReference::read(reader)?);
        }
        let resource_count = reader.read_u32::<LE>()?;
        for _ in 0..resource_count {
            scenario.resources.push(TagReference::read(reader)?);
        }
        let encounter_count = reader.read_u32::<LE>()?;
        for _ in 0..encounter_count {
            let name = TagString::read(reader)?;
            let flags = reader.read_u32::<LE>()?;
            let team_index = reader.read_u16::<LE>()?;
            let position_count = reader.read_u32::<LE>()?;
            let mut firing_positions = Vec::with_capacity(position_count as usize);
            for _ in 0..position_count {
                firing_positions.push(FiringPosition {
                    position: Point3D::read(reader)?,
                    group_index: reader.read_u16::<LE>()?,
                    cluster_index: reader.read_u16::<LE>()?,
                    leaf_index: FlaggedU32::NULL,
                });
            }
            scenario.encounters.push(Encounter {
                name,
                flags,
                team_index,
                precomputed_bsp_index: NULL_INDEX,
                firing_positions,
            });
        }
        let list_count = reader.read_u32::<LE>()?;
        for _ in 0..list_count {
            let name = TagString::read(reader)?;
            let flags = reader.read_u32::<LE>()?;
            let point_count = reader.read_u32::<LE>()?;
            let mut points = Vec::with_capacity(point_count as usize);
            for _ in 0..point_count {
                points.push(CommandPoint {
                    position: Point3D::read(reader)?,
                    leaf_index: FlaggedU32::NULL,
                });
            }
            scenario.command_lists.push(CommandList {
                name,
                flags,
                precomputed_bsp_index: NULL_INDEX,
                points,
            });
        }
        let bsp_count = reader.read_u32::<LE>()?;
        for _ in 0..bsp_count {
            scenario.structure_bsps.push(TagReference::read(reader)?);
        }
        Ok(scenario)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LE>(self.map_type as u16)?;
        writer.write_u16::<LE>(self.flags)?;
        writer.write_u32::<LE>(self.skies.len() as u32)?;
        for sky in &self.skies {
            sky.write(writer)?;
        }
        writer.write_u32::<LE>(self.resources.len() as u32)?;
        for resource in &self.resources {
            resource.write(writer)?;
        }
        writer.write_u32::<LE>(self.encounters.len() as u32)?;
        for encounter in &self.encounters {
            encounter.name.write(writer)?;
            writer.write_u32::<LE>(encounter.flags)?;
            writer.write_u16::<LE>(encounter.team_index)?;
            writer.write_u32::<LE>(encounter.firing_positions.len() as u32)?;
            for position in &encounter.firing_positions {
                position.position.write(writer)?;
                writer.write_u16::<LE>(position.group_index)?;
                writer.write_u16::<LE>(position.cluster_index)?;
            }
        }
        writer.write_u32::<LE>(self.command_lists.len() as u32)?;
        for list in &self.command_lists {
            list.name.write(writer)?;
            writer.write_u32::<LE>(list.flags)?;
            writer.write_u32::<LE>(list.points.len() as u32)?;
            for point in &list.points {
                point.position.write(writer)?;
            }
        }
        writer.write_u32::<LE>(self.structure_bsps.len() as u32)?;
        for bsp in &self.structure_bsps {
            bsp.write(writer)?;
        }
        Ok(())
    }

    pub fn references_mut(&mut self) -> Vec<&mut TagReference> {
        self.skies
            .iter_mut()
            .chain(self.resources.iter_mut())
            .chain(self.structure_bsps.iter_mut())
            .collect()
    }

    /// Exports the cache file type; the geometry fixups run later as a
    /// dedicated post-pass once every BSP is finalised.
    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, _tag_index: usize) -> Result<()> {
        if workload.cache_file_type.is_none() {
            workload.cache_file_type = Some(self.map_type);
        }
        Ok(())
    }

    /// 64-byte engine main struct plus child records.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u16(self.map_type as u16)?;
        emitter.write_u16(self.flags)?;
        let skies_stub = emitter.reserve_block()?;
        let resources_stub = emitter.reserve_block()?;
        let encounters_stub = emitter.reserve_block()?;
        let lists_stub = emitter.reserve_block()?;
        let bsps_stub = emitter.reserve_block()?;

        emitter.commit_block(skies_stub, self.skies.len())?;
        for sky in &self.skies {
            emitter.write_reference(sky)?;
        }
        emitter.commit_block(resources_stub, self.resources.len())?;
        for resource in &self.resources {
            emitter.write_reference(resource)?;
        }

        emitter.commit_block(encounters_stub, self.encounters.len())?;
        let mut position_stubs = Vec::with_capacity(self.encounters.len());
        for encounter in &self.encounters {
            emitter.write_tag_string(&encounter.name)?;
            emitter.write_u32(encounter.flags)?;
            emitter.write_u16(encounter.team_index)?;
            emitter.write_u16(encounter.precomputed_bsp_index)?;
            emitter.pad(4)?;
            position_stubs.push(emitter.reserve_block()?);
        }
        for (encounter, stub) in self.encounters.iter().zip(position_stubs) {
            emitter.commit_block(stub, encounter.firing_positions.len())?;
            for position in &encounter.firing_positions {
                emitter.write_point(&position.position)?;
                emitter.write_u16(position.group_index)?;
                emitter.write_u16(position.cluster_index)?;
                emitter.write_u32(position.leaf_index.bits())?;
                emitter.pad(4)?;
            }
        }

        emitter.commit_block(lists_stub, self.command_lists.len())?;
        let mut point_stubs = Vec::with_capacity(self.command_lists.len());
        for list in &self.command_lists {
            emitter.write_tag_string(&list.name)?;
            emitter.write_u32(list.flags)?;
            emitter.write_u16(list.precomputed_bsp_index)?;
            emitter.pad(2)?;
            point_stubs.push(emitter.reserve_block()?);
        }
        for (list, stub) in self.command_lists.iter().zip(point_stubs) {
            emitter.commit_block(stub, list.points.len())?;
            for point in &list.points {
                emitter.write_point(&point.position)?;
                emitter.write_u32(point.leaf_index.bits())?;
            }
        }

        emitter.commit_block(bsps_stub, self.structure_bsps.len())?;
        for bsp in &self.structure_bsps {
            emitter.write_u32(0)?;
            emitter.write_u32(0)?;
            emitter.write_u32(0)?;
            emitter.pad(4)?;
            emitter.write_reference(bsp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::class::TagClass;
    use std::io::Cursor;

    #[test]
    fn source_form_round_trips() {
        let scenario = Scenario {
            map_type: CacheFileType::Multiplayer,
            flags: 0,
            skies: vec![TagReference::new(TagClass::Sky, r"sky\generic\space\space")],
            encounters: vec![Encounter {
                name: TagString::new("red base"),
                flags: 0,
                team_index: 1,
                precomputed_bsp_index: NULL_INDEX,
                firing_positions: vec![FiringPosition {
                    position: Point3D::new(1.0, 2.0, 3.0),
                    group_index: 0,
                    cluster_index: 0,
                    leaf_index: FlaggedU32::NULL,
                }],
            }],
            command_lists: vec![CommandList {
                name: TagString::new("patrol"),
                flags: 0,
                precomputed_bsp_index: NULL_INDEX,
                points: vec![CommandPoint {
                    position: Point3D::new(-1.0, 0.0, 0.5),
                    leaf_index: FlaggedU32::NULL,
                }],
            }],
            structure_bsps: vec![TagReference::new(
                TagClass::ScenarioStructureBsp,
                r"levels\test\wizard\wizard",
            )],
            ..Scenario::default()
        };

        let mut buffer = Vec::new();
        scenario.write(&mut buffer).unwrap();
        let read = Scenario::read(&mut Cursor::new(buffer.as_slice())).unwrap();
        assert_eq!(read.map_type, CacheFileType::Multiplayer);
        assert_eq!(read.skies.len(), 1);
        assert_eq!(read.encounters[0].firing_positions.len(), 1);
        assert_eq!(read.command_lists[0].points.len(), 1);
        assert_eq!(read.structure_bsps[0].path, r"levels\test\wizard\wizard");
    }

    #[test]
    fn references_cover_skies_resources_and_bsps() {
        let mut scenario = Scenario {
            skies: vec![TagReference::new(TagClass::Sky, r"sky\a")],
            resources: vec![TagReference::new(TagClass::Sound, r"sound\sfx\ui\ting")],
            structure_bsps: vec![TagReference::new(
                TagClass::ScenarioStructureBsp,
                r"levels\b",
            )],
            ..Scenario::default()
        };
        assert_eq!(scenario.references_mut().len(), 3);
    }
}
