//! Parsed tags, tag references, and the emit machinery that turns a parsed
//! tag into its engine-layout payload.
//!
//! A tag moves through two visible states: `Loaded` right after the on-disk
//! form is parsed (class and path are readable, payload is not), and
//! `Finalised` once its pre-compile hook has run. The resolver enforces the
//! ordering; see [`BuildWorkload`](`crate::build::BuildWorkload`).

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::common::errors::TagError;
use crate::common::extensions::ReaderExt;
use crate::map::CacheFileEngine;
use crate::types::class::{NULL_FOURCC, TagClass};
use crate::types::{Matrix3x3, Point3D, Quaternion, TagId, TagString};

pub mod bitmap;
pub mod bsp;
pub mod loader;
pub mod model;
pub mod scenario;
pub mod shader;
pub mod sound;
pub mod string_list;

use bitmap::Bitmap;
use bsp::StructureBsp;
use model::GbxModel;
use scenario::Scenario;
use shader::Shader;
use sound::Sound;
use string_list::StringList;

/// Wire size of a tag reference in engine layout: class, path address, path
/// length, id.
pub const REFERENCE_SIZE: usize = 16;

/// Wire size of a block field in engine layout: count, address, pad.
pub const BLOCK_SIZE: usize = 12;

#[derive(Clone, Debug, Default)]
/// A reference from one tag to another: class, virtual path, and the id
/// assigned once the target is resolved into the workload.
pub struct TagReference {
    pub class: Option<TagClass>,
    pub path: String,
    pub id: TagId,
}

impl TagReference {
    pub fn new(class: TagClass, path: &str) -> Self {
        Self {
            class: Some(class),
            path: String::from(path),
            id: TagId::NULL,
        }
    }

    /// True when nothing is referenced.
    pub fn is_empty(&self) -> bool {
        self.class.is_none() || self.path.is_empty()
    }

    /// Reads the on-disk form: four-cc (or null) and a length-prefixed
    /// path.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let fourcc = reader.read_u32::<LE>()?;
        let class = if fourcc == NULL_FOURCC {
            None
        } else {
            Some(TagClass::try_from(fourcc).map_err(TagError::UnknownClass)?)
        };
        let path = reader.read_prefixed_string()?;
        Ok(Self {
            class,
            path,
            id: TagId::NULL,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.class.map_or(NULL_FOURCC, TagClass::fourcc))?;
        writer.write_prefixed_string(&self.path)?;
        Ok(())
    }
}

use crate::common::extensions::WriterExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What a relocation writes once addresses are assigned.
pub enum RelocationTarget {
    /// The id of the tag at this workload index.
    TagId(u16),
    /// The virtual address of the path string of the tag at this index.
    TagPath(u16),
    /// The virtual address of this byte offset within the owning tag's own
    /// payload.
    Payload(u32),
    /// The file offset of the owning tag's asset blob with this index (or
    /// the blob's resource-map offset once externalised).
    Asset(usize),
}

#[derive(Clone, Copy, Debug)]
/// A deferred pointer write: at `offset` within the payload, store the
/// 32-bit value described by `target`.
pub struct Relocation {
    pub offset: u32,
    pub target: RelocationTarget,
}

#[derive(Clone, Debug)]
/// Raw asset bytes owned by a tag and appended to the cache file after the
/// tag-data section.
pub struct AssetBlob {
    pub data: Vec<u8>,
    /// Offset into the external resource map once the indexer externalises
    /// the blob; the data is dropped at that point.
    pub resource_offset: Option<u32>,
}

impl AssetBlob {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            resource_offset: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// A tag's engine-layout payload plus everything the assembler needs to
/// place it: relocation records and owned asset blobs.
pub struct TagPayload {
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub assets: Vec<AssetBlob>,
}

impl TagPayload {
    /// Total asset bytes still owned by this payload.
    pub fn asset_size(&self) -> usize {
        self.assets.iter().map(|blob| blob.data.len()).sum()
    }
}

#[derive(Clone, Copy, Debug)]
/// Handle to a block field written with [`Emitter::reserve_block`].
pub struct BlockStub(usize);

#[derive(Debug, Default)]
/// Accumulates a tag's engine-layout payload.
///
/// Block fields are written in two steps: [`reserve_block`](`Self::reserve_block`)
/// while the parent record is being laid down, then
/// [`commit_block`](`Self::commit_block`) immediately before the child
/// records are appended.
pub struct Emitter {
    data: Vec<u8>,
    relocations: Vec<Relocation>,
    assets: Vec<AssetBlob>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.data.write_u16::<LE>(value)?;
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.data.write_i16::<LE>(value)?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.data.write_u32::<LE>(value)?;
        Ok(())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.data.write_f32::<LE>(value)?;
        Ok(())
    }

    pub fn write_tag_string(&mut self, value: &TagString) -> Result<()> {
        value.write(&mut self.data)
    }

    pub fn write_point(&mut self, value: &Point3D) -> Result<()> {
        value.write(&mut self.data)
    }

    pub fn write_quaternion(&mut self, value: &Quaternion) -> Result<()> {
        value.write(&mut self.data)
    }

    pub fn write_matrix(&mut self, value: &Matrix3x3) -> Result<()> {
        value.write(&mut self.data)
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.data.write_all(value)?;
        Ok(())
    }

    pub fn pad(&mut self, count: usize) -> Result<()> {
        self.data.resize(self.data.len() + count, 0);
        Ok(())
    }

    /// Writes a zeroed 12-byte block field and returns a handle for
    /// [`commit_block`](`Self::commit_block`).
    pub fn reserve_block(&mut self) -> Result<BlockStub> {
        let stub = BlockStub(self.data.len());
        self.pad(BLOCK_SIZE)?;
        Ok(stub)
    }

    /// Points a reserved block field at the records about to be written.
    ///
    /// Call this right before appending the `count` child records; the
    /// block's address relocation targets the current payload offset. Empty
    /// blocks stay all-zero with no relocation.
    pub fn commit_block(&mut self, stub: BlockStub, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let children = self.offset();
        self.data[stub.0..stub.0 + 4].copy_from_slice(&(count as u32).to_le_bytes());
        self.relocations.push(Relocation {
            offset: (stub.0 + 4) as u32,
            target: RelocationTarget::Payload(children),
        });
        Ok(())
    }

    /// Writes a 16-byte engine tag reference: class, path address, path
    /// length, id. Unresolved references write null with no relocations.
    pub fn write_reference(&mut self, reference: &TagReference) -> Result<()> {
        self.write_u32(reference.class.map_or(NULL_FOURCC, TagClass::fourcc))?;
        match reference.id.index() {
            Some(index) => {
                self.relocations.push(Relocation {
                    offset: self.offset(),
                    target: RelocationTarget::TagPath(index),
                });
                self.write_u32(0)?;
                self.write_u32(reference.path.len() as u32)?;
                self.relocations.push(Relocation {
                    offset: self.offset(),
                    target: RelocationTarget::TagId(index),
                });
                reference.id.write(&mut self.data)?;
            }
            None => {
                self.write_u32(0)?;
                self.write_u32(0)?;
                TagId::NULL.write(&mut self.data)?;
            }
        }
        Ok(())
    }

    /// Records a relocation at an already-written offset.
    pub fn add_relocation(&mut self, offset: u32, target: RelocationTarget) {
        self.relocations.push(Relocation { offset, target });
    }

    /// Stages an asset blob and returns its index for
    /// [`write_asset_offset`](`Self::write_asset_offset`).
    pub fn add_asset(&mut self, data: Vec<u8>) -> usize {
        self.assets.push(AssetBlob::new(data));
        self.assets.len() - 1
    }

    /// Writes a 32-bit slot the assembler fills with the blob's final file
    /// offset.
    pub fn write_asset_offset(&mut self, asset: usize) -> Result<()> {
        self.relocations.push(Relocation {
            offset: self.offset(),
            target: RelocationTarget::Asset(asset),
        });
        self.write_u32(0)
    }

    pub fn finish(self) -> TagPayload {
        TagPayload {
            data: self.data,
            relocations: self.relocations,
            assets: self.assets,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// A tag whose class is pure schema-driven marshalling: an explicit
/// dependency table followed by an opaque payload.
pub struct RawTag {
    pub dependencies: Vec<TagReference>,
    pub payload: Vec<u8>,
}

impl RawTag {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u32::<LE>()?;
        let mut dependencies = Vec::with_capacity(count as usize);
        for _ in 0..count {
            dependencies.push(TagReference::read(reader)?);
        }
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        Ok(Self {
            dependencies,
            payload,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.dependencies.len() as u32)?;
        for dependency in &self.dependencies {
            dependency.write(writer)?;
        }
        writer.write_all(&self.payload)?;
        Ok(())
    }

    fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        for dependency in &self.dependencies {
            emitter.write_reference(dependency)?;
        }
        emitter.write_bytes(&self.payload)
    }
}

#[derive(Clone, Debug)]
/// The parsed form of a tag, dispatched by class.
pub enum TagData {
    Scenario(Scenario),
    Model(GbxModel),
    StructureBsp(StructureBsp),
    Shader(Shader),
    Bitmap(Bitmap),
    Sound(Sound),
    StringList(StringList),
    Raw(RawTag),
}

impl TagData {
    /// Decodes a tag file body by class.
    pub fn parse(class: TagClass, body: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(body);
        Ok(match class {
            TagClass::Scenario => Self::Scenario(Scenario::read(&mut reader)?),
            TagClass::GbxModel => Self::Model(GbxModel::read(&mut reader)?),
            TagClass::ScenarioStructureBsp => {
                Self::StructureBsp(StructureBsp::read(&mut reader)?)
            }
            TagClass::Bitmap => Self::Bitmap(Bitmap::read(&mut reader)?),
            TagClass::Sound => Self::Sound(Sound::read(&mut reader)?),
            TagClass::UnicodeStringList => Self::StringList(StringList::read(&mut reader)?),
            class if class.matches(TagClass::Shader) => {
                Self::Shader(Shader::read(class, &mut reader)?)
            }
            _ => Self::Raw(RawTag::read(&mut reader)?),
        })
    }

    /// Encodes the on-disk body, the inverse of [`parse`](`Self::parse`).
    pub fn write_body<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            Self::Scenario(scenario) => scenario.write(writer),
            Self::Model(model) => model.write(writer),
            Self::StructureBsp(bsp) => bsp.write(writer),
            Self::Shader(shader) => shader.write(writer),
            Self::Bitmap(bitmap) => bitmap.write(writer),
            Self::Sound(sound) => sound.write(writer),
            Self::StringList(list) => list.write(writer),
            Self::Raw(raw) => raw.write(writer),
        }
    }

    /// Every reference field in the tag, for the resolver to walk.
    pub fn references_mut(&mut self) -> Vec<&mut TagReference> {
        match self {
            Self::Scenario(scenario) => scenario.references_mut(),
            Self::Model(model) => model.references_mut(),
            Self::StructureBsp(bsp) => bsp.references_mut(),
            Self::Shader(shader) => shader.references_mut(),
            Self::Raw(raw) => raw.dependencies.iter_mut().collect(),
            Self::Bitmap(_) | Self::Sound(_) | Self::StringList(_) => Vec::new(),
        }
    }

    /// Runs the class's pre-compile hook, normalising the parsed form into
    /// engine conventions and feeding the workload's global accumulators.
    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        match self {
            Self::Scenario(scenario) => scenario.pre_compile(workload, tag_index),
            Self::Model(model) => model.pre_compile(workload, tag_index),
            Self::Shader(shader) => shader.pre_compile(workload, tag_index),
            Self::Bitmap(bitmap) => bitmap.pre_compile(workload, tag_index),
            Self::Sound(sound) => sound.pre_compile(workload, tag_index),
            Self::StructureBsp(_) | Self::StringList(_) | Self::Raw(_) => Ok(()),
        }
    }

    /// Produces the engine-layout payload with its relocations and asset
    /// blobs.
    pub fn emit(&self, _engine: CacheFileEngine) -> Result<TagPayload> {
        let mut emitter = Emitter::new();
        match self {
            Self::Scenario(scenario) => scenario.emit(&mut emitter)?,
            Self::Model(model) => model.emit(&mut emitter)?,
            Self::StructureBsp(bsp) => bsp.emit(&mut emitter)?,
            Self::Shader(shader) => shader.emit(&mut emitter)?,
            Self::Bitmap(bitmap) => bitmap.emit(&mut emitter)?,
            Self::Sound(sound) => sound.emit(&mut emitter)?,
            Self::StringList(list) => list.emit(&mut emitter)?,
            Self::Raw(raw) => raw.emit(&mut emitter)?,
        }
        Ok(emitter.finish())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Visible states of a compiled tag; payload reads are only valid once the
/// tag is finalised.
pub enum TagState {
    /// Parsed and present in the array; pre-compile has not run.
    Loaded,
    /// Pre-compile finished; the parsed form is frozen.
    Finalised,
}

#[derive(Clone, Debug)]
/// One entry of the workload's tag array.
pub struct CompiledTag {
    /// Virtual path, `\`-separated, no extension.
    pub path: String,
    pub class: TagClass,
    pub id: TagId,
    pub state: TagState,
    /// True when the payload lives in an external resource map.
    pub indexed: bool,
    /// Index into the resource map when [`indexed`](`Self::indexed`).
    pub resource_index: Option<u32>,
    pub data: TagData,
    /// Engine-layout payload, present once emit has run.
    pub payload: Option<TagPayload>,
    /// Virtual address assigned during assembly.
    pub base_address: u32,
}

impl CompiledTag {
    pub fn new(path: String, class: TagClass, id: TagId, data: TagData) -> Self {
        Self {
            path,
            class,
            id,
            state: TagState::Loaded,
            indexed: false,
            resource_index: None,
            data,
            payload: None,
            base_address: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_round_trip() {
        let reference = TagReference::new(TagClass::Bitmap, r"ui\shell\bitmaps\cursor");
        let mut buffer = Vec::new();
        reference.write(&mut buffer).unwrap();
        let read = TagReference::read(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(read.class, Some(TagClass::Bitmap));
        assert_eq!(read.path, r"ui\shell\bitmaps\cursor");
        assert!(read.id.is_null());
    }

    #[test]
    fn emitter_blocks_point_at_children() {
        let mut emitter = Emitter::new();
        let stub = emitter.reserve_block().unwrap();
        emitter.write_u32(0xAABB_CCDD).unwrap();
        emitter.commit_block(stub, 2).unwrap();
        emitter.write_u32(1).unwrap();
        emitter.write_u32(2).unwrap();

        let payload = emitter.finish();
        assert_eq!(
            u32::from_le_bytes(payload.data[0..4].try_into().unwrap()),
            2
        );
        assert_eq!(payload.relocations.len(), 1);
        assert_eq!(payload.relocations[0].offset, 4);
        assert_eq!(
            payload.relocations[0].target,
            RelocationTarget::Payload(16)
        );
    }

    #[test]
    fn emitter_empty_blocks_stay_zero() {
        let mut emitter = Emitter::new();
        let stub = emitter.reserve_block().unwrap();
        emitter.commit_block(stub, 0).unwrap();
        let payload = emitter.finish();
        assert_eq!(payload.data, vec![0u8; BLOCK_SIZE]);
        assert!(payload.relocations.is_empty());
    }

    #[test]
    fn emitted_references_are_16_bytes() {
        let mut resolved = TagReference::new(TagClass::Sound, r"sound\sfx\ui\ting");
        resolved.id = TagId::from_index(3);
        let mut emitter = Emitter::new();
        emitter.write_reference(&resolved).unwrap();
        let payload = emitter.finish();
        assert_eq!(payload.data.len(), REFERENCE_SIZE);
        assert_eq!(payload.relocations.len(), 2);
        assert_eq!(payload.relocations[0].target, RelocationTarget::TagPath(3));
        assert_eq!(payload.relocations[1].target, RelocationTarget::TagId(3));
        assert_eq!(
            u32::from_le_bytes(payload.data[12..16].try_into().unwrap()),
            TagId::from_index(3).bits()
        );
    }

    #[test]
    fn raw_tags_round_trip_dependencies_and_payload() {
        let raw = RawTag {
            dependencies: vec![TagReference::new(TagClass::GbxModel, r"weapons\pistol\pistol")],
            payload: vec![1, 2, 3, 4],
        };
        let mut buffer = Vec::new();
        raw.write(&mut buffer).unwrap();
        let read = RawTag::read(&mut Cursor::new(buffer.as_slice())).unwrap();
        assert_eq!(read.dependencies.len(), 1);
        assert_eq!(read.dependencies[0].path, r"weapons\pistol\pistol");
        assert_eq!(read.payload, vec![1, 2, 3, 4]);
    }
}
