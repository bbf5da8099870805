//! GBX model tags and their pre-compile pass: LOD cutoff swapping, marker
//! collation, node hierarchy baking, geometry deduplication into the
//! workload's global vertex/index pools, and the exodux checksum cascade.

use bitflags::bitflags;
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::Result;
use crate::build::BuildWorkload;
use crate::map::VERTEX_RECORD_SIZE;
use crate::tag::{Emitter, TagReference};
use crate::types::{Matrix3x3, NULL_INDEX, Point3D, Quaternion, TagString};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Per-part geometry flags.
    pub struct GeometryPartFlags: u32 {
        const STRIPPED_INTERNAL = 1 << 0;
        const ZONER = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// One uncompressed model vertex; 68 bytes in the model data section.
pub struct ModelVertex {
    pub position: Point3D,
    pub normal: Point3D,
    pub binormal: Point3D,
    pub tangent: Point3D,
    pub texture_coords: [f32; 2],
    pub node0_index: u16,
    pub node1_index: u16,
    pub node0_weight: f32,
    pub node1_weight: f32,
}

impl ModelVertex {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            position: Point3D::read(reader)?,
            normal: Point3D::read(reader)?,
            binormal: Point3D::read(reader)?,
            tangent: Point3D::read(reader)?,
            texture_coords: [reader.read_f32::<LE>()?, reader.read_f32::<LE>()?],
            node0_index: reader.read_u16::<LE>()?,
            node1_index: reader.read_u16::<LE>()?,
            node0_weight: reader.read_f32::<LE>()?,
            node1_weight: reader.read_f32::<LE>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.position.write(writer)?;
        self.normal.write(writer)?;
        self.binormal.write(writer)?;
        self.tangent.write(writer)?;
        writer.write_f32::<LE>(self.texture_coords[0])?;
        writer.write_f32::<LE>(self.texture_coords[1])?;
        writer.write_u16::<LE>(self.node0_index)?;
        writer.write_u16::<LE>(self.node1_index)?;
        writer.write_f32::<LE>(self.node0_weight)?;
        writer.write_f32::<LE>(self.node1_weight)?;
        Ok(())
    }

    /// The engine record: as on disk, except a null second node reads 0.
    fn record(&self) -> Result<[u8; VERTEX_RECORD_SIZE]> {
        let mut engine_form = *self;
        if engine_form.node1_index == NULL_INDEX {
            engine_form.node1_index = 0;
        }
        let mut buffer = [0u8; VERTEX_RECORD_SIZE];
        engine_form.write(&mut Cursor::new(&mut buffer[..]))?;
        Ok(buffer)
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// One triangle of a part's source-form triangle list.
pub struct ModelTriangle {
    pub vertex0_index: u16,
    pub vertex1_index: u16,
    pub vertex2_index: u16,
}

impl ModelTriangle {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            vertex0_index: reader.read_u16::<LE>()?,
            vertex1_index: reader.read_u16::<LE>()?,
            vertex2_index: reader.read_u16::<LE>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LE>(self.vertex0_index)?;
        writer.write_u16::<LE>(self.vertex1_index)?;
        writer.write_u16::<LE>(self.vertex2_index)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
/// One geometry part. The offset and sentinel fields are produced by
/// pre-compile and only meaningful afterwards.
pub struct ModelPart {
    pub flags: GeometryPartFlags,
    pub shader_index: u16,
    pub centroid_primary_node: u16,
    pub centroid_secondary_node: u16,
    pub centroid_primary_weight: f32,
    pub centroid_secondary_weight: f32,
    pub centroid: Point3D,
    pub exodux_checksum: u32,
    pub uncompressed_vertices: Vec<ModelVertex>,
    pub compressed_vertices: Vec<[u8; 32]>,
    pub triangles: Vec<ModelTriangle>,
    pub triangle_count: u32,
    pub triangle_offset: u32,
    pub triangle_offset_2: u32,
    pub vertex_count: u32,
    pub vertex_offset: u32,
    pub prev_filthy_part_index: i16,
    pub next_filthy_part_index: i16,
    pub do_not_crash_the_game: u32,
    pub do_not_screw_up_the_model: u32,
}

impl ModelPart {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut part = Self {
            flags: GeometryPartFlags::from_bits_truncate(reader.read_u32::<LE>()?),
            shader_index: reader.read_u16::<LE>()?,
            centroid_primary_node: reader.read_u16::<LE>()?,
            centroid_secondary_node: reader.read_u16::<LE>()?,
            centroid_primary_weight: {
                reader.read_u16::<LE>()?; // alignment slack in the source form
                reader.read_f32::<LE>()?
            },
            centroid_secondary_weight: reader.read_f32::<LE>()?,
            centroid: Point3D::read(reader)?,
            exodux_checksum: reader.read_u32::<LE>()?,
            ..Self::default()
        };
        let vertex_count = reader.read_u32::<LE>()?;
        for _ in 0..vertex_count {
            part.uncompressed_vertices.push(ModelVertex::read(reader)?);
        }
        let compressed_count = reader.read_u32::<LE>()?;
        for _ in 0..compressed_count {
            let mut record = [0u8; 32];
            reader.read_exact(&mut record)?;
            part.compressed_vertices.push(record);
        }
        let triangle_count = reader.read_u32::<LE>()?;
        for _ in 0..triangle_count {
            part.triangles.push(ModelTriangle::read(reader)?);
        }
        Ok(part)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.flags.bits())?;
        writer.write_u16::<LE>(self.shader_index)?;
        writer.write_u16::<LE>(self.centroid_primary_node)?;
        writer.write_u16::<LE>(self.centroid_secondary_node)?;
        writer.write_u16::<LE>(0)?;
        writer.write_f32::<LE>(self.centroid_primary_weight)?;
        writer.write_f32::<LE>(self.centroid_secondary_weight)?;
        self.centroid.write(writer)?;
        writer.write_u32::<LE>(self.exodux_checksum)?;
        writer.write_u32::<LE>(self.uncompressed_vertices.len() as u32)?;
        for vertex in &self.uncompressed_vertices {
            vertex.write(writer)?;
        }
        writer.write_u32::<LE>(self.compressed_vertices.len() as u32)?;
        for record in &self.compressed_vertices {
            writer.write_all(record)?;
        }
        writer.write_u32::<LE>(self.triangles.len() as u32)?;
        for triangle in &self.triangles {
            triangle.write(writer)?;
        }
        Ok(())
    }

    /// Flattens, validates, and deduplicates this part's geometry into the
    /// workload's global pools.
    fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        workload.model_part_count += 1;

        let mut indices = Vec::with_capacity(self.triangles.len() * 3);
        for triangle in &self.triangles {
            indices.push(triangle.vertex0_index);
            indices.push(triangle.vertex1_index);
            indices.push(triangle.vertex2_index);
        }

        // Strip excess null indices off the tail.
        loop {
            if indices.len() < 3 {
                return Err(workload.fatal(
                    tag_index,
                    format!("triangle index count is invalid ({} < 3)", indices.len()),
                ));
            }
            match indices.last() {
                Some(&NULL_INDEX) => indices.pop(),
                _ => break,
            };
        }

        // Each index past the first two closes another triangle.
        self.triangle_count = (indices.len() - 2) as u32;

        let vertex_count = self.uncompressed_vertices.len();
        for (position, index) in indices.iter().enumerate() {
            if usize::from(*index) >= vertex_count {
                return Err(workload.fatal(
                    tag_index,
                    format!(
                        "triangle index #{position} is invalid ({index} >= {vertex_count})"
                    ),
                ));
            }
        }

        self.triangle_offset = match find_record_run(&workload.model_indices, &indices) {
            Some(existing) => (existing * size_of::<u16>()) as u32,
            None => {
                let offset = workload.model_indices.len() * size_of::<u16>();
                workload.model_indices.extend_from_slice(&indices);
                offset as u32
            }
        };
        self.triangle_offset_2 = self.triangle_offset;

        self.vertex_count = vertex_count as u32;
        let mut records = Vec::with_capacity(vertex_count);
        for vertex in &self.uncompressed_vertices {
            records.push(vertex.record()?);
        }
        self.vertex_offset = match find_record_run(&workload.model_vertices, &records) {
            Some(existing) => (existing * VERTEX_RECORD_SIZE) as u32,
            None => {
                let offset = workload.model_vertices.len() * VERTEX_RECORD_SIZE;
                workload.model_vertices.extend_from_slice(&records);
                offset as u32
            }
        };

        self.prev_filthy_part_index = -1;
        self.next_filthy_part_index = -1;
        self.do_not_crash_the_game = 1;
        self.do_not_screw_up_the_model = 4;
        Ok(())
    }

    /// 76-byte engine record.
    fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u32(self.flags.bits())?;
        emitter.write_u16(self.shader_index)?;
        emitter.write_i16(self.prev_filthy_part_index)?;
        emitter.write_i16(self.next_filthy_part_index)?;
        emitter.write_u16(self.centroid_primary_node)?;
        emitter.write_u16(self.centroid_secondary_node)?;
        emitter.pad(2)?;
        emitter.write_f32(self.centroid_primary_weight)?;
        emitter.write_f32(self.centroid_secondary_weight)?;
        emitter.write_point(&self.centroid)?;
        emitter.write_u32(self.vertex_count)?;
        emitter.write_u32(self.vertex_offset)?;
        emitter.write_u32(self.compressed_vertices.len() as u32)?;
        emitter.write_u32(0)?;
        emitter.write_u32(self.triangle_count)?;
        emitter.write_u32(self.triangle_offset)?;
        emitter.write_u32(self.triangle_offset_2)?;
        emitter.write_u32(self.exodux_checksum)?;
        emitter.write_u32(self.do_not_crash_the_game)?;
        emitter.write_u32(self.do_not_screw_up_the_model)?;
        Ok(())
    }
}

/// Finds a byte-identical run of `needle` records inside `pool`, at record
/// granularity.
fn find_record_run<T: PartialEq>(pool: &[T], needle: &[T]) -> Option<usize> {
    if needle.is_empty() || pool.len() < needle.len() {
        return None;
    }
    pool.windows(needle.len()).position(|run| run == needle)
}

#[derive(Clone, Debug, Default)]
pub struct ModelGeometry {
    pub flags: u32,
    pub parts: Vec<ModelPart>,
}

#[derive(Clone, Debug, Default)]
/// A marker authored inside a region permutation.
pub struct PermutationMarker {
    pub name: TagString,
    pub node_index: u16,
    pub rotation: Quaternion,
    pub translation: Point3D,
}

#[derive(Clone, Debug, Default)]
/// One instance of a collated top-level marker.
pub struct ModelMarkerInstance {
    pub region_index: u8,
    pub permutation_index: u8,
    pub node_index: u16,
    pub translation: Point3D,
    pub rotation: Quaternion,
}

#[derive(Clone, Debug, Default)]
/// A top-level marker group, collated from all permutation markers that
/// share a name.
pub struct ModelMarker {
    pub name: TagString,
    pub instances: Vec<ModelMarkerInstance>,
}

#[derive(Clone, Debug, Default)]
pub struct ModelNode {
    pub name: TagString,
    pub next_sibling_node_index: u16,
    pub first_child_node_index: u16,
    pub parent_node_index: u16,
    pub default_translation: Point3D,
    pub default_rotation: Quaternion,
    pub node_distance_from_parent: f32,
    /// Baked by pre-compile.
    pub scale: f32,
    /// Baked by pre-compile.
    pub rotation: Matrix3x3,
    /// Baked by pre-compile.
    pub translation: Point3D,
}

#[derive(Clone, Debug, Default)]
pub struct ModelPermutation {
    pub name: TagString,
    pub flags: u32,
    /// Parsed out of a trailing `-N` name suffix by pre-compile.
    pub permutation_number: u16,
    pub super_low_geometry_index: u16,
    pub low_geometry_index: u16,
    pub medium_geometry_index: u16,
    pub high_geometry_index: u16,
    pub super_high_geometry_index: u16,
    pub markers: Vec<PermutationMarker>,
}

#[derive(Clone, Debug, Default)]
pub struct ModelRegion {
    pub name: TagString,
    pub permutations: Vec<ModelPermutation>,
}

#[derive(Clone, Debug, Default)]
pub struct ModelShaderReference {
    pub shader: TagReference,
    pub permutation: u16,
}

#[derive(Clone, Debug, Default)]
/// A GBX model tag.
pub struct GbxModel {
    pub flags: u32,
    pub node_list_checksum: u32,
    pub super_low_detail_cutoff: f32,
    pub low_detail_cutoff: f32,
    pub high_detail_cutoff: f32,
    pub super_high_detail_cutoff: f32,
    pub base_map_u_scale: f32,
    pub base_map_v_scale: f32,
    pub markers: Vec<ModelMarker>,
    pub nodes: Vec<ModelNode>,
    pub regions: Vec<ModelRegion>,
    pub geometries: Vec<ModelGeometry>,
    pub shaders: Vec<ModelShaderReference>,
}

impl GbxModel {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut model = Self {
            flags: reader.read_u32::<LE>()?,
            node_list_checksum: reader.read_u32::<LE>()?,
            super_low_detail_cutoff: reader.read_f32::<LE>()?,
            low_detail_cutoff: reader.read_f32::<LE>()?,
            high_detail_cutoff: reader.read_f32::<LE>()?,
            super_high_detail_cutoff: reader.read_f32::<LE>()?,
            base_map_u_scale: reader.read_f32::<LE>()?,
            base_map_v_scale: reader.read_f32::<LE>()?,
            ..Self::default()
        };
        let marker_count = reader.read_u32::<LE>()?;
        for _ in 0..marker_count {
            let name = TagString::read(reader)?;
            let instance_count = reader.read_u32::<LE>()?;
            let mut instances = Vec::with_capacity(instance_count as usize);
            for _ in 0..instance_count {
                instances.push(ModelMarkerInstance {
                    region_index: reader.read_u8()?,
                    permutation_index: reader.read_u8()?,
                    node_index: reader.read_u16::<LE>()?,
                    translation: Point3D::read(reader)?,
                    rotation: Quaternion::read(reader)?,
                });
            }
            model.markers.push(ModelMarker { name, instances });
        }
        let node_count = reader.read_u32::<LE>()?;
        for _ in 0..node_count {
            model.nodes.push(ModelNode {
                name: TagString::read(reader)?,
                next_sibling_node_index: reader.read_u16::<LE>()?,
                first_child_node_index: reader.read_u16::<LE>()?,
                parent_node_index: reader.read_u16::<LE>()?,
                default_translation: {
                    reader.read_u16::<LE>()?;
                    Point3D::read(reader)?
                },
                default_rotation: Quaternion::read(reader)?,
                node_distance_from_parent: reader.read_f32::<LE>()?,
                scale: 0.0,
                rotation: Matrix3x3::IDENTITY,
                translation: Point3D::ZERO,
            });
        }
        let region_count = reader.read_u32::<LE>()?;
        for _ in 0..region_count {
            let name = TagString::read(reader)?;
            let permutation_count = reader.read_u32::<LE>()?;
            let mut permutations = Vec::with_capacity(permutation_count as usize);
            for _ in 0..permutation_count {
                let mut permutation = ModelPermutation {
                    name: TagString::read(reader)?,
                    flags: reader.read_u32::<LE>()?,
                    super_low_geometry_index: reader.read_u16::<LE>()?,
                    low_geometry_index: reader.read_u16::<LE>()?,
                    medium_geometry_index: reader.read_u16::<LE>()?,
                    high_geometry_index: reader.read_u16::<LE>()?,
                    super_high_geometry_index: reader.read_u16::<LE>()?,
                    ..ModelPermutation::default()
                };
                reader.read_u16::<LE>()?;
                let marker_count = reader.read_u32::<LE>()?;
                for _ in 0..marker_count {
                    permutation.markers.push(PermutationMarker {
                        name: TagString::read(reader)?,
                        node_index: reader.read_u16::<LE>()?,
                        rotation: {
                            reader.read_u16::<LE>()?;
                            Quaternion::read(reader)?
                        },
                        translation: Point3D::read(reader)?,
                    });
                }
                permutations.push(permutation);
            }
            model.regions.push(ModelRegion { name, permutations });
        }
        let geometry_count = reader.read_u32::<LE>()?;
        for _ in 0..geometry_count {
            let flags = reader.read_u32::<LE>()?;
            let part_count = reader.read_u32::<LE>()?;
            let mut parts = Vec::with_capacity(part_count as usize);
            for _ in 0..part_count {
                parts.push(ModelPart::read(reader)?);
            }
            model.geometries.push(ModelGeometry { flags, parts });
        }
        let shader_count = reader.read_u32::<LE>()?;
        for _ in 0..shader_count {
            let shader = TagReference::read(reader)?;
            let permutation = reader.read_u16::<LE>()?;
            model.shaders.push(ModelShaderReference {
                shader,
                permutation,
            });
        }
        Ok(model)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.flags)?;
        writer.write_u32::<LE>(self.node_list_checksum)?;
        writer.write_f32::<LE>(self.super_low_detail_cutoff)?;
        writer.write_f32::<LE>(self.low_detail_cutoff)?;
        writer.write_f32::<LE>(self.high_detail_cutoff)?;
        writer.write_f32::<LE>(self.super_high_detail_cutoff)?;
        writer.write_f32::<LE>(self.base_map_u_scale)?;
        writer.write_f32::<LE>(self.base_map_v_scale)?;
        writer.write_u32::<LE>(self.markers.len() as u32)?;
        for marker in &self.markers {
            marker.name.write(writer)?;
            writer.write_u32::<LE>(marker.instances.len() as u32)?;
            for instance in &marker.instances {
                writer.write_u8(instance.region_index)?;
                writer.write_u8(instance.permutation_index)?;
                writer.write_u16::<LE>(instance.node_index)?;
                instance.translation.write(writer)?;
                instance.rotation.write(writer)?;
            }
        }
        writer.write_u32::<LE>(self.nodes.len() as u32)?;
        for node in &self.nodes {
            node.name.write(writer)?;
            writer.write_u16::<LE>(node.next_sibling_node_index)?;
            writer.write_u16::<LE>(node.first_child_node_index)?;
            writer.write_u16::<LE>(node.parent_node_index)?;
            writer.write_u16::<LE>(0)?;
            node.default_translation.write(writer)?;
            node.default_rotation.write(writer)?;
            writer.write_f32::<LE>(node.node_distance_from_parent)?;
        }
        writer.write_u32::<LE>(self.regions.len() as u32)?;
        for region in &self.regions {
            region.name.write(writer)?;
            writer.write_u32::<LE>(region.permutations.len() as u32)?;
            for permutation in &region.permutations {
                permutation.name.write(writer)?;
                writer.write_u32::<LE>(permutation.flags)?;
                writer.write_u16::<LE>(permutation.super_low_geometry_index)?;
                writer.write_u16::<LE>(permutation.low_geometry_index)?;
                writer.write_u16::<LE>(permutation.medium_geometry_index)?;
                writer.write_u16::<LE>(permutation.high_geometry_index)?;
                writer.write_u16::<LE>(permutation.super_high_geometry_index)?;
                writer.write_u16::<LE>(0)?;
                writer.write_u32::<LE>(permutation.markers.len() as u32)?;
                for marker in &permutation.markers {
                    marker.name.write(writer)?;
                    writer.write_u16::<LE>(marker.node_index)?;
                    writer.write_u16::<LE>(0)?;
                    marker.rotation.write(writer)?;
                    marker.translation.write(writer)?;
                }
            }
        }
        writer.write_u32::<LE>(self.geometries.len() as u32)?;
        for geometry in &self.geometries {
            writer.write_u32::<LE>(geometry.flags)?;
            writer.write_u32::<LE>(geometry.parts.len() as u32)?;
            for part in &geometry.parts {
                part.write(writer)?;
            }
        }
        writer.write_u32::<LE>(self.shaders.len() as u32)?;
        for shader in &self.shaders {
            shader.shader.write(writer)?;
            writer.write_u16::<LE>(shader.permutation)?;
        }
        Ok(())
    }

    pub fn references_mut(&mut self) -> Vec<&mut TagReference> {
        self.shaders
            .iter_mut()
            .map(|shader| &mut shader.shader)
            .collect()
    }

    pub fn pre_compile(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        // Compressed vertices must either mirror the uncompressed set or be
        // absent entirely.
        'check: for geometry in &self.geometries {
            for part in &geometry.parts {
                let compressed = part.compressed_vertices.len();
                let uncompressed = part.uncompressed_vertices.len();
                if compressed != uncompressed && compressed != 0 {
                    workload.warn(
                        tag_index,
                        format!(
                            "compressed vertex count ({compressed}) is not equal to uncompressed ({uncompressed}); rebuild the model tag"
                        ),
                    );
                    break 'check;
                }
            }
        }

        // The source convention stores the cutoffs in the opposite pairing
        // to what the engine samples.
        std::mem::swap(
            &mut self.super_low_detail_cutoff,
            &mut self.super_high_detail_cutoff,
        );
        std::mem::swap(&mut self.low_detail_cutoff, &mut self.high_detail_cutoff);

        if !self.markers.is_empty() {
            workload.warn(
                tag_index,
                String::from(
                    "markers array is populated, but this array should be empty; rebuild the model tag",
                ),
            );
        }

        self.collate_markers();
        self.bake_nodes(workload, tag_index)?;

        for geometry in &mut self.geometries {
            for part in &mut geometry.parts {
                part.pre_compile(workload, tag_index)?;
            }
        }

        // Exodux checksum cascade over all parts, in order, continuing the
        // workload-lifetime register state.
        for geometry in &mut self.geometries {
            for part in &mut geometry.parts {
                let zoner = part.flags.contains(GeometryPartFlags::ZONER);
                let mut value = part.exodux_checksum & u32::from(zoner);
                if workload.exodux_handler {
                    // Remodulate the upper half before mixing the rainbow
                    // constants.
                    value <<= 16;
                    value ^= if workload.exodux_parser {
                        0x2D1E_6921
                    } else {
                        0x291E_7021
                    };
                    workload.exodux_parser = !workload.exodux_parser;
                } else {
                    value ^= 0x3C17_0A5E;
                }
                if !zoner {
                    value ^= 1;
                }
                workload.exodux_handler = !workload.exodux_handler;
                part.exodux_checksum = value.swap_bytes();
            }
        }

        for region in &mut self.regions {
            for permutation in &mut region.permutations {
                let number = parse_permutation_suffix(permutation.name.as_str());
                permutation.permutation_number = match number {
                    Some(number) if number < u32::from(NULL_INDEX) => number as u16,
                    Some(number) => {
                        workload.warn(
                            tag_index,
                            format!(
                                "permutation {} has an index that is out of range ({number} >= {NULL_INDEX})",
                                permutation.name
                            ),
                        );
                        0
                    }
                    None => 0,
                };
            }
        }

        Ok(())
    }

    /// Moves every region permutation marker into the top-level marker
    /// array, grouping by name with alphabetical insertion.
    fn collate_markers(&mut self) {
        for (region_index, region) in self.regions.iter().enumerate() {
            for (permutation_index, permutation) in region.permutations.iter().enumerate() {
                for marker in &permutation.markers {
                    let instance = ModelMarkerInstance {
                        region_index: region_index as u8,
                        permutation_index: permutation_index as u8,
                        node_index: marker.node_index,
                        translation: marker.translation,
                        rotation: marker.rotation,
                    };
                    let existing = self
                        .markers
                        .iter()
                        .position(|group| group.name == marker.name);
                    match existing {
                        Some(index) => self.markers[index].instances.push(instance),
                        None => {
                            let group = ModelMarker {
                                name: marker.name.clone(),
                                instances: vec![instance],
                            };
                            let position = self
                                .markers
                                .iter()
                                .position(|existing| existing.name > group.name)
                                .unwrap_or(self.markers.len());
                            self.markers.insert(position, group);
                        }
                    }
                }
            }
        }
    }

    /// Bakes absolute node frames from the default rotations and
    /// translations, walking children and siblings from node 0.
    fn bake_nodes(&mut self, workload: &mut BuildWorkload, tag_index: usize) -> Result<()> {
        let node_count = self.nodes.len();
        if node_count == 0 {
            return Ok(());
        }
        let mut done = vec![false; node_count];
        let mut stack = vec![(0u16, Matrix3x3::IDENTITY, Point3D::ZERO)];

        while let Some((node_index, base_rotation, base_translation)) = stack.pop() {
            if node_index == NULL_INDEX || done[usize::from(node_index)] {
                continue;
            }
            done[usize::from(node_index)] = true;

            let node = &mut self.nodes[usize::from(node_index)];
            node.scale = 1.0;

            let node_rotation = node.default_rotation.to_matrix();
            let total_rotation = base_rotation.multiply(&node_rotation);
            node.rotation = total_rotation;

            let offset = base_translation.sub(&node.default_translation);
            node.translation = base_rotation.rotate(&offset);

            let next_sibling = node.next_sibling_node_index;
            let first_child = node.first_child_node_index;
            let total_translation = node.translation;

            let mut fatal = false;
            if next_sibling != NULL_INDEX && usize::from(next_sibling) >= node_count {
                workload.warn(
                    tag_index,
                    format!(
                        "next sibling node index of node {node_index} is invalid ({next_sibling} >= {node_count})"
                    ),
                );
                fatal = true;
            }
            if first_child != NULL_INDEX && usize::from(first_child) >= node_count {
                workload.warn(
                    tag_index,
                    format!(
                        "first child node index of node {node_index} is invalid ({first_child} >= {node_count})"
                    ),
                );
                fatal = true;
            }
            if fatal {
                return Err(workload.fatal(tag_index, String::from("node hierarchy is invalid")));
            }

            stack.push((next_sibling, base_rotation, base_translation));
            stack.push((first_child, total_rotation, total_translation));
        }
        Ok(())
    }

    /// 92-byte engine main struct plus depth-first child records.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_u32(self.flags)?;
        emitter.write_u32(self.node_list_checksum)?;
        emitter.write_f32(self.super_low_detail_cutoff)?;
        emitter.write_f32(self.low_detail_cutoff)?;
        emitter.write_f32(self.high_detail_cutoff)?;
        emitter.write_f32(self.super_high_detail_cutoff)?;
        emitter.write_f32(self.base_map_u_scale)?;
        emitter.write_f32(self.base_map_v_scale)?;
        let markers_stub = emitter.reserve_block()?;
        let nodes_stub = emitter.reserve_block()?;
        let regions_stub = emitter.reserve_block()?;
        let geometries_stub = emitter.reserve_block()?;
        let shaders_stub = emitter.reserve_block()?;

        emitter.commit_block(markers_stub, self.markers.len())?;
        let mut instance_stubs = Vec::with_capacity(self.markers.len());
        for marker in &self.markers {
            emitter.write_tag_string(&marker.name)?;
            emitter.pad(4)?;
            instance_stubs.push(emitter.reserve_block()?);
        }
        for (marker, stub) in self.markers.iter().zip(instance_stubs) {
            emitter.commit_block(stub, marker.instances.len())?;
            for instance in &marker.instances {
                emitter.write_bytes(&[instance.region_index, instance.permutation_index])?;
                emitter.write_u16(instance.node_index)?;
                emitter.write_point(&instance.translation)?;
                emitter.write_quaternion(&instance.rotation)?;
            }
        }

        emitter.commit_block(nodes_stub, self.nodes.len())?;
        for node in &self.nodes {
            emitter.write_tag_string(&node.name)?;
            emitter.write_u16(node.next_sibling_node_index)?;
            emitter.write_u16(node.first_child_node_index)?;
            emitter.write_u16(node.parent_node_index)?;
            emitter.pad(2)?;
            emitter.write_point(&node.default_translation)?;
            emitter.write_quaternion(&node.default_rotation)?;
            emitter.write_f32(node.node_distance_from_parent)?;
            emitter.write_f32(node.scale)?;
            emitter.write_matrix(&node.rotation)?;
            emitter.write_point(&node.translation)?;
            emitter.pad(4)?;
        }

        emitter.commit_block(regions_stub, self.regions.len())?;
        let mut permutation_stubs = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            emitter.write_tag_string(&region.name)?;
            emitter.pad(4)?;
            permutation_stubs.push(emitter.reserve_block()?);
        }
        for (region, stub) in self.regions.iter().zip(permutation_stubs) {
            emitter.commit_block(stub, region.permutations.len())?;
            let mut marker_stubs = Vec::with_capacity(region.permutations.len());
            for permutation in &region.permutations {
                emitter.write_tag_string(&permutation.name)?;
                emitter.write_u32(permutation.flags)?;
                emitter.write_u16(permutation.permutation_number)?;
                emitter.pad(2)?;
                emitter.write_u16(permutation.super_low_geometry_index)?;
                emitter.write_u16(permutation.low_geometry_index)?;
                emitter.write_u16(permutation.medium_geometry_index)?;
                emitter.write_u16(permutation.high_geometry_index)?;
                emitter.write_u16(permutation.super_high_geometry_index)?;
                emitter.pad(2)?;
                marker_stubs.push(emitter.reserve_block()?);
            }
            for (permutation, marker_stub) in region.permutations.iter().zip(marker_stubs) {
                emitter.commit_block(marker_stub, permutation.markers.len())?;
                for marker in &permutation.markers {
                    emitter.write_tag_string(&marker.name)?;
                    emitter.write_u16(marker.node_index)?;
                    emitter.pad(2)?;
                    emitter.write_quaternion(&marker.rotation)?;
                    emitter.write_point(&marker.translation)?;
                }
            }
        }

        emitter.commit_block(geometries_stub, self.geometries.len())?;
        let mut part_stubs = Vec::with_capacity(self.geometries.len());
        for geometry in &self.geometries {
            emitter.write_u32(geometry.flags)?;
            part_stubs.push(emitter.reserve_block()?);
        }
        for (geometry, stub) in self.geometries.iter().zip(part_stubs) {
            emitter.commit_block(stub, geometry.parts.len())?;
            for part in &geometry.parts {
                part.emit(emitter)?;
            }
        }

        emitter.commit_block(shaders_stub, self.shaders.len())?;
        for shader in &self.shaders {
            emitter.write_reference(&shader.shader)?;
            emitter.write_u16(shader.permutation)?;
            emitter.pad(14)?;
        }
        Ok(())
    }
}

/// Parses a decimal number off a trailing `-N` in a permutation name.
/// Non-numeric suffixes are not permutation numbers at all; oversized ones
/// saturate so the caller can warn about them.
fn parse_permutation_suffix(name: &str) -> Option<u32> {
    let suffix = &name[name.rfind('-')? + 1..];
    if suffix.is_empty() {
        return None;
    }
    let number = suffix.parse::<u64>().ok()?;
    Some(u32::try_from(number).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildParameters, BuildWorkload};

    fn test_workload() -> BuildWorkload {
        BuildWorkload::new(BuildParameters::default())
    }

    fn flat_vertex(seed: f32) -> ModelVertex {
        ModelVertex {
            position: Point3D::new(seed, seed * 2.0, seed * 3.0),
            normal: Point3D::new(0.0, 0.0, 1.0),
            node1_index: NULL_INDEX,
            node0_weight: 1.0,
            ..ModelVertex::default()
        }
    }

    fn part_with_geometry(vertex_count: u16, triangle_count: u16) -> ModelPart {
        ModelPart {
            uncompressed_vertices: (0..vertex_count)
                .map(|i| flat_vertex(f32::from(i)))
                .collect(),
            triangles: (0..triangle_count)
                .map(|i| ModelTriangle {
                    vertex0_index: i % vertex_count,
                    vertex1_index: (i + 1) % vertex_count,
                    vertex2_index: (i + 2) % vertex_count,
                })
                .collect(),
            ..ModelPart::default()
        }
    }

    fn model_with_parts(parts: Vec<ModelPart>) -> GbxModel {
        GbxModel {
            super_low_detail_cutoff: 1.0,
            low_detail_cutoff: 2.0,
            high_detail_cutoff: 3.0,
            super_high_detail_cutoff: 4.0,
            nodes: vec![ModelNode {
                name: TagString::new("frame root"),
                next_sibling_node_index: NULL_INDEX,
                first_child_node_index: NULL_INDEX,
                parent_node_index: NULL_INDEX,
                ..ModelNode::default()
            }],
            geometries: vec![ModelGeometry {
                flags: 0,
                parts,
            }],
            ..GbxModel::default()
        }
    }

    #[test]
    fn exodux_first_part_vector() {
        let mut part = part_with_geometry(3, 1);
        part.flags = GeometryPartFlags::ZONER;
        part.exodux_checksum = 0;
        let mut model = model_with_parts(vec![part]);

        let mut workload = test_workload();
        assert!(!workload.exodux_handler);
        assert!(!workload.exodux_parser);
        model.pre_compile(&mut workload, 0).unwrap();

        assert_eq!(model.geometries[0].parts[0].exodux_checksum, 0x5E0A_173C);
        assert!(workload.exodux_handler);
    }

    #[test]
    fn lod_cutoffs_are_swapped_pairwise() {
        let mut model = model_with_parts(vec![part_with_geometry(3, 1)]);
        model.super_low_detail_cutoff = 4.0;
        model.low_detail_cutoff = 3.0;
        model.high_detail_cutoff = 2.0;
        model.super_high_detail_cutoff = 1.0;

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();

        assert_eq!(model.super_low_detail_cutoff, 1.0);
        assert_eq!(model.low_detail_cutoff, 2.0);
        assert_eq!(model.high_detail_cutoff, 3.0);
        assert_eq!(model.super_high_detail_cutoff, 4.0);
        assert!(model.super_low_detail_cutoff <= model.low_detail_cutoff);
        assert!(model.low_detail_cutoff <= model.high_detail_cutoff);
        assert!(model.high_detail_cutoff <= model.super_high_detail_cutoff);
    }

    #[test]
    fn identical_parts_share_pool_offsets() {
        let mut first = model_with_parts(vec![part_with_geometry(42, 20)]);
        let mut second = model_with_parts(vec![part_with_geometry(42, 20)]);

        let mut workload = test_workload();
        first.pre_compile(&mut workload, 0).unwrap();
        second.pre_compile(&mut workload, 1).unwrap();

        let part_a = &first.geometries[0].parts[0];
        let part_b = &second.geometries[0].parts[0];
        assert_eq!(part_a.vertex_offset, part_b.vertex_offset);
        assert_eq!(part_a.triangle_offset, part_b.triangle_offset);
        assert_eq!(part_a.triangle_offset_2, part_b.triangle_offset);
        assert_eq!(part_a.triangle_count, 58);
        assert_eq!(
            workload.model_vertices.len() * VERTEX_RECORD_SIZE,
            42 * VERTEX_RECORD_SIZE
        );
        assert_eq!(workload.model_part_count, 2);
    }

    #[test]
    fn distinct_parts_append_to_the_pools() {
        let mut first = model_with_parts(vec![part_with_geometry(4, 2)]);
        let mut second = model_with_parts(vec![part_with_geometry(5, 3)]);

        let mut workload = test_workload();
        first.pre_compile(&mut workload, 0).unwrap();
        second.pre_compile(&mut workload, 1).unwrap();

        let part_b = &second.geometries[0].parts[0];
        assert_eq!(part_b.vertex_offset as usize, 4 * VERTEX_RECORD_SIZE);
        assert_eq!(workload.model_vertices.len(), 9);
    }

    #[test]
    fn trailing_null_indices_are_stripped() {
        let mut part = part_with_geometry(4, 2);
        part.triangles.push(ModelTriangle {
            vertex0_index: NULL_INDEX,
            vertex1_index: NULL_INDEX,
            vertex2_index: NULL_INDEX,
        });
        let mut model = model_with_parts(vec![part]);

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();
        // 6 real indices survive; each one past the first two is a triangle.
        assert_eq!(model.geometries[0].parts[0].triangle_count, 4);
        assert_eq!(workload.model_indices.len(), 6);
    }

    #[test]
    fn out_of_range_triangle_index_is_fatal() {
        let mut part = part_with_geometry(3, 1);
        part.triangles[0].vertex2_index = 9;
        let mut model = model_with_parts(vec![part]);

        let mut workload = test_workload();
        assert!(model.pre_compile(&mut workload, 0).is_err());
    }

    #[test]
    fn bad_node_hierarchy_is_fatal() {
        let mut model = model_with_parts(vec![part_with_geometry(3, 1)]);
        model.nodes[0].first_child_node_index = 40;

        let mut workload = test_workload();
        assert!(model.pre_compile(&mut workload, 0).is_err());
    }

    #[test]
    fn node_baking_composes_parent_frames() {
        let mut model = model_with_parts(vec![part_with_geometry(3, 1)]);
        model.nodes[0].first_child_node_index = 1;
        model.nodes.push(ModelNode {
            name: TagString::new("frame child"),
            next_sibling_node_index: NULL_INDEX,
            first_child_node_index: NULL_INDEX,
            parent_node_index: 0,
            default_translation: Point3D::new(1.0, 0.0, 0.0),
            ..ModelNode::default()
        });

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();

        let child = &model.nodes[1];
        assert_eq!(child.scale, 1.0);
        assert_eq!(child.rotation, Matrix3x3::IDENTITY);
        // Identity parent frame: translation is the negated default offset
        // rotated by identity.
        assert_eq!(child.translation, Point3D::new(-1.0, 0.0, 0.0));
    }

    #[test]
    fn markers_collate_alphabetically() {
        let mut model = model_with_parts(vec![part_with_geometry(3, 1)]);
        model.regions = vec![ModelRegion {
            name: TagString::new("body"),
            permutations: vec![ModelPermutation {
                name: TagString::new("base"),
                markers: vec![
                    PermutationMarker {
                        name: TagString::new("trigger"),
                        node_index: 0,
                        ..PermutationMarker::default()
                    },
                    PermutationMarker {
                        name: TagString::new("grip"),
                        node_index: 0,
                        ..PermutationMarker::default()
                    },
                    PermutationMarker {
                        name: TagString::new("trigger"),
                        node_index: 0,
                        ..PermutationMarker::default()
                    },
                ],
                ..ModelPermutation::default()
            }],
        }];

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();

        assert_eq!(model.markers.len(), 2);
        assert_eq!(model.markers[0].name.as_str(), "grip");
        assert_eq!(model.markers[1].name.as_str(), "trigger");
        assert_eq!(model.markers[1].instances.len(), 2);
    }

    #[test]
    fn permutation_suffix_parses_and_saturates() {
        let mut model = model_with_parts(vec![part_with_geometry(3, 1)]);
        model.regions = vec![ModelRegion {
            name: TagString::new("body"),
            permutations: vec![
                ModelPermutation {
                    name: TagString::new("damaged-7"),
                    ..ModelPermutation::default()
                },
                ModelPermutation {
                    name: TagString::new("base"),
                    ..ModelPermutation::default()
                },
                ModelPermutation {
                    name: TagString::new("worn-99999999"),
                    ..ModelPermutation::default()
                },
            ],
        }];

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();

        let permutations = &model.regions[0].permutations;
        assert_eq!(permutations[0].permutation_number, 7);
        assert_eq!(permutations[1].permutation_number, 0);
        assert_eq!(permutations[2].permutation_number, 0);
        assert!(!workload.reports().is_empty());
    }

    #[test]
    fn source_form_round_trips() {
        let mut model = model_with_parts(vec![part_with_geometry(4, 2)]);
        model.shaders.push(ModelShaderReference {
            shader: TagReference::new(
                crate::types::class::TagClass::ShaderModel,
                r"weapons\pistol\shaders\pistol",
            ),
            permutation: 1,
        });

        let mut buffer = Vec::new();
        model.write(&mut buffer).unwrap();
        let read = GbxModel::read(&mut Cursor::new(buffer.as_slice())).unwrap();
        assert_eq!(read.nodes.len(), 1);
        assert_eq!(read.geometries[0].parts[0].uncompressed_vertices.len(), 4);
        assert_eq!(read.shaders[0].shader.path, r"weapons\pistol\shaders\pistol");
        assert_eq!(read.shaders[0].permutation, 1);
    }

    #[test]
    fn mismatched_compressed_count_warns() {
        let mut part = part_with_geometry(3, 1);
        part.compressed_vertices = vec![[0u8; 32]; 2];
        let mut model = model_with_parts(vec![part]);

        let mut workload = test_workload();
        model.pre_compile(&mut workload, 0).unwrap();
        assert!(
            workload
                .reports()
                .iter()
                .any(|report| report.message.contains("compressed vertex count"))
        );
    }

    #[test]
    fn part_engine_record_is_76_bytes() {
        let mut workload = test_workload();
        let mut part = part_with_geometry(3, 1);
        part.pre_compile(&mut workload, 0).unwrap();
        let mut emitter = Emitter::new();
        part.emit(&mut emitter).unwrap();
        assert_eq!(emitter.finish().data.len(), 76);
    }
}
