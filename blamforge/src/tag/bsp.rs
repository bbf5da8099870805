//! Scenario structure BSP tags: the plane/node/leaf arrays the engine walks
//! at runtime, and the point-in-leaf and segment-clip queries the scenario
//! fixups run at build time.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;
use crate::tag::{Emitter, TagReference};
use crate::types::{FlaggedU32, Point3D};

#[derive(Clone, Copy, Debug, Default)]
/// Plane in `p · normal = d` form; 16 bytes.
pub struct Plane3D {
    pub normal: Point3D,
    pub d: f32,
}

impl Plane3D {
    /// Signed distance of `point` from the plane.
    pub fn distance(&self, point: &Point3D) -> f32 {
        point.dot(&self.normal) - self.d
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            normal: Point3D::read(reader)?,
            d: reader.read_f32::<LE>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.normal.write(writer)?;
        writer.write_f32::<LE>(self.d)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// Interior BSP node; children are flagged ints (flag set = leaf index,
/// all-ones = solid space).
pub struct BspNode {
    pub plane: u32,
    pub back_child: FlaggedU32,
    pub front_child: FlaggedU32,
}

#[derive(Clone, Copy, Debug, Default)]
/// A convex region of the structure.
pub struct BspLeaf {
    pub cluster: u16,
    pub first_surface: u32,
    pub surface_count: u32,
}

#[derive(Clone, Copy, Debug, Default)]
/// One collision surface triangle.
pub struct BspSurface {
    pub vertex0_index: u16,
    pub vertex1_index: u16,
    pub vertex2_index: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Result of a segment-versus-BSP query.
pub struct SegmentHit {
    /// Where the segment crosses into solid space.
    pub position: Point3D,
    /// Plane index of the splitting node at the crossing.
    pub surface: u32,
    /// Leaf containing the near fragment, when one was seen.
    pub leaf: Option<u32>,
}

enum Clip {
    /// No boundary crossed; payload is the last leaf the segment touched.
    Open(Option<u32>),
    Hit(SegmentHit),
    /// The queried fragment starts inside solid space.
    Solid,
}

#[derive(Clone, Debug, Default)]
/// A scenario structure BSP tag.
pub struct StructureBsp {
    pub lightmaps_bitmap: TagReference,
    pub planes: Vec<Plane3D>,
    pub nodes: Vec<BspNode>,
    pub leaves: Vec<BspLeaf>,
    pub surfaces: Vec<BspSurface>,
}

impl StructureBsp {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let lightmaps_bitmap = TagReference::read(reader)?;
        let mut bsp = Self {
            lightmaps_bitmap,
            ..Self::default()
        };
        let plane_count = reader.read_u32::<LE>()?;
        for _ in 0..plane_count {
            bsp.planes.push(Plane3D::read(reader)?);
        }
        let node_count = reader.read_u32::<LE>()?;
        for _ in 0..node_count {
            bsp.nodes.push(BspNode {
                plane: reader.read_u32::<LE>()?,
                back_child: FlaggedU32::read(reader)?,
                front_child: FlaggedU32::read(reader)?,
            });
        }
        let leaf_count = reader.read_u32::<LE>()?;
        for _ in 0..leaf_count {
            bsp.leaves.push(BspLeaf {
                cluster: {
                    let cluster = reader.read_u16::<LE>()?;
                    reader.read_u16::<LE>()?;
                    cluster
                },
                first_surface: reader.read_u32::<LE>()?,
                surface_count: reader.read_u32::<LE>()?,
            });
        }
        let surface_count = reader.read_u32::<LE>()?;
        for _ in 0..surface_count {
            bsp.surfaces.push(BspSurface {
                vertex0_index: reader.read_u16::<LE>()?,
                vertex1_index: reader.read_u16::<LE>()?,
                vertex2_index: reader.read_u16::<LE>()?,
            });
        }
        Ok(bsp)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.lightmaps_bitmap.write(writer)?;
        writer.write_u32::<LE>(self.planes.len() as u32)?;
        for plane in &self.planes {
            plane.write(writer)?;
        }
        writer.write_u32::<LE>(self.nodes.len() as u32)?;
        for node in &self.nodes {
            writer.write_u32::<LE>(node.plane)?;
            node.back_child.write(writer)?;
            node.front_child.write(writer)?;
        }
        writer.write_u32::<LE>(self.leaves.len() as u32)?;
        for leaf in &self.leaves {
            writer.write_u16::<LE>(leaf.cluster)?;
            writer.write_u16::<LE>(0)?;
            writer.write_u32::<LE>(leaf.first_surface)?;
            writer.write_u32::<LE>(leaf.surface_count)?;
        }
        writer.write_u32::<LE>(self.surfaces.len() as u32)?;
        for surface in &self.surfaces {
            writer.write_u16::<LE>(surface.vertex0_index)?;
            writer.write_u16::<LE>(surface.vertex1_index)?;
            writer.write_u16::<LE>(surface.vertex2_index)?;
        }
        Ok(())
    }

    pub fn references_mut(&mut self) -> Vec<&mut TagReference> {
        vec![&mut self.lightmaps_bitmap]
    }

    /// Walks the node tree and returns the leaf containing `point`, or
    /// `None` when the point falls into solid or outside space.
    pub fn leaf_for_point(&self, point: &Point3D) -> Option<u32> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut current = 0usize;
        loop {
            let node = self.nodes.get(current)?;
            let plane = self.planes.get(node.plane as usize)?;
            let child = if plane.distance(point) > 0.0 {
                node.front_child
            } else {
                node.back_child
            };
            if child.is_null() {
                return None;
            }
            if child.is_flagged() {
                return Some(child.value());
            }
            current = child.value() as usize;
        }
    }

    /// Clips the segment `a → b` against the tree and returns the first
    /// crossing into solid space, if any.
    pub fn segment_intersect(&self, a: &Point3D, b: &Point3D) -> Option<SegmentHit> {
        if self.nodes.is_empty() {
            return None;
        }
        match self.clip(FlaggedU32::plain(0), a, b) {
            Clip::Hit(hit) => Some(hit),
            Clip::Open(_) | Clip::Solid => None,
        }
    }

    fn clip(&self, node: FlaggedU32, a: &Point3D, b: &Point3D) -> Clip {
        if node.is_null() {
            return Clip::Solid;
        }
        if node.is_flagged() {
            return Clip::Open(Some(node.value()));
        }
        let Some(record) = self.nodes.get(node.value() as usize) else {
            return Clip::Open(None);
        };
        let Some(plane) = self.planes.get(record.plane as usize) else {
            return Clip::Open(None);
        };

        let distance_a = plane.distance(a);
        let distance_b = plane.distance(b);
        if distance_a > 0.0 && distance_b > 0.0 {
            return self.clip(record.front_child, a, b);
        }
        if distance_a <= 0.0 && distance_b <= 0.0 {
            return self.clip(record.back_child, a, b);
        }

        // The segment straddles the splitter: clip the near half first so
        // the earliest crossing wins.
        let t = distance_a / (distance_a - distance_b);
        let midpoint = a.lerp(b, t);
        let (near, far) = if distance_a > 0.0 {
            (record.front_child, record.back_child)
        } else {
            (record.back_child, record.front_child)
        };

        match self.clip(near, a, &midpoint) {
            Clip::Hit(hit) => Clip::Hit(hit),
            Clip::Solid => Clip::Solid,
            Clip::Open(near_leaf) => match self.clip(far, &midpoint, b) {
                Clip::Hit(hit) => Clip::Hit(hit),
                Clip::Solid => Clip::Hit(SegmentHit {
                    position: midpoint,
                    surface: record.plane,
                    leaf: near_leaf,
                }),
                Clip::Open(far_leaf) => Clip::Open(far_leaf.or(near_leaf)),
            },
        }
    }

    /// 64-byte engine main struct plus the walked arrays.
    pub fn emit(&self, emitter: &mut Emitter) -> Result<()> {
        emitter.write_reference(&self.lightmaps_bitmap)?;
        let planes_stub = emitter.reserve_block()?;
        let nodes_stub = emitter.reserve_block()?;
        let leaves_stub = emitter.reserve_block()?;
        let surfaces_stub = emitter.reserve_block()?;

        emitter.commit_block(planes_stub, self.planes.len())?;
        for plane in &self.planes {
            emitter.write_point(&plane.normal)?;
            emitter.write_f32(plane.d)?;
        }
        emitter.commit_block(nodes_stub, self.nodes.len())?;
        for node in &self.nodes {
            emitter.write_u32(node.plane)?;
            emitter.write_u32(node.back_child.bits())?;
            emitter.write_u32(node.front_child.bits())?;
        }
        emitter.commit_block(leaves_stub, self.leaves.len())?;
        for leaf in &self.leaves {
            emitter.write_u16(leaf.cluster)?;
            emitter.pad(2)?;
            emitter.write_u32(leaf.first_surface)?;
            emitter.write_u32(leaf.surface_count)?;
        }
        emitter.commit_block(surfaces_stub, self.surfaces.len())?;
        for surface in &self.surfaces {
            emitter.write_u16(surface.vertex0_index)?;
            emitter.write_u16(surface.vertex1_index)?;
            emitter.write_u16(surface.vertex2_index)?;
            emitter.pad(2)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Open space above the z = 0 plane (leaf 0), solid below.
    fn half_space() -> StructureBsp {
        StructureBsp {
            planes: vec![Plane3D {
                normal: Point3D::new(0.0, 0.0, 1.0),
                d: 0.0,
            }],
            nodes: vec![BspNode {
                plane: 0,
                back_child: FlaggedU32::NULL,
                front_child: FlaggedU32::flagged(0),
            }],
            leaves: vec![BspLeaf {
                cluster: 0,
                first_surface: 0,
                surface_count: 0,
            }],
            ..StructureBsp::default()
        }
    }

    #[test]
    fn point_above_plane_is_in_the_leaf() {
        let bsp = half_space();
        assert_eq!(bsp.leaf_for_point(&Point3D::new(0.0, 0.0, 5.0)), Some(0));
        assert_eq!(bsp.leaf_for_point(&Point3D::new(3.0, -2.0, 0.5)), Some(0));
    }

    #[test]
    fn point_below_plane_is_outside() {
        let bsp = half_space();
        assert_eq!(bsp.leaf_for_point(&Point3D::new(0.0, 0.0, -1.0)), None);
    }

    #[test]
    fn empty_bsp_contains_nothing() {
        let bsp = StructureBsp::default();
        assert_eq!(bsp.leaf_for_point(&Point3D::ZERO), None);
        assert!(
            bsp.segment_intersect(&Point3D::new(0.0, 0.0, 1.0), &Point3D::new(0.0, 0.0, -1.0))
                .is_none()
        );
    }

    #[test]
    fn downward_segment_hits_the_floor() {
        let bsp = half_space();
        let hit = bsp
            .segment_intersect(&Point3D::new(1.0, 2.0, 4.0), &Point3D::new(1.0, 2.0, -4.0))
            .unwrap();
        assert!(hit.position.z.abs() < 1e-6);
        assert_eq!(hit.position.x, 1.0);
        assert_eq!(hit.position.y, 2.0);
        assert_eq!(hit.surface, 0);
        assert_eq!(hit.leaf, Some(0));
    }

    #[test]
    fn segment_inside_open_space_misses() {
        let bsp = half_space();
        assert!(
            bsp.segment_intersect(&Point3D::new(0.0, 0.0, 2.0), &Point3D::new(5.0, 0.0, 1.0))
                .is_none()
        );
    }

    #[test]
    fn two_level_tree_resolves_both_leaves() {
        // Node 0 splits on z = 0: above it, node 1 splits on x = 0 into
        // leaf 0 (x > 0) and leaf 1 (x <= 0); below is solid.
        let bsp = StructureBsp {
            planes: vec![
                Plane3D {
                    normal: Point3D::new(0.0, 0.0, 1.0),
                    d: 0.0,
                },
                Plane3D {
                    normal: Point3D::new(1.0, 0.0, 0.0),
                    d: 0.0,
                },
            ],
            nodes: vec![
                BspNode {
                    plane: 0,
                    back_child: FlaggedU32::NULL,
                    front_child: FlaggedU32::plain(1),
                },
                BspNode {
                    plane: 1,
                    back_child: FlaggedU32::flagged(1),
                    front_child: FlaggedU32::flagged(0),
                },
            ],
            leaves: vec![BspLeaf::default(), BspLeaf::default()],
            ..StructureBsp::default()
        };
        assert_eq!(bsp.leaf_for_point(&Point3D::new(2.0, 0.0, 1.0)), Some(0));
        assert_eq!(bsp.leaf_for_point(&Point3D::new(-2.0, 0.0, 1.0)), Some(1));
        assert_eq!(bsp.leaf_for_point(&Point3D::new(0.0, 0.0, -1.0)), None);
    }

    #[test]
    fn source_form_round_trips() {
        let bsp = half_space();
        let mut buffer = Vec::new();
        bsp.write(&mut buffer).unwrap();
        let read = StructureBsp::read(&mut Cursor::new(buffer.as_slice())).unwrap();
        assert_eq!(read.planes.len(), 1);
        assert_eq!(read.nodes.len(), 1);
        assert!(read.nodes[0].front_child.is_flagged());
        assert!(read.nodes[0].back_child.is_null());
        assert_eq!(read.leaves.len(), 1);
    }
}
