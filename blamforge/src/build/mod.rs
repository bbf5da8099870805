//! The map build workload: recursive tag loading, iterative dependency
//! resolution with per-class pre-compile hooks, the scenario geometry
//! post-pass, resource indexing, and final image assembly.
//!
//! The pipeline is single threaded and deterministic: the same scenario,
//! tag roots, and parameters always produce identical bytes.

use std::mem;
use std::path::PathBuf;

use crate::Result;
use crate::common::errors::{MapError, TagError};
use crate::map::{CacheFileEngine, CacheFileType, MAXIMUM_TAG_COUNT, VERTEX_RECORD_SIZE};
use crate::resource::{ResourceMap, ResourceMapKind};
use crate::tag::loader::{TagFile, find_tag_file};
use crate::tag::scenario::Scenario;
use crate::tag::{CompiledTag, RawTag, TagData, TagState};
use crate::types::class::TagClass;
use crate::types::{FlaggedU32, NULL_INDEX, TagId};

mod assembler;
mod indexer;

pub use indexer::IndexingStats;

/// Virtual path of the global menu click sound.
const TING_PATH: &str = r"sound\sfx\ui\ting";

/// Gain factor the menu click needs on every engine except Dark Circlet.
const TING_SCALE: f32 = 0.2;

#[derive(Clone, Debug)]
/// Everything `compile_map` needs to know.
pub struct BuildParameters {
    /// Virtual path of the scenario tag.
    pub scenario: String,
    /// Ordered tag roots; earlier roots shadow later ones.
    pub tag_roots: Vec<PathBuf>,
    pub engine: CacheFileEngine,
    /// Directory holding bitmaps.map / sounds.map / loc.map; ignored for
    /// Dark Circlet builds.
    pub maps_directory: Option<PathBuf>,
    /// Tags that must be externalised against the resource maps.
    pub index_hints: Vec<(TagClass, String)>,
    /// Never reference external resource maps.
    pub no_external_tags: bool,
    /// Externalise on a path match alone, without comparing bytes.
    pub always_index_tags: bool,
    pub verbose: bool,
    /// Pad the tag-data section so its CRC32 comes out to this value.
    pub forge_crc: Option<u32>,
    /// Override the engine's default tag-data base address.
    pub tag_data_address: Option<u32>,
}

impl Default for BuildParameters {
    fn default() -> Self {
        Self {
            scenario: String::new(),
            tag_roots: Vec::new(),
            engine: CacheFileEngine::DarkCirclet,
            maps_directory: None,
            index_hints: Vec::new(),
            no_external_tags: false,
            always_index_tags: false,
            verbose: false,
            forge_crc: None,
            tag_data_address: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// How severe an accumulated report is; anything worse aborts the build as
/// an error instead.
pub enum ReportSeverity {
    Warning,
    Pedantic,
}

#[derive(Clone, Debug)]
/// A non-fatal finding accumulated during the build.
pub struct BuildReport {
    pub severity: ReportSeverity,
    /// Labelled tag path, extension included.
    pub tag: String,
    pub message: String,
}

#[derive(Clone, Debug)]
/// One resolved dependency of a finished workload.
pub struct FoundDependency {
    pub class: TagClass,
    pub path: String,
    pub id: TagId,
}

#[derive(Debug)]
/// The build workload. Owns the tag array, the global model pools, and all
/// mutable state of a single `compile_map` run.
pub struct BuildWorkload {
    pub(crate) parameters: BuildParameters,
    pub(crate) tags: Vec<CompiledTag>,
    pub(crate) cache_file_type: Option<CacheFileType>,
    pub(crate) scenario_index: usize,
    /// Globally deduplicated vertex records, shared by every model tag.
    pub(crate) model_vertices: Vec<[u8; VERTEX_RECORD_SIZE]>,
    /// Globally deduplicated triangle indices.
    pub(crate) model_indices: Vec<u16>,
    pub(crate) model_part_count: u32,
    pub(crate) exodux_handler: bool,
    pub(crate) exodux_parser: bool,
    pub(crate) reports: Vec<BuildReport>,
    pub(crate) bitmaps: Option<ResourceMap>,
    pub(crate) sounds: Option<ResourceMap>,
    pub(crate) loc: Option<ResourceMap>,
    pub(crate) indexing: IndexingStats,
}

impl BuildWorkload {
    pub fn new(parameters: BuildParameters) -> Self {
        Self {
            parameters,
            tags: Vec::new(),
            cache_file_type: None,
            scenario_index: 0,
            model_vertices: Vec::new(),
            model_indices: Vec::new(),
            model_part_count: 0,
            exodux_handler: false,
            exodux_parser: false,
            reports: Vec::new(),
            bitmaps: None,
            sounds: None,
            loc: None,
            indexing: IndexingStats::default(),
        }
    }

    /// Compiles a map in one call and returns the uncompressed image.
    pub fn compile_map(parameters: BuildParameters) -> Result<Vec<u8>> {
        Self::new(parameters).build()
    }

    /// Runs the full pipeline on this workload and returns the uncompressed
    /// image. The workload keeps its tag array afterwards for inspection.
    pub fn build(&mut self) -> Result<Vec<u8>> {
        let scenario = normalize_virtual_path(&self.parameters.scenario);
        self.scenario_index = self.load_tag(&scenario, TagClass::Scenario)?;
        self.resolve()?;
        self.adjust_ting_volume();
        self.fix_scenario_geometry()?;
        self.emit_tags()?;

        if self.engine().uses_external_resource_maps() && !self.parameters.no_external_tags {
            self.load_resource_maps()?;
            self.indexing = indexer::index_tags(self)?;
            log::info!(
                "indexed {} tags ({} asset bytes removed, {} partial, {} potential)",
                self.indexing.indexed,
                self.indexing.asset_data_removed,
                self.indexing.partials,
                self.indexing.potentials
            );
        }

        let image = assembler::assemble(self);
        // Resource maps are only needed up to indexing.
        self.bitmaps = None;
        self.sounds = None;
        self.loc = None;
        image
    }

    pub fn engine(&self) -> CacheFileEngine {
        self.parameters.engine
    }

    /// The ordered tag array of the workload.
    pub fn tags(&self) -> &[CompiledTag] {
        &self.tags
    }

    /// Warnings accumulated so far.
    pub fn reports(&self) -> &[BuildReport] {
        &self.reports
    }

    /// Statistics from the resource indexing stage.
    pub fn indexing(&self) -> &IndexingStats {
        &self.indexing
    }

    /// The resolved dependency set of the workload.
    pub fn dependencies(&self) -> Vec<FoundDependency> {
        self.tags
            .iter()
            .map(|tag| FoundDependency {
                class: tag.class,
                path: tag.path.clone(),
                id: tag.id,
            })
            .collect()
    }

    /// Maps a scenario-local BSP ordinal to its workload tag index.
    pub fn bsp_tag_index(&self, bsp: u32) -> Option<usize> {
        let scenario = self.tags.get(self.scenario_index)?;
        let TagData::Scenario(scenario) = &scenario.data else {
            return None;
        };
        scenario
            .structure_bsps
            .get(bsp as usize)?
            .id
            .index()
            .map(usize::from)
    }

    /// Loads a tag into the workload, returning the existing index when the
    /// `(class, path)` pair is already present. The slot is populated and
    /// visible before its pre-compile runs, which is what lets circular
    /// references resolve.
    pub(crate) fn load_tag(&mut self, virtual_path: &str, class: TagClass) -> Result<usize> {
        if let Some(existing) = self
            .tags
            .iter()
            .position(|tag| tag.class == class && tag.path == virtual_path)
        {
            return Ok(existing);
        }

        if self.tags.len() >= MAXIMUM_TAG_COUNT {
            return Err(MapError::SizeExceeded {
                what: "tag count",
                size: self.tags.len() as u64 + 1,
                limit: MAXIMUM_TAG_COUNT as u64,
            }
            .into());
        }

        let file_path = find_tag_file(&self.parameters.tag_roots, virtual_path, class)?;
        if self.parameters.verbose {
            log::info!("compiling {virtual_path}.{}", class.extension());
        }
        let file = TagFile::read_path(&file_path, class, virtual_path)?;

        let index = self.tags.len();
        let id = TagId::from_index(index as u16);
        self.tags.push(CompiledTag::new(
            String::from(virtual_path),
            class,
            id,
            file.data,
        ));
        Ok(index)
    }

    /// Iterates pre-compile over the array until it stabilises. Pre-compile
    /// order equals insertion order; hooks may load new tags, which join
    /// the back of the queue.
    fn resolve(&mut self) -> Result<()> {
        loop {
            let Some(index) = self
                .tags
                .iter()
                .position(|tag| tag.state == TagState::Loaded)
            else {
                break;
            };

            let mut data = mem::replace(&mut self.tags[index].data, TagData::Raw(RawTag::default()));
            self.resolve_references(&mut data, index)?;
            data.pre_compile(self, index)?;
            self.tags[index].data = data;
            self.tags[index].state = TagState::Finalised;
        }
        Ok(())
    }

    /// Loads every reference of a freshly parsed tag and assigns resolved
    /// ids, checking the class chain invariant.
    fn resolve_references(&mut self, data: &mut TagData, referencing: usize) -> Result<()> {
        for reference in data.references_mut() {
            let Some(class) = reference.class else {
                continue;
            };
            if reference.path.is_empty() {
                continue;
            }
            let target = self.load_tag(&reference.path, class)?;
            let found = self.tags[target].class;
            if !found.matches(class) {
                return Err(TagError::BrokenReference {
                    tag: self.tag_label(referencing),
                    path: reference.path.clone(),
                    expected: class,
                    found,
                }
                .into());
            }
            reference.id = self.tags[target].id;
        }
        Ok(())
    }

    /// Scales the menu click's gain on targets that still carry the legacy
    /// quirk.
    fn adjust_ting_volume(&mut self) {
        if self.engine() == CacheFileEngine::DarkCirclet {
            return;
        }
        for tag in &mut self.tags {
            if tag.class != TagClass::Sound || tag.path != TING_PATH {
                continue;
            }
            if let TagData::Sound(sound) = &mut tag.data {
                sound.random_gain_modifier *= TING_SCALE;
                log::debug!("adjusted ting gain to {}", sound.random_gain_modifier);
            }
        }
    }

    /// Dedicated post-pass: every BSP is finalised by now, so encounters
    /// and command lists can resolve the leaves their points sit in.
    fn fix_scenario_geometry(&mut self) -> Result<()> {
        let scenario_index = self.scenario_index;
        let mut data = mem::replace(
            &mut self.tags[scenario_index].data,
            TagData::Raw(RawTag::default()),
        );
        let warnings = match &mut data {
            TagData::Scenario(scenario) => self.fix_scenario_points(scenario),
            _ => Vec::new(),
        };
        self.tags[scenario_index].data = data;
        for message in warnings {
            self.warn(scenario_index, message);
        }
        Ok(())
    }

    fn fix_scenario_points(&self, scenario: &mut Scenario) -> Vec<String> {
        let mut warnings = Vec::new();
        let bsp_tags: Vec<Option<usize>> = scenario
            .structure_bsps
            .iter()
            .map(|bsp| bsp.id.index().map(usize::from))
            .collect();

        for encounter in &mut scenario.encounters {
            let positions: Vec<_> = encounter
                .firing_positions
                .iter()
                .map(|position| position.position)
                .collect();
            let (bsp_number, leaves) = self.locate_points(&bsp_tags, &positions);
            encounter.precomputed_bsp_index = bsp_number;
            for (position, leaf) in encounter.firing_positions.iter_mut().zip(leaves) {
                match leaf {
                    Some((leaf_index, cluster)) => {
                        position.leaf_index = FlaggedU32::flagged(leaf_index);
                        position.cluster_index = cluster;
                    }
                    None => {
                        position.leaf_index = FlaggedU32::NULL;
                        warnings.push(format!(
                            "firing position of encounter {} is not inside any BSP",
                            encounter.name
                        ));
                    }
                }
            }
        }

        for list in &mut scenario.command_lists {
            let positions: Vec<_> = list.points.iter().map(|point| point.position).collect();
            let (bsp_number, leaves) = self.locate_points(&bsp_tags, &positions);
            list.precomputed_bsp_index = bsp_number;
            for (point, leaf) in list.points.iter_mut().zip(leaves) {
                match leaf {
                    Some((leaf_index, _)) => point.leaf_index = FlaggedU32::flagged(leaf_index),
                    None => {
                        point.leaf_index = FlaggedU32::NULL;
                        warnings.push(format!(
                            "command point of list {} is not inside any BSP",
                            list.name
                        ));
                    }
                }
            }
        }
        warnings
    }

    /// Picks the BSP containing the most of the given points and returns
    /// each point's `(leaf, cluster)` there.
    #[allow(clippy::type_complexity)]
    fn locate_points(
        &self,
        bsp_tags: &[Option<usize>],
        points: &[crate::types::Point3D],
    ) -> (u16, Vec<Option<(u32, u16)>>) {
        let mut best: Option<(u16, usize, Vec<Option<(u32, u16)>>)> = None;
        for (bsp_number, tag_index) in bsp_tags.iter().enumerate() {
            let Some(tag_index) = tag_index else {
                continue;
            };
            let TagData::StructureBsp(bsp) = &self.tags[*tag_index].data else {
                continue;
            };
            let leaves: Vec<Option<(u32, u16)>> = points
                .iter()
                .map(|point| {
                    bsp.leaf_for_point(point).map(|leaf| {
                        let cluster = bsp
                            .leaves
                            .get(leaf as usize)
                            .map_or(0, |record| record.cluster);
                        (leaf, cluster)
                    })
                })
                .collect();
            let hits = leaves.iter().filter(|leaf| leaf.is_some()).count();
            if best
                .as_ref()
                .is_none_or(|(_, best_hits, _)| hits > *best_hits)
            {
                best = Some((bsp_number as u16, hits, leaves));
            }
        }
        match best {
            Some((bsp_number, _, leaves)) => (bsp_number, leaves),
            None => (NULL_INDEX, vec![None; points.len()]),
        }
    }

    /// Freezes every tag into its engine-layout payload.
    fn emit_tags(&mut self) -> Result<()> {
        let engine = self.engine();
        for index in 0..self.tags.len() {
            let payload = self.tags[index].data.emit(engine)?;
            self.tags[index].payload = Some(payload);
        }
        Ok(())
    }

    fn load_resource_maps(&mut self) -> Result<()> {
        let Some(maps_directory) = self.parameters.maps_directory.clone() else {
            return Ok(());
        };
        self.bitmaps = ResourceMap::load(&maps_directory, ResourceMapKind::Bitmaps)?;
        self.sounds = ResourceMap::load(&maps_directory, ResourceMapKind::Sounds)?;
        self.loc = ResourceMap::load(&maps_directory, ResourceMapKind::Loc)?;
        Ok(())
    }

    pub(crate) fn warn(&mut self, tag_index: usize, message: String) {
        let tag = self.tag_label(tag_index);
        log::warn!("{tag}: {message}");
        self.reports.push(BuildReport {
            severity: ReportSeverity::Warning,
            tag,
            message,
        });
    }

    pub(crate) fn warn_pedantic(&mut self, tag_index: usize, message: String) {
        let tag = self.tag_label(tag_index);
        log::debug!("{tag}: {message}");
        self.reports.push(BuildReport {
            severity: ReportSeverity::Pedantic,
            tag,
            message,
        });
    }

    /// Builds the error for a fatal pre-compile failure.
    pub(crate) fn fatal(&self, tag_index: usize, reason: String) -> crate::Error {
        TagError::InvalidData {
            tag: self.tag_label(tag_index),
            reason,
        }
        .into()
    }

    fn tag_label(&self, tag_index: usize) -> String {
        self.tags.get(tag_index).map_or_else(
            || String::from("<unknown tag>"),
            |tag| format!("{}.{}", tag.path, tag.class.extension()),
        )
    }
}

/// Accepts forward slashes in caller-supplied paths.
fn normalize_virtual_path(path: &str) -> String {
    path.replace('/', "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{CacheFileHeader, HEADER_SIZE, TagDataHeader};
    use crate::resource::{Resource, ResourceMap, ResourceMapKind};
    use crate::tag::bsp::{BspLeaf, BspNode, Plane3D, StructureBsp};
    use crate::tag::loader::file_path_for;
    use crate::tag::model::{
        GbxModel, ModelGeometry, ModelNode, ModelPart, ModelTriangle, ModelVertex,
    };
    use crate::tag::scenario::{Encounter, FiringPosition};
    use crate::tag::sound::{PitchRange, Sound, SoundPermutation};
    use crate::tag::string_list::StringList;
    use crate::tag::TagReference;
    use crate::types::{Point3D, TagString};
    use std::path::Path;

    fn write_tag(root: &Path, virtual_path: &str, class: TagClass, data: TagData) {
        TagFile::new(class, data)
            .write_path(&file_path_for(root, virtual_path, class))
            .unwrap();
    }

    fn scenario_with(map_type: CacheFileType, resources: Vec<TagReference>) -> TagData {
        TagData::Scenario(Scenario {
            map_type,
            resources,
            ..Scenario::default()
        })
    }

    fn parameters(root: &Path, engine: CacheFileEngine) -> BuildParameters {
        BuildParameters {
            scenario: String::from(r"levels\test\empty\empty"),
            tag_roots: vec![root.to_path_buf()],
            engine,
            ..BuildParameters::default()
        }
    }

    fn single_part_model(vertex_count: u16, triangle_count: u16) -> GbxModel {
        GbxModel {
            nodes: vec![ModelNode {
                name: TagString::new("frame root"),
                next_sibling_node_index: NULL_INDEX,
                first_child_node_index: NULL_INDEX,
                parent_node_index: NULL_INDEX,
                ..ModelNode::default()
            }],
            geometries: vec![ModelGeometry {
                flags: 0,
                parts: vec![ModelPart {
                    uncompressed_vertices: (0..vertex_count)
                        .map(|i| ModelVertex {
                            position: Point3D::new(f32::from(i), 0.0, 1.0),
                            node0_weight: 1.0,
                            node1_index: NULL_INDEX,
                            ..ModelVertex::default()
                        })
                        .collect(),
                    triangles: (0..triangle_count)
                        .map(|i| ModelTriangle {
                            vertex0_index: i % vertex_count,
                            vertex1_index: (i + 1) % vertex_count,
                            vertex2_index: (i + 2) % vertex_count,
                        })
                        .collect(),
                    ..ModelPart::default()
                }],
            }],
            ..GbxModel::default()
        }
    }

    fn half_space_bsp() -> StructureBsp {
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
                cluster: 3,
                first_surface: 0,
                surface_count: 0,
            }],
            ..StructureBsp::default()
        }
    }

    #[test]
    fn empty_multiplayer_scenario_builds_a_valid_image() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(CacheFileType::Multiplayer, Vec::new()),
        );

        let image =
            BuildWorkload::compile_map(parameters(root.path(), CacheFileEngine::CustomEdition))
                .unwrap();
        assert!(image.len() > HEADER_SIZE);

        let header = CacheFileHeader::read(&mut image.as_slice()).unwrap();
        assert_eq!(header.engine, CacheFileEngine::CustomEdition);
        assert_eq!(header.map_type, CacheFileType::Multiplayer);
        assert_eq!(header.file_size as usize, image.len());
        assert_eq!(header.name.as_str(), "empty");

        let tag_data = &image[header.tag_data_offset as usize..];
        assert_eq!(tag_data.len(), header.tag_data_size as usize);
        let tag_data_header =
            TagDataHeader::read(&mut &tag_data[..], CacheFileEngine::CustomEdition).unwrap();
        assert!(tag_data_header.tag_count >= 1);
        assert_eq!(tag_data_header.scenario_tag.index(), Some(0));

        // Identical inputs must produce identical bytes.
        let again =
            BuildWorkload::compile_map(parameters(root.path(), CacheFileEngine::CustomEdition))
                .unwrap();
        assert_eq!(image, again);
    }

    #[test]
    fn identical_models_share_offsets_across_tags() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"scenery\rock\rock",
            TagClass::GbxModel,
            TagData::Model(single_part_model(42, 20)),
        );
        write_tag(
            root.path(),
            r"scenery\boulder\boulder",
            TagClass::GbxModel,
            TagData::Model(single_part_model(42, 20)),
        );
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![
                    TagReference::new(TagClass::GbxModel, r"scenery\rock\rock"),
                    TagReference::new(TagClass::GbxModel, r"scenery\boulder\boulder"),
                ],
            ),
        );

        let mut workload =
            BuildWorkload::new(parameters(root.path(), CacheFileEngine::CustomEdition));
        workload.build().unwrap();

        let parts: Vec<&ModelPart> = workload
            .tags()
            .iter()
            .filter_map(|tag| match &tag.data {
                TagData::Model(model) => Some(&model.geometries[0].parts[0]),
                _ => None,
            })
            .collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].vertex_offset, parts[1].vertex_offset);
        assert_eq!(parts[0].triangle_offset, parts[1].triangle_offset);
        assert_eq!(
            workload.model_vertices.len() * VERTEX_RECORD_SIZE,
            42 * VERTEX_RECORD_SIZE
        );
        assert_eq!(workload.model_part_count, 2);
    }

    fn ting_sound() -> TagData {
        TagData::Sound(Sound {
            flags: 0,
            sound_class: 4,
            sample_rate: 22050,
            random_gain_modifier: 1.0,
            pitch_ranges: vec![PitchRange {
                name: TagString::new("default"),
                natural_pitch: 1.0,
                permutations: vec![SoundPermutation {
                    name: TagString::new("ting"),
                    gain: 1.0,
                    samples: vec![1, 2, 3, 4],
                }],
            }],
        })
    }

    fn ting_gain(workload: &BuildWorkload) -> f32 {
        workload
            .tags()
            .iter()
            .find_map(|tag| match &tag.data {
                TagData::Sound(sound) if tag.path == TING_PATH => {
                    Some(sound.random_gain_modifier)
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn ting_gain_is_scaled_except_on_dark_circlet() {
        let root = tempfile::tempdir().unwrap();
        write_tag(root.path(), TING_PATH, TagClass::Sound, ting_sound());
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![TagReference::new(TagClass::Sound, TING_PATH)],
            ),
        );

        let mut retail = BuildWorkload::new(parameters(root.path(), CacheFileEngine::Retail));
        retail.build().unwrap();
        assert!((ting_gain(&retail) - TING_SCALE).abs() < 1e-6);

        let mut native =
            BuildWorkload::new(parameters(root.path(), CacheFileEngine::DarkCirclet));
        native.build().unwrap();
        assert!((ting_gain(&native) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn forged_crc_holds_over_the_tag_data_section() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(CacheFileType::Multiplayer, Vec::new()),
        );

        let mut params = parameters(root.path(), CacheFileEngine::CustomEdition);
        params.forge_crc = Some(0xDEAD_BEEF);
        let image = BuildWorkload::compile_map(params).unwrap();

        let header = CacheFileHeader::read(&mut image.as_slice()).unwrap();
        assert_eq!(header.crc32, 0xDEAD_BEEF);
        let tag_data = &image[header.tag_data_offset as usize
            ..header.tag_data_offset as usize + header.tag_data_size as usize];
        assert_eq!(crc32fast::hash(tag_data), 0xDEAD_BEEF);
    }

    #[test]
    fn circular_references_resolve_to_the_allocated_slot() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"sky\alpha",
            TagClass::Sky,
            TagData::Raw(RawTag {
                dependencies: vec![TagReference::new(TagClass::Sky, r"sky\beta")],
                payload: vec![0xAA],
            }),
        );
        write_tag(
            root.path(),
            r"sky\beta",
            TagClass::Sky,
            TagData::Raw(RawTag {
                dependencies: vec![TagReference::new(TagClass::Sky, r"sky\alpha")],
                payload: vec![0xBB],
            }),
        );
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::UserInterface,
                vec![TagReference::new(TagClass::Sky, r"sky\alpha")],
            ),
        );

        let mut workload =
            BuildWorkload::new(parameters(root.path(), CacheFileEngine::DarkCirclet));
        workload.build().unwrap();

        assert_eq!(workload.tags().len(), 3);
        let dependencies = workload.dependencies();
        assert!(dependencies.iter().any(|found| found.path == r"sky\alpha"));
        assert!(dependencies.iter().any(|found| found.path == r"sky\beta"));
        // Both ids resolved and distinct.
        let alpha = workload
            .tags()
            .iter()
            .find(|tag| tag.path == r"sky\alpha")
            .unwrap();
        let TagData::Raw(raw) = &alpha.data else {
            panic!("sky should stay schema-driven");
        };
        assert!(!raw.dependencies[0].id.is_null());
    }

    #[test]
    fn missing_tags_abort_the_build() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![TagReference::new(TagClass::Sound, r"sound\not\there")],
            ),
        );
        let error =
            BuildWorkload::compile_map(parameters(root.path(), CacheFileEngine::CustomEdition))
                .unwrap_err();
        assert!(matches!(
            error,
            crate::Error::TagError(TagError::NotFound { .. })
        ));
    }

    #[test]
    fn encounters_are_fixed_up_against_the_bsp() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"levels\test\empty\empty_bsp",
            TagClass::ScenarioStructureBsp,
            TagData::StructureBsp(half_space_bsp()),
        );
        let scenario = Scenario {
            map_type: CacheFileType::Singleplayer,
            encounters: vec![Encounter {
                name: TagString::new("covies"),
                flags: 0,
                team_index: 1,
                precomputed_bsp_index: NULL_INDEX,
                firing_positions: vec![
                    FiringPosition {
                        position: Point3D::new(0.0, 0.0, 2.0),
                        ..FiringPosition::default()
                    },
                    FiringPosition {
                        position: Point3D::new(0.0, 0.0, -2.0),
                        ..FiringPosition::default()
                    },
                ],
            }],
            structure_bsps: vec![TagReference::new(
                TagClass::ScenarioStructureBsp,
                r"levels\test\empty\empty_bsp",
            )],
            ..Scenario::default()
        };
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            TagData::Scenario(scenario),
        );

        let mut workload =
            BuildWorkload::new(parameters(root.path(), CacheFileEngine::DarkCirclet));
        workload.build().unwrap();

        let TagData::Scenario(scenario) = &workload.tags()[workload.scenario_index].data else {
            panic!("scenario slot must hold the scenario");
        };
        let encounter = &scenario.encounters[0];
        assert_eq!(encounter.precomputed_bsp_index, 0);
        assert!(encounter.firing_positions[0].leaf_index.is_flagged());
        assert_eq!(encounter.firing_positions[0].leaf_index.value(), 0);
        assert_eq!(encounter.firing_positions[0].cluster_index, 3);
        assert!(encounter.firing_positions[1].leaf_index.is_null());
        assert!(
            workload
                .reports()
                .iter()
                .any(|report| report.message.contains("not inside any BSP"))
        );
        assert_eq!(workload.bsp_tag_index(0), Some(1));
        assert_eq!(workload.bsp_tag_index(1), None);
        assert_eq!(workload.cache_file_type, Some(CacheFileType::Singleplayer));
    }

    #[test]
    fn custom_edition_indexes_matching_string_lists() {
        let root = tempfile::tempdir().unwrap();
        let maps = tempfile::tempdir().unwrap();

        let list = StringList {
            strings: vec![String::from("SLAYER")],
        };
        let compiled = TagData::StringList(list.clone())
            .emit(CacheFileEngine::CustomEdition)
            .unwrap();
        let mut loc = ResourceMap::new(ResourceMapKind::Loc);
        loc.resources.push(Resource {
            path: String::from(r"ui\multiplayer_game_text"),
            data_offset: 0,
            data: compiled.data.clone(),
        });
        std::fs::write(maps.path().join("loc.map"), loc.to_bytes().unwrap()).unwrap();

        write_tag(
            root.path(),
            r"ui\multiplayer_game_text",
            TagClass::UnicodeStringList,
            TagData::StringList(list),
        );
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![TagReference::new(
                    TagClass::UnicodeStringList,
                    r"ui\multiplayer_game_text",
                )],
            ),
        );

        let mut params = parameters(root.path(), CacheFileEngine::CustomEdition);
        params.maps_directory = Some(maps.path().to_path_buf());
        let mut workload = BuildWorkload::new(params);
        workload.build().unwrap();

        assert_eq!(workload.indexing().indexed, 1);
        let list_tag = workload
            .tags()
            .iter()
            .find(|tag| tag.class == TagClass::UnicodeStringList)
            .unwrap();
        assert!(list_tag.indexed);
        assert_eq!(list_tag.resource_index, Some(0));
        assert!(list_tag.payload.as_ref().unwrap().data.is_empty());
    }

    #[test]
    fn retail_externalises_matching_bitmap_blobs() {
        use crate::tag::bitmap::{Bitmap, BitmapData};

        let root = tempfile::tempdir().unwrap();
        let maps = tempfile::tempdir().unwrap();

        let pixels: Vec<u8> = (0u8..64).collect();
        let bitmap = Bitmap {
            kind: 0,
            usage: 0,
            bitmaps: vec![BitmapData {
                width: 4,
                height: 4,
                depth: 1,
                pixel_data_offset: 0,
                pixel_data_size: 64,
                ..BitmapData::default()
            }],
            pixel_data: pixels.clone(),
        };

        let mut bitmaps = ResourceMap::new(ResourceMapKind::Bitmaps);
        bitmaps.resources.push(Resource {
            path: String::from(r"ui\cursor"),
            data_offset: 0,
            data: pixels,
        });
        std::fs::write(
            maps.path().join("bitmaps.map"),
            bitmaps.to_bytes().unwrap(),
        )
        .unwrap();

        write_tag(root.path(), r"ui\cursor", TagClass::Bitmap, TagData::Bitmap(bitmap));
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![TagReference::new(TagClass::Bitmap, r"ui\cursor")],
            ),
        );

        let mut params = parameters(root.path(), CacheFileEngine::Retail);
        params.maps_directory = Some(maps.path().to_path_buf());
        let mut workload = BuildWorkload::new(params);
        workload.build().unwrap();

        assert_eq!(workload.indexing().partials, 1);
        assert_eq!(workload.indexing().indexed, 0);
        assert_eq!(workload.indexing().asset_data_removed, 64);
        let bitmap_tag = workload
            .tags()
            .iter()
            .find(|tag| tag.class == TagClass::Bitmap)
            .unwrap();
        assert!(!bitmap_tag.indexed);
        let payload = bitmap_tag.payload.as_ref().unwrap();
        assert!(payload.assets[0].resource_offset.is_some());
        assert!(payload.assets[0].data.is_empty());
    }

    #[test]
    fn unhonourable_index_hints_are_an_error() {
        let root = tempfile::tempdir().unwrap();
        let maps = tempfile::tempdir().unwrap();
        std::fs::write(
            maps.path().join("loc.map"),
            ResourceMap::new(ResourceMapKind::Loc).to_bytes().unwrap(),
        )
        .unwrap();

        write_tag(
            root.path(),
            r"ui\multiplayer_game_text",
            TagClass::UnicodeStringList,
            TagData::StringList(StringList {
                strings: vec![String::from("KING OF THE HILL")],
            }),
        );
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(
                CacheFileType::Multiplayer,
                vec![TagReference::new(
                    TagClass::UnicodeStringList,
                    r"ui\multiplayer_game_text",
                )],
            ),
        );

        let mut params = parameters(root.path(), CacheFileEngine::CustomEdition);
        params.maps_directory = Some(maps.path().to_path_buf());
        params.index_hints = vec![(
            TagClass::UnicodeStringList,
            String::from(r"ui\multiplayer_game_text"),
        )];
        let error = BuildWorkload::new(params).build().unwrap_err();
        assert!(matches!(
            error,
            crate::Error::BuildError(crate::common::errors::BuildError::ResourceMismatch { .. })
        ));
    }

    #[test]
    fn compiled_image_survives_compression_round_trip() {
        let root = tempfile::tempdir().unwrap();
        write_tag(
            root.path(),
            r"levels\test\empty\empty",
            TagClass::Scenario,
            scenario_with(CacheFileType::Multiplayer, Vec::new()),
        );
        let image =
            BuildWorkload::compile_map(parameters(root.path(), CacheFileEngine::Retail)).unwrap();

        let compressed = crate::compress::compress_map(&image, 3).unwrap();
        let restored = crate::compress::decompress_map(&compressed).unwrap();
        assert_eq!(restored, image);
    }
}
