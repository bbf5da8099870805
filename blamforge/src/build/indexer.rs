//! External-resource indexing: replaces bitmap/sound/string-list payloads
//! (or just their asset blobs) with references into the shared resource
//! maps, reclaiming cache space on the targets that support it.

use byteorder::{ByteOrder, LE};

use crate::Result;
use crate::build::BuildWorkload;
use crate::common::errors::BuildError;
use crate::resource::ResourceMap;
use crate::tag::RelocationTarget;
use crate::tag::bitmap::{BitmapDataFlags, FLAGS_BEFORE_PIXEL_OFFSET};
use crate::types::class::TagClass;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// What the indexing stage accomplished, for front-end reporting.
pub struct IndexingStats {
    /// Tags whose whole payload now lives in a resource map.
    pub indexed: usize,
    /// Asset bytes that no longer need to be appended to the image.
    pub asset_data_removed: usize,
    /// Tags that kept their payload but externalised asset blobs.
    pub partials: usize,
    /// Tags that matched a resource by name but not by bytes.
    pub potentials: usize,
}

enum Action {
    Whole {
        resource_index: u32,
    },
    Partial {
        blobs: Vec<(usize, u32)>,
    },
    Potential,
    None,
}

pub(crate) fn index_tags(workload: &mut BuildWorkload) -> Result<IndexingStats> {
    let mut stats = IndexingStats::default();
    let allow_whole_tags = workload.engine().indexes_whole_tags();
    let always_index = workload.parameters.always_index_tags;
    let hints = workload.parameters.index_hints.clone();

    for index in 0..workload.tags.len() {
        let class = workload.tags[index].class;
        let path = workload.tags[index].path.clone();
        let hinted = hints
            .iter()
            .any(|(hint_class, hint_path)| *hint_class == class && *hint_path == path);

        let map = resource_map_for(workload, class);
        let action = match map.and_then(|map| map.find(&path)) {
            Some((resource_index, resource)) => {
                let Some(payload) = &workload.tags[index].payload else {
                    continue;
                };
                if allow_whole_tags && (always_index || hinted) {
                    Action::Whole { resource_index }
                } else if allow_whole_tags && resource.data == compiled_bytes(payload) {
                    Action::Whole { resource_index }
                } else {
                    let blobs: Vec<(usize, u32)> = payload
                        .assets
                        .iter()
                        .enumerate()
                        .filter(|(_, blob)| {
                            blob.resource_offset.is_none() && blob.data == resource.data
                        })
                        .map(|(blob_index, _)| (blob_index, resource.data_offset))
                        .collect();
                    if !blobs.is_empty() {
                        Action::Partial { blobs }
                    } else if allow_whole_tags {
                        Action::Potential
                    } else {
                        Action::None
                    }
                }
            }
            None => {
                if hinted {
                    return Err(BuildError::ResourceMismatch {
                        path,
                        reason: String::from("not present in the resource map"),
                    }
                    .into());
                }
                continue;
            }
        };

        let tag = &mut workload.tags[index];
        let Some(payload) = tag.payload.as_mut() else {
            continue;
        };
        match action {
            Action::Whole { resource_index } => {
                stats.indexed += 1;
                stats.asset_data_removed += payload.asset_size();
                tag.indexed = true;
                tag.resource_index = Some(resource_index);
                payload.data.clear();
                payload.relocations.clear();
                payload.assets.clear();
                log::debug!("indexed {path} as resource {resource_index}");
            }
            Action::Partial { blobs } => {
                stats.partials += 1;
                for (blob_index, resource_offset) in blobs {
                    stats.asset_data_removed += payload.assets[blob_index].data.len();
                    payload.assets[blob_index].data = Vec::new();
                    payload.assets[blob_index].resource_offset = Some(resource_offset);
                    if class == TagClass::Bitmap {
                        mark_bitmap_record_external(payload, blob_index);
                    }
                }
            }
            Action::Potential => stats.potentials += 1,
            Action::None => {}
        }
    }
    Ok(stats)
}

fn resource_map_for(workload: &BuildWorkload, class: TagClass) -> Option<&ResourceMap> {
    match class {
        TagClass::Bitmap => workload.bitmaps.as_ref(),
        TagClass::Sound => workload.sounds.as_ref(),
        TagClass::UnicodeStringList => workload.loc.as_ref(),
        _ => None,
    }
}

/// The byte image a resource entry is compared against: payload followed by
/// its asset blobs.
fn compiled_bytes(payload: &crate::tag::TagPayload) -> Vec<u8> {
    let mut bytes = payload.data.clone();
    for blob in &payload.assets {
        bytes.extend_from_slice(&blob.data);
    }
    bytes
}

/// Sets the EXTERNAL flag in the emitted bitmap record owning this blob;
/// the flags field sits a fixed distance before the pixel-offset slot.
fn mark_bitmap_record_external(payload: &mut crate::tag::TagPayload, blob_index: usize) {
    let Some(relocation) = payload
        .relocations
        .iter()
        .find(|relocation| relocation.target == RelocationTarget::Asset(blob_index))
    else {
        return;
    };
    let flags_offset = (relocation.offset - FLAGS_BEFORE_PIXEL_OFFSET) as usize;
    let flags = LE::read_u16(&payload.data[flags_offset..flags_offset + 2])
        | BitmapDataFlags::EXTERNAL.bits();
    LE::write_u16(&mut payload.data[flags_offset..flags_offset + 2], flags);
}
