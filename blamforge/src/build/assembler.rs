//! Image assembly: lays tags out in the tag-data address window, resolves
//! relocations, appends model and asset data, and writes the cache file
//! header with a computed or forged CRC32.

use crate::Result;
use crate::build::BuildWorkload;
use crate::common::errors::MapError;
use crate::map::{
    CacheFileEngine, CacheFileHeader, CompressionType, HEADER_SIZE, MAXIMUM_FILE_LENGTH,
    TagDataHeader, TagRecord, VERTEX_RECORD_SIZE,
};
use crate::tag::RelocationTarget;
use crate::types::TagString;

/// Fixed salt for the tag-data header; builds must be reproducible, so
/// nothing in the image comes from a real RNG.
const TAG_DATA_SALT: u32 = 0x1657_0F8A;

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Build string stamped into the header, matching what the target engine
/// reports for itself.
fn build_string(engine: CacheFileEngine) -> &'static str {
    match engine {
        CacheFileEngine::Xbox => "01.10.12.2276",
        CacheFileEngine::Demo | CacheFileEngine::DemoCompressed => "01.00.00.0576",
        CacheFileEngine::Retail | CacheFileEngine::RetailCompressed => "01.00.00.0564",
        CacheFileEngine::CustomEdition | CacheFileEngine::CustomEditionCompressed => {
            "01.00.00.0609"
        }
        CacheFileEngine::DarkCirclet => "blamforge.0564",
    }
}

pub(crate) fn assemble(workload: &mut BuildWorkload) -> Result<Vec<u8>> {
    let engine = workload.engine();
    let base_address = workload
        .parameters
        .tag_data_address
        .unwrap_or_else(|| engine.base_address());
    let tag_count = workload.tags.len();

    // Tag-data interior layout: header, records, string table, payloads.
    let tag_data_header_size = TagDataHeader::size_for(engine);
    let records_size = tag_count * TagRecord::SIZE;

    let mut string_table = Vec::new();
    let mut string_offsets = Vec::with_capacity(tag_count);
    for tag in &workload.tags {
        string_offsets.push(tag_data_header_size + records_size + string_table.len());
        string_table.extend_from_slice(tag.path.as_bytes());
        string_table.push(0);
    }
    string_table.resize(align4(string_table.len()), 0);

    let mut payload_offsets = vec![0usize; tag_count];
    let mut running = tag_data_header_size + records_size + string_table.len();
    for (index, tag) in workload.tags.iter().enumerate() {
        let Some(payload) = &tag.payload else {
            continue;
        };
        if tag.indexed || payload.data.is_empty() {
            continue;
        }
        running = align4(running);
        payload_offsets[index] = running;
        running += payload.data.len();
    }
    let tag_data_size = running;

    // File layout outside the tag-data section: header, asset blobs, model
    // vertices, model indices, then the tag data itself.
    let mut asset_section = Vec::new();
    let mut blob_offsets: Vec<Vec<u32>> = Vec::with_capacity(tag_count);
    for tag in &workload.tags {
        let mut offsets = Vec::new();
        if let Some(payload) = &tag.payload {
            for blob in &payload.assets {
                match blob.resource_offset {
                    Some(resource_offset) => offsets.push(resource_offset),
                    None => {
                        asset_section.resize(align4(asset_section.len()), 0);
                        offsets.push((HEADER_SIZE + asset_section.len()) as u32);
                        asset_section.extend_from_slice(&blob.data);
                    }
                }
            }
        }
        blob_offsets.push(offsets);
    }
    asset_section.resize(align4(asset_section.len()), 0);

    let model_data_offset = HEADER_SIZE + asset_section.len();
    let vertex_bytes = workload.model_vertices.len() * VERTEX_RECORD_SIZE;
    let index_bytes = workload.model_indices.len() * size_of::<u16>();
    let model_data_size = vertex_bytes + index_bytes;
    let tag_data_offset = align4(model_data_offset + model_data_size);

    // Assemble the tag-data section.
    let mut tag_data = Vec::with_capacity(tag_data_size);
    let scenario_tag = workload.tags[workload.scenario_index].id;
    let tag_data_header = TagDataHeader {
        tag_array_address: base_address + tag_data_header_size as u32,
        scenario_tag,
        random_number: TAG_DATA_SALT,
        tag_count: tag_count as u32,
        model_part_count: workload.model_part_count,
        model_data_file_offset: model_data_offset as u32,
        model_part_count_2: workload.model_part_count,
        vertex_size: VERTEX_RECORD_SIZE as u32,
        model_data_size: model_data_size as u32,
    };
    tag_data_header.write(&mut tag_data, engine)?;

    for (index, tag) in workload.tags.iter().enumerate() {
        let (primary_class, secondary_class, tertiary_class) = tag.class.chain();
        let data = if tag.indexed {
            tag.resource_index.unwrap_or_default()
        } else if payload_offsets[index] == 0 {
            0
        } else {
            base_address + payload_offsets[index] as u32
        };
        TagRecord {
            primary_class,
            secondary_class,
            tertiary_class,
            id: tag.id,
            path_address: base_address + string_offsets[index] as u32,
            data,
            indexed: u32::from(tag.indexed),
        }
        .write(&mut tag_data)?;
    }

    tag_data.extend_from_slice(&string_table);

    for (index, tag) in workload.tags.iter().enumerate() {
        let Some(payload) = &tag.payload else {
            continue;
        };
        if tag.indexed || payload.data.is_empty() {
            continue;
        }
        tag_data.resize(payload_offsets[index], 0);
        tag_data.extend_from_slice(&payload.data);

        for relocation in &payload.relocations {
            let value = match relocation.target {
                RelocationTarget::TagId(target) => workload
                    .tags
                    .get(usize::from(target))
                    .map_or(u32::MAX, |target| target.id.bits()),
                RelocationTarget::TagPath(target) => {
                    base_address + string_offsets[usize::from(target)] as u32
                }
                RelocationTarget::Payload(offset) => {
                    base_address + (payload_offsets[index] as u32) + offset
                }
                RelocationTarget::Asset(blob) => blob_offsets[index][blob],
            };
            let position = payload_offsets[index] + relocation.offset as usize;
            tag_data[position..position + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    // Forging appends four computed bytes so the section's CRC32 lands on
    // the requested value.
    if let Some(desired) = workload.parameters.forge_crc {
        let patch = forge_crc32(&tag_data, desired);
        tag_data.extend_from_slice(&patch);
    }
    let crc32 = crc32fast::hash(&tag_data);

    for (index, offset) in payload_offsets.iter().enumerate() {
        if *offset != 0 {
            workload.tags[index].base_address = base_address + *offset as u32;
        }
    }

    // Budget checks, re-done here because indexing can only shrink things
    // before this point.
    if tag_data.len() as u64 > engine.memory_length() {
        return Err(MapError::SizeExceeded {
            what: "tag data section",
            size: tag_data.len() as u64,
            limit: engine.memory_length(),
        }
        .into());
    }
    let file_size = tag_data_offset as u64 + tag_data.len() as u64;
    if file_size > MAXIMUM_FILE_LENGTH {
        return Err(MapError::SizeExceeded {
            what: "cache file",
            size: file_size,
            limit: MAXIMUM_FILE_LENGTH,
        }
        .into());
    }

    let header = CacheFileHeader {
        engine,
        file_size: file_size as u32,
        compressed_padding: 0,
        tag_data_offset: tag_data_offset as u32,
        tag_data_size: tag_data.len() as u32,
        decompressed_file_size: 0,
        compression_type: CompressionType::Uncompressed,
        name: TagString::new(scenario_base_name(&workload.parameters.scenario)),
        build: TagString::new(build_string(engine)),
        map_type: workload.cache_file_type.unwrap_or_default(),
        crc32,
    };

    let mut image = Vec::with_capacity(file_size as usize);
    header.write(&mut image)?;
    image.extend_from_slice(&asset_section);
    for record in &workload.model_vertices {
        image.extend_from_slice(record);
    }
    for index in &workload.model_indices {
        image.extend_from_slice(&index.to_le_bytes());
    }
    image.resize(tag_data_offset, 0);
    image.extend_from_slice(&tag_data);
    Ok(image)
}

/// Last `\`-separated component of the scenario path.
fn scenario_base_name(scenario: &str) -> &str {
    scenario
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(scenario)
}

const CRC_POLYNOMIAL: u32 = 0xEDB8_8320;

const fn make_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut value = index as u32;
        let mut bit = 0;
        while bit < 8 {
            value = if value & 1 != 0 {
                (value >> 1) ^ CRC_POLYNOMIAL
            } else {
                value >> 1
            };
            bit += 1;
        }
        table[index] = value;
        index += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = make_crc_table();

/// Computes the four bytes which, appended to `data`, drive its CRC32 to
/// `desired`. The standard table-walk preimage: the table's top bytes are a
/// bijection, so each step of the desired register can be peeled back.
fn forge_crc32(data: &[u8], desired: u32) -> [u8; 4] {
    let register = crc32fast::hash(data) ^ 0xFFFF_FFFF;
    let mut value = desired ^ 0xFFFF_FFFF;
    for _ in 0..4 {
        let top = (value >> 24) as u8;
        let index = (0..256u32)
            .find(|&candidate| (CRC_TABLE[candidate as usize] >> 24) as u8 == top)
            .unwrap_or(0);
        value = ((value ^ CRC_TABLE[index as usize]) << 8) | index;
    }
    (value ^ register).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_table_top_bytes_are_a_bijection() {
        let mut seen = [false; 256];
        for entry in CRC_TABLE {
            let top = (entry >> 24) as usize;
            assert!(!seen[top]);
            seen[top] = true;
        }
    }

    #[test]
    fn forged_suffix_produces_the_desired_crc() {
        for (data, desired) in [
            (&b"the quick brown fox"[..], 0xDEAD_BEEFu32),
            (&b""[..], 0x0000_0000),
            (&b"\x00\x01\x02\x03"[..], 0xFFFF_FFFF),
            (&b"cache file tag data"[..], 0x1234_5678),
        ] {
            let patch = forge_crc32(data, desired);
            let mut forged = data.to_vec();
            forged.extend_from_slice(&patch);
            assert_eq!(crc32fast::hash(&forged), desired);
        }
    }

    #[test]
    fn alignment_rounds_up_to_four() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(70), 72);
    }
}
