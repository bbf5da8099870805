//! Shared resource maps (bitmaps.map, sounds.map, loc.map): flat arrays of
//! `(virtual path, payload)` records behind an index header. The build
//! consumes them read-only; the writer exists for tooling and tests.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use num_enum::TryFromPrimitive;
use std::io::{Cursor, Seek, SeekFrom};
use std::path::Path;

use crate::Result;
use crate::common::errors::MapError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
/// Which of the three shared maps a file is.
pub enum ResourceMapKind {
    Bitmaps = 0,
    Sounds = 1,
    Loc = 2,
}

impl ResourceMapKind {
    /// Conventional file name inside the maps directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Bitmaps => "bitmaps.map",
            Self::Sounds => "sounds.map",
            Self::Loc => "loc.map",
        }
    }
}

#[derive(Clone, Debug)]
/// One payload inside a resource map.
pub struct Resource {
    /// Virtual tag path the resource was built from.
    pub path: String,
    /// Offset of the payload within the resource map file.
    pub data_offset: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
/// A parsed resource map.
pub struct ResourceMap {
    pub kind: ResourceMapKind,
    pub resources: Vec<Resource>,
}

impl ResourceMap {
    pub fn new(kind: ResourceMapKind) -> Self {
        Self {
            kind,
            resources: Vec::new(),
        }
    }

    /// Parses a resource map image.
    ///
    /// # Errors
    /// - If the kind code or any offset fails a sanity bound [`MapError`](`crate::common::errors::MapError`)
    /// - If the reader fails [`ReadError`](`crate::Error::ReadError`)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(bytes);
        let kind = ResourceMapKind::try_from(reader.read_u32::<LE>()?)
            .map_err(|error| MapError::Invalid(error.to_string()))?;
        let paths_offset = reader.read_u32::<LE>()?;
        let index_offset = reader.read_u32::<LE>()?;
        let count = reader.read_u32::<LE>()?;

        let mut map = Self::new(kind);
        reader.seek(SeekFrom::Start(u64::from(index_offset)))?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let path_offset = reader.read_u32::<LE>()?;
            let size = reader.read_u32::<LE>()?;
            let data_offset = reader.read_u32::<LE>()?;
            entries.push((path_offset, size, data_offset));
        }
        for (path_offset, size, data_offset) in entries {
            let path_start = paths_offset
                .checked_add(path_offset)
                .map(|offset| offset as usize)
                .filter(|&offset| offset < bytes.len())
                .ok_or_else(|| MapError::Invalid(String::from("resource path out of bounds")))?;
            let path_bytes: Vec<u8> = bytes[path_start..]
                .iter()
                .take_while(|&&byte| byte != 0)
                .copied()
                .collect();
            let path = String::from_utf8(path_bytes)?;

            let data_start = data_offset as usize;
            let data_end = data_start
                .checked_add(size as usize)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| MapError::Invalid(String::from("resource data out of bounds")))?;
            map.resources.push(Resource {
                path,
                data_offset,
                data: bytes[data_start..data_end].to_vec(),
            });
        }
        Ok(map)
    }

    /// Reads and parses `<maps_dir>/<kind file name>`, or `None` when the
    /// file does not exist.
    pub fn load(maps_directory: &Path, kind: ResourceMapKind) -> Result<Option<Self>> {
        let path = maps_directory.join(kind.file_name());
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(Self::parse(&bytes)?))
    }

    /// Serialises the map: header, path table, index, then payloads.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut paths = Vec::new();
        let mut path_offsets = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            path_offsets.push(paths.len() as u32);
            paths.extend_from_slice(resource.path.as_bytes());
            paths.push(0);
        }

        let paths_offset = 16u32;
        let index_offset = paths_offset + paths.len() as u32;
        let data_offset = index_offset + 12 * self.resources.len() as u32;

        let mut out = Vec::new();
        out.write_u32::<LE>(self.kind as u32)?;
        out.write_u32::<LE>(paths_offset)?;
        out.write_u32::<LE>(index_offset)?;
        out.write_u32::<LE>(self.resources.len() as u32)?;
        out.extend_from_slice(&paths);

        let mut running = data_offset;
        for (resource, path_offset) in self.resources.iter().zip(&path_offsets) {
            out.write_u32::<LE>(*path_offset)?;
            out.write_u32::<LE>(resource.data.len() as u32)?;
            out.write_u32::<LE>(running)?;
            running += resource.data.len() as u32;
        }
        for resource in &self.resources {
            out.extend_from_slice(&resource.data);
        }
        Ok(out)
    }

    /// Finds a resource by virtual path.
    pub fn find(&self, path: &str) -> Option<(u32, &Resource)> {
        self.resources
            .iter()
            .position(|resource| resource.path == path)
            .map(|index| (index as u32, &self.resources[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> ResourceMap {
        let mut map = ResourceMap::new(ResourceMapKind::Bitmaps);
        map.resources.push(Resource {
            path: String::from(r"ui\shell\bitmaps\cursor"),
            data_offset: 0,
            data: vec![1, 2, 3, 4],
        });
        map.resources.push(Resource {
            path: String::from(r"levels\test\bitmaps\ground"),
            data_offset: 0,
            data: vec![9, 9],
        });
        map
    }

    #[test]
    fn round_trips_through_bytes() {
        let bytes = sample_map().to_bytes().unwrap();
        let parsed = ResourceMap::parse(&bytes).unwrap();
        assert_eq!(parsed.kind, ResourceMapKind::Bitmaps);
        assert_eq!(parsed.resources.len(), 2);
        assert_eq!(parsed.resources[0].path, r"ui\shell\bitmaps\cursor");
        assert_eq!(parsed.resources[0].data, vec![1, 2, 3, 4]);
        assert_eq!(parsed.resources[1].data, vec![9, 9]);
        // Recorded offsets point into the file image.
        let offset = parsed.resources[1].data_offset as usize;
        assert_eq!(&bytes[offset..offset + 2], &[9, 9]);
    }

    #[test]
    fn find_matches_full_virtual_paths() {
        let map = sample_map();
        let (index, resource) = map.find(r"levels\test\bitmaps\ground").unwrap();
        assert_eq!(index, 1);
        assert_eq!(resource.data, vec![9, 9]);
        assert!(map.find(r"levels\test\bitmaps").is_none());
    }

    #[test]
    fn load_returns_none_for_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            ResourceMap::load(dir.path(), ResourceMapKind::Sounds)
                .unwrap()
                .is_none()
        );

        std::fs::write(
            dir.path().join("sounds.map"),
            ResourceMap::new(ResourceMapKind::Sounds).to_bytes().unwrap(),
        )
        .unwrap();
        let loaded = ResourceMap::load(dir.path(), ResourceMapKind::Sounds)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.kind, ResourceMapKind::Sounds);
        assert!(loaded.resources.is_empty());
    }

    #[test]
    fn truncated_maps_are_rejected() {
        let mut bytes = sample_map().to_bytes().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(ResourceMap::parse(&bytes).is_err());
    }
}
