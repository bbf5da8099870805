//! Layout primitives shared by tag files and the compiled cache image.
//!
//! Everything the engine memory-maps is little-endian and exactly sized, so
//! each primitive here owns its wire representation: a `read` that consumes
//! the exact byte count and a `write` that produces it.

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

use crate::Result;
use crate::common::extensions::{ReaderExt, WriterExt};

pub mod class;

/// Null value for 16-bit indices inside tag data.
pub const NULL_INDEX: u16 = 0xFFFF;

/// Byte length of a [`TagString`] on the wire.
pub const TAG_STRING_LENGTH: usize = 32;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
/// 32-byte NUL-padded string used for short names inside tags.
pub struct TagString(String);

impl TagString {
    /// Wraps a string, truncating it to the 31 bytes the wire form can
    /// carry beside its terminator.
    pub fn new(value: &str) -> Self {
        let mut owned = String::from(value);
        if owned.len() >= TAG_STRING_LENGTH {
            let mut cut = TAG_STRING_LENGTH - 1;
            while !owned.is_char_boundary(cut) {
                cut -= 1;
            }
            owned.truncate(cut);
        }
        Self(owned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self(reader.read_fixed_string(TAG_STRING_LENGTH)?))
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_fixed_string(&self.0, TAG_STRING_LENGTH)
    }
}

impl fmt::Display for TagString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
/// Three-float 3D point, 12 bytes on the wire.
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3D {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn add(&self, other: &Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(&self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    /// Point `t` of the way from `self` to `other`.
    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        self.add(&other.sub(self).scale(t))
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            x: reader.read_f32::<LE>()?,
            y: reader.read_f32::<LE>()?,
            z: reader.read_f32::<LE>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_f32::<LE>(self.x)?;
        writer.write_f32::<LE>(self.y)?;
        writer.write_f32::<LE>(self.z)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Quaternion in `i, j, k, w` wire order, 16 bytes.
pub struct Quaternion {
    pub i: f32,
    pub j: f32,
    pub k: f32,
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            i: 0.0,
            j: 0.0,
            k: 0.0,
            w: 1.0,
        }
    }
}

impl Quaternion {
    /// Converts to a row-major rotation matrix.
    pub fn to_matrix(self) -> Matrix3x3 {
        let Self { i, j, k, w } = self;
        Matrix3x3 {
            m: [
                [
                    1.0 - 2.0 * (j * j + k * k),
                    2.0 * (i * j - k * w),
                    2.0 * (i * k + j * w),
                ],
                [
                    2.0 * (i * j + k * w),
                    1.0 - 2.0 * (i * i + k * k),
                    2.0 * (j * k - i * w),
                ],
                [
                    2.0 * (i * k - j * w),
                    2.0 * (j * k + i * w),
                    1.0 - 2.0 * (i * i + j * j),
                ],
            ],
        }
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            i: reader.read_f32::<LE>()?,
            j: reader.read_f32::<LE>()?,
            k: reader.read_f32::<LE>()?,
            w: reader.read_f32::<LE>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_f32::<LE>(self.i)?;
        writer.write_f32::<LE>(self.j)?;
        writer.write_f32::<LE>(self.k)?;
        writer.write_f32::<LE>(self.w)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
/// Row-major 3×3 matrix, 36 bytes on the wire.
pub struct Matrix3x3 {
    pub m: [[f32; 3]; 3],
}

impl Default for Matrix3x3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix3x3 {
    pub const IDENTITY: Self = Self {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    pub fn multiply(&self, other: &Self) -> Self {
        let mut out = [[0.0f32; 3]; 3];
        for (row, out_row) in out.iter_mut().enumerate() {
            for (column, cell) in out_row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[row][k] * other.m[k][column]).sum();
            }
        }
        Self { m: out }
    }

    pub fn rotate(&self, point: &Point3D) -> Point3D {
        Point3D {
            x: self.m[0][0] * point.x + self.m[0][1] * point.y + self.m[0][2] * point.z,
            y: self.m[1][0] * point.x + self.m[1][1] * point.y + self.m[1][2] * point.z,
            z: self.m[2][0] * point.x + self.m[2][1] * point.y + self.m[2][2] * point.z,
        }
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut m = [[0.0f32; 3]; 3];
        for row in &mut m {
            for cell in row.iter_mut() {
                *cell = reader.read_f32::<LE>()?;
            }
        }
        Ok(Self { m })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for row in &self.m {
            for cell in row {
                writer.write_f32::<LE>(*cell)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// 32-bit integer whose MSB distinguishes a sentinel: with the flag set the
/// low bits carry a leaf index, and the all-ones pattern is null.
pub struct FlaggedU32(u32);

impl Default for FlaggedU32 {
    fn default() -> Self {
        Self::NULL
    }
}

impl FlaggedU32 {
    pub const NULL: Self = Self(u32::MAX);
    const FLAG: u32 = 1 << 31;

    /// Plain (unflagged) value.
    pub fn plain(value: u32) -> Self {
        Self(value & !Self::FLAG)
    }

    /// Value with the sentinel flag set.
    pub fn flagged(value: u32) -> Self {
        Self(value | Self::FLAG)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    pub fn is_flagged(self) -> bool {
        !self.is_null() && self.0 & Self::FLAG != 0
    }

    /// Value with the flag bit masked off.
    pub fn value(self) -> u32 {
        self.0 & !Self::FLAG
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self(reader.read_u32::<LE>()?))
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.0)?;
        Ok(())
    }
}

/// Salt added to a tag's array index to form the upper half of its id.
const TAG_ID_SALT_BASE: u16 = 0xE174;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// 32-bit tag id: low 16 bits index the workload's tag array, high 16 bits
/// are a generation salt. `0xFFFFFFFF` is null.
pub struct TagId(u32);

impl Default for TagId {
    fn default() -> Self {
        Self::NULL
    }
}

impl TagId {
    pub const NULL: Self = Self(u32::MAX);

    /// Id of the tag at `index`, salted by position.
    pub fn from_index(index: u16) -> Self {
        let salt = TAG_ID_SALT_BASE.wrapping_add(index);
        Self(u32::from(salt) << 16 | u32::from(index))
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    /// Index half of the id, or `None` for null.
    pub fn index(self) -> Option<u16> {
        if self.is_null() {
            None
        } else {
            Some((self.0 & 0xFFFF) as u16)
        }
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self(reader.read_u32::<LE>()?))
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LE>(self.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tag_string_is_exactly_32_bytes() {
        let mut buffer = Vec::new();
        TagString::new("frg level").write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), TAG_STRING_LENGTH);
        let read = TagString::read(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(read.as_str(), "frg level");
    }

    #[test]
    fn tag_string_truncates_oversized_names() {
        let long = "x".repeat(40);
        let value = TagString::new(&long);
        assert_eq!(value.as_str().len(), TAG_STRING_LENGTH - 1);
    }

    #[test]
    fn tag_id_packs_index_and_salt() {
        let id = TagId::from_index(0);
        assert_eq!(id.bits(), 0xE174_0000);
        assert_eq!(id.index(), Some(0));

        let id = TagId::from_index(5);
        assert_eq!(id.bits(), 0xE179_0005);
        assert_eq!(id.index(), Some(5));

        assert_eq!(TagId::NULL.index(), None);
    }

    #[test]
    fn flagged_int_distinguishes_leaf_and_null() {
        assert!(FlaggedU32::NULL.is_null());
        assert!(!FlaggedU32::NULL.is_flagged());

        let leaf = FlaggedU32::flagged(3);
        assert!(leaf.is_flagged());
        assert_eq!(leaf.value(), 3);

        let node = FlaggedU32::plain(7);
        assert!(!node.is_flagged());
        assert!(!node.is_null());
        assert_eq!(node.value(), 7);
    }

    #[test]
    fn identity_quaternion_is_identity_matrix() {
        let matrix = Quaternion::default().to_matrix();
        assert_eq!(matrix, Matrix3x3::IDENTITY);
    }

    #[test]
    fn matrix_rotates_points() {
        // 90 degree rotation about +z maps +x to +y.
        let half = std::f32::consts::FRAC_1_SQRT_2;
        let rotation = Quaternion {
            i: 0.0,
            j: 0.0,
            k: half,
            w: half,
        }
        .to_matrix();
        let rotated = rotation.rotate(&Point3D::new(1.0, 0.0, 0.0));
        assert!(rotated.x.abs() < 1e-6);
        assert!((rotated.y - 1.0).abs() < 1e-6);
        assert!(rotated.z.abs() < 1e-6);
    }
}
