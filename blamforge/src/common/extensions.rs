//! Extensions to [`Read`] and [`Write`] for the fixed-layout strings and
//! record lists that tag files and cache images are built from.
//!
//! * [`read_fixed_string`](`ReaderExt::read_fixed_string`) /
//!   [`write_fixed_string`](`WriterExt::write_fixed_string`): NUL-padded
//!   strings of an exact byte length.
//! * [`read_prefixed_string`](`ReaderExt::read_prefixed_string`) /
//!   [`write_prefixed_string`](`WriterExt::write_prefixed_string`): strings
//!   carried with a 16-bit length, used by tag file bodies.
//! * [`read_enumerable`](`ReaderExt::read_enumerable`): reads a type
//!   implementing [`Enumerable`] a given number of times into a [`Vec`].

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::Result;

/// Trait for record types that can be read sequentially from a reader.
pub trait Enumerable {
    /// Reads data from the given reader and updates the implementing type.
    ///
    /// # Errors
    /// - If the reader fails to read the exact number of bytes [`ReadError`](`crate::Error::ReadError`)
    fn read<R: ReaderExt>(&mut self, reader: &mut R) -> Result<()>;
}

/// Extension trait for [`Read`] to add the custom reading methods.
pub trait ReaderExt: Read {
    /// Reads a fixed-length NUL-padded UTF-8 string.
    ///
    /// Exactly `length` bytes are consumed; the string ends at the first
    /// NUL byte.
    ///
    /// # Errors
    /// - If the reader fails to read the exact number of bytes [`ReadError`](`crate::Error::ReadError`)
    /// - If the bytes before the terminator are not valid UTF-8 [`Utf8ReadingError`](`crate::Error::Utf8ReadingError`)
    fn read_fixed_string(&mut self, length: usize) -> Result<String> {
        let mut buffer = vec![0; length];
        self.read_exact(&mut buffer)?;
        let end = buffer.iter().position(|&b| b == 0).unwrap_or(length);
        buffer.truncate(end);
        Ok(String::from_utf8(buffer)?)
    }

    /// Reads a string carried as a 16-bit little-endian length followed by
    /// that many UTF-8 bytes.
    ///
    /// # Errors
    /// - If the reader fails to read the exact number of bytes [`ReadError`](`crate::Error::ReadError`)
    /// - If the bytes are not valid UTF-8 [`Utf8ReadingError`](`crate::Error::Utf8ReadingError`)
    fn read_prefixed_string(&mut self) -> Result<String> {
        let length = self.read_u16::<LE>()?;
        let mut buffer = vec![0; usize::from(length)];
        self.read_exact(&mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Reads multiple instances of an enumerable type into a vector.
    ///
    /// # Errors
    /// - If the reader fails to read the exact number of bytes [`ReadError`](`crate::Error::ReadError`)
    fn read_enumerable<T: Default + Enumerable>(&mut self, count: u64) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        let mut enumerables = Vec::new();
        enumerables.reserve_exact(usize::try_from(count)?);
        for _ in 0..count {
            let mut enumerable = T::default();
            enumerable.read(self)?;
            enumerables.push(enumerable);
        }
        Ok(enumerables)
    }
}

impl<R: Read> ReaderExt for R {}

/// Extension trait for [`Write`], mirroring [`ReaderExt`].
pub trait WriterExt: Write {
    /// Writes a NUL-padded string of exactly `length` bytes.
    ///
    /// Strings longer than `length - 1` bytes are truncated so the
    /// terminator always fits.
    ///
    /// # Errors
    /// - If the writer fails [`ReadError`](`crate::Error::ReadError`)
    fn write_fixed_string(&mut self, value: &str, length: usize) -> Result<()> {
        let mut buffer = vec![0u8; length];
        let bytes = value.as_bytes();
        let copied = bytes.len().min(length.saturating_sub(1));
        buffer[..copied].copy_from_slice(&bytes[..copied]);
        self.write_all(&buffer)?;
        Ok(())
    }

    /// Writes a string as a 16-bit little-endian length followed by its
    /// UTF-8 bytes.
    ///
    /// # Errors
    /// - If the string is longer than a 16-bit length can carry [`TryFromIntError`](`crate::Error::TryFromIntError`)
    /// - If the writer fails [`ReadError`](`crate::Error::ReadError`)
    fn write_prefixed_string(&mut self, value: &str) -> Result<()> {
        self.write_u16::<LE>(u16::try_from(value.len())?)?;
        self.write_all(value.as_bytes())?;
        Ok(())
    }
}

impl<W: Write> WriterExt for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fixed_string_round_trip() {
        let mut buffer = Vec::new();
        buffer.write_fixed_string("blood gulch", 32).unwrap();
        assert_eq!(buffer.len(), 32);
        let mut reader = Cursor::new(&buffer);
        assert_eq!(reader.read_fixed_string(32).unwrap(), "blood gulch");
    }

    #[test]
    fn fixed_string_truncates_to_leave_a_terminator() {
        let mut buffer = Vec::new();
        buffer.write_fixed_string("abcdef", 4).unwrap();
        assert_eq!(buffer, [b'a', b'b', b'c', 0]);
    }

    #[test]
    fn prefixed_string_round_trip() {
        let mut buffer = Vec::new();
        buffer
            .write_prefixed_string(r"levels\test\tutorial")
            .unwrap();
        let mut reader = Cursor::new(&buffer);
        assert_eq!(
            reader.read_prefixed_string().unwrap(),
            r"levels\test\tutorial"
        );
    }

    #[test]
    fn enumerable_reads_count_records() {
        #[derive(Default)]
        struct Record {
            value: u32,
        }
        impl Enumerable for Record {
            fn read<R: ReaderExt>(&mut self, reader: &mut R) -> Result<()> {
                self.value = reader.read_u32::<LE>()?;
                Ok(())
            }
        }

        let data = b"\x01\x00\x00\x00\x02\x00\x00\x00\x03\x00\x00\x00";
        let mut reader = Cursor::new(&data[..]);
        let records = reader.read_enumerable::<Record>(3).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].value, 3);
    }
}
