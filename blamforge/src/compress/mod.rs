//! Cache file compression: whole-image zstd for the PC and native targets,
//! a whole-image zlib stream for Xbox, and the chunked parallel "ceaflate"
//! container used for streaming decompression on some PC variants.

use byteorder::{ByteOrder, LE};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use std::sync::Mutex;

use crate::Result;
use crate::common::errors::{CompressionError, MapError};
use crate::map::{CacheFileEngine, CacheFileHeader, CompressionType, HEADER_SIZE};

/// Uncompressed bytes per ceaflate chunk.
pub const CEAFLATE_CHUNK_SIZE: usize = 0x20000;

/// Xbox images are padded so `(header + stream)` is a multiple of this.
const XBOX_PADDING_GRANULARITY: usize = 4096;

fn worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

fn zlib_level(level: i32) -> Compression {
    Compression::new(level.clamp(0, 9) as u32)
}

fn zstd_level(level: i32) -> i32 {
    level.clamp(1, 21)
}

/// Compresses a finished cache image with the scheme its engine calls for.
///
/// # Errors
/// - If the image is already compressed [`CompressionError::AlreadyCompressed`]
/// - If the header fails validation [`MapError`](`crate::common::errors::MapError`)
/// - If a codec fails [`CompressionError::CompressionFailure`]
pub fn compress_map(data: &[u8], compression_level: i32) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE {
        return Err(MapError::Invalid(String::from("image is smaller than its header")).into());
    }
    let mut header = CacheFileHeader::read(&mut &data[..])?;
    let body = &data[HEADER_SIZE..];

    match header.engine {
        CacheFileEngine::Xbox => {
            if header.decompressed_file_size != 0 {
                return Err(CompressionError::AlreadyCompressed.into());
            }
            let mut encoder = ZlibEncoder::new(Vec::new(), zlib_level(compression_level));
            encoder.write_all(body)?;
            let stream = encoder
                .finish()
                .map_err(|error| CompressionError::CompressionFailure(error.to_string()))?;

            let padding =
                XBOX_PADDING_GRANULARITY - ((HEADER_SIZE + stream.len()) % XBOX_PADDING_GRANULARITY);
            header.compressed_padding = padding as u32;
            header.decompressed_file_size = data.len() as u32;

            let mut out = Vec::with_capacity(HEADER_SIZE + stream.len() + padding);
            header.write(&mut out)?;
            out.extend_from_slice(&stream);
            out.resize(out.len() + padding, 0);
            Ok(out)
        }
        CacheFileEngine::Demo | CacheFileEngine::Retail | CacheFileEngine::CustomEdition => {
            // compressed_variant is total on these three engines.
            let Some(compressed_engine) = header.engine.compressed_variant() else {
                return Err(CompressionError::CompressionFailure(String::from(
                    "engine has no compressed variant",
                ))
                .into());
            };
            header.engine = compressed_engine;
            header.decompressed_file_size = data.len() as u32;
            write_zstd_image(&header, body, compression_level)
        }
        CacheFileEngine::DarkCirclet => {
            if header.compression_type != CompressionType::Uncompressed {
                return Err(CompressionError::AlreadyCompressed.into());
            }
            header.compression_type = CompressionType::Zstd;
            header.decompressed_file_size = data.len() as u32;
            write_zstd_image(&header, body, compression_level)
        }
        CacheFileEngine::DemoCompressed
        | CacheFileEngine::RetailCompressed
        | CacheFileEngine::CustomEditionCompressed => {
            Err(CompressionError::AlreadyCompressed.into())
        }
    }
}

fn write_zstd_image(header: &CacheFileHeader, body: &[u8], level: i32) -> Result<Vec<u8>> {
    let stream = zstd::bulk::compress(body, zstd_level(level))
        .map_err(|error| CompressionError::CompressionFailure(error.to_string()))?;
    let mut out = Vec::with_capacity(HEADER_SIZE + stream.len());
    header.write(&mut out)?;
    out.extend_from_slice(&stream);
    Ok(out)
}

/// Header rewritten back to the uncompressed form, as the decompress paths
/// emit it.
fn decompressed_header(header: &CacheFileHeader) -> Result<CacheFileHeader> {
    let mut out = header.clone();
    match header.engine {
        CacheFileEngine::DemoCompressed
        | CacheFileEngine::RetailCompressed
        | CacheFileEngine::CustomEditionCompressed => {
            // decompressed_variant is total on the compressed engines.
            let Some(engine) = header.engine.decompressed_variant() else {
                return Err(CompressionError::NotCompressed.into());
            };
            out.engine = engine;
        }
        CacheFileEngine::DarkCirclet => {
            if header.compression_type != CompressionType::Zstd {
                return Err(CompressionError::NotCompressed.into());
            }
        }
        CacheFileEngine::Xbox => {
            if header.decompressed_file_size == 0 {
                return Err(CompressionError::NotCompressed.into());
            }
        }
        _ => return Err(CompressionError::NotCompressed.into()),
    }
    if (header.decompressed_file_size as usize) < HEADER_SIZE {
        return Err(MapError::Invalid(String::from(
            "decompressed size is smaller than a header",
        ))
        .into());
    }
    out.compression_type = CompressionType::Uncompressed;
    out.compressed_padding = 0;
    out.decompressed_file_size = 0;
    Ok(out)
}

/// Decompresses a compressed cache image back to the bytes that were
/// originally compressed.
///
/// # Errors
/// - If the image is not compressed [`CompressionError::NotCompressed`]
/// - If the codec fails or the size check does not hold [`CompressionError::DecompressionFailure`] / [`CompressionError::SizeMismatch`]
pub fn decompress_map(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE {
        return Err(MapError::Invalid(String::from("image is smaller than its header")).into());
    }
    let header = CacheFileHeader::read(&mut &data[..])?;
    let expected_total = header.decompressed_file_size as usize;
    let out_header = decompressed_header(&header)?;
    let stream = &data[HEADER_SIZE..];

    let body = if header.engine == CacheFileEngine::Xbox {
        let mut body = Vec::with_capacity(expected_total - HEADER_SIZE);
        ZlibDecoder::new(stream).read_to_end(&mut body)?;
        body
    } else {
        zstd::bulk::decompress(stream, expected_total - HEADER_SIZE)
            .map_err(|error| CompressionError::DecompressionFailure(error.to_string()))?
    };
    if body.len() != expected_total - HEADER_SIZE {
        return Err(CompressionError::SizeMismatch {
            expected: expected_total as u64,
            found: (HEADER_SIZE + body.len()) as u64,
        }
        .into());
    }

    let mut out = Vec::with_capacity(expected_total);
    out_header.write(&mut out)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Streams a zstd-compressed map from `input` to `output` without holding
/// the whole image in memory. Returns the decompressed byte count.
pub fn decompress_map_stream<R: Read, W: Write>(mut input: R, mut output: W) -> Result<u64> {
    let mut header_bytes = vec![0u8; HEADER_SIZE];
    input.read_exact(&mut header_bytes)?;
    let header = CacheFileHeader::read(&mut header_bytes.as_slice())?;
    if header.engine == CacheFileEngine::Xbox {
        return Err(CompressionError::DecompressionFailure(String::from(
            "streaming decompression only covers zstd images",
        ))
        .into());
    }
    let out_header = decompressed_header(&header)?;
    out_header.write(&mut output)?;

    let mut decoder = zstd::stream::read::Decoder::new(input)
        .map_err(|error| CompressionError::DecompressionFailure(error.to_string()))?;
    let copied = std::io::copy(&mut decoder, &mut output)?;
    Ok(copied + HEADER_SIZE as u64)
}

struct CompressState {
    offset: usize,
    chunks: Vec<Option<Vec<u8>>>,
    failed: bool,
}

/// Cuts the input into 128 KiB chunks and deflates them on a worker pool.
/// The container is a chunk count, one offset per chunk, then
/// `(uncompressed size, zlib stream)` records in input order.
pub fn ceaflate_compress(input: &[u8], compression_level: i32) -> Result<Vec<u8>> {
    let state = Mutex::new(CompressState {
        offset: 0,
        chunks: Vec::new(),
        failed: false,
    });
    let level = zlib_level(compression_level);

    std::thread::scope(|scope| {
        for _ in 0..worker_count() {
            scope.spawn(|| ceaflate_compress_worker(&state, input, level));
        }
    });

    let state = state
        .into_inner()
        .map_err(|_| CompressionError::CompressionFailure(String::from("worker panicked")))?;
    if state.failed {
        return Err(CompressionError::CompressionFailure(String::from(
            "deflate failed on a chunk",
        ))
        .into());
    }

    let chunk_count = state.chunks.len();
    let mut out = Vec::new();
    out.extend_from_slice(&(chunk_count as u32).to_le_bytes());
    let mut running = (1 + chunk_count) * size_of::<u32>();
    for chunk in &state.chunks {
        out.extend_from_slice(&(running as u32).to_le_bytes());
        running += chunk.as_ref().map_or(0, Vec::len);
    }
    for chunk in state.chunks {
        match chunk {
            Some(chunk) => out.extend_from_slice(&chunk),
            None => {
                return Err(CompressionError::CompressionFailure(String::from(
                    "a chunk slot was never filled",
                ))
                .into());
            }
        }
    }
    Ok(out)
}

fn ceaflate_compress_worker(state: &Mutex<CompressState>, input: &[u8], level: Compression) {
    loop {
        // Reserve the next chunk slot under the lock so output order
        // matches input order regardless of completion order.
        let Ok(mut guard) = state.lock() else {
            return;
        };
        if guard.failed || guard.offset == input.len() {
            return;
        }
        let index = guard.chunks.len();
        guard.chunks.push(None);
        let start = guard.offset;
        let size = (input.len() - start).min(CEAFLATE_CHUNK_SIZE);
        guard.offset += size;
        drop(guard);

        let mut blob = Vec::with_capacity(size_of::<u32>() + size / 2);
        blob.extend_from_slice(&(size as u32).to_le_bytes());
        let mut encoder = ZlibEncoder::new(blob, level);
        let compressed = encoder
            .write_all(&input[start..start + size])
            .and_then(|()| encoder.finish());

        let Ok(mut guard) = state.lock() else {
            return;
        };
        match compressed {
            Ok(blob) => guard.chunks[index] = Some(blob),
            Err(_) => {
                guard.failed = true;
                return;
            }
        }
    }
}

/// Validates a ceaflate chunk table and returns the decompressed size.
pub fn ceaflate_size(input: &[u8]) -> Option<u64> {
    if input.len() < size_of::<u32>() {
        return None;
    }
    let count = LE::read_u32(input) as usize;
    if input.len() < (count + 1) * size_of::<u32>() {
        return None;
    }

    let mut total = 0u64;
    let mut current_offset = 0u64;
    for chunk in 0..count {
        let offset = u64::from(LE::read_u32(&input[(1 + chunk) * 4..]));
        // Offsets grow monotonically and every chunk header must fit.
        if offset + 4 > input.len() as u64 || offset < current_offset + 4 {
            return None;
        }
        total += u64::from(LE::read_u32(&input[offset as usize..]));
        current_offset = offset;
    }
    Some(total)
}

struct DecompressState {
    next_chunk: usize,
    outputs: Vec<Option<Vec<u8>>>,
    failed: bool,
}

/// Inflates a ceaflate container on a worker pool; the mirror of
/// [`ceaflate_compress`].
pub fn ceaflate_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let total = ceaflate_size(input)
        .ok_or_else(|| CompressionError::DecompressionFailure(String::from("bad chunk table")))?;
    let count = LE::read_u32(input) as usize;

    let state = Mutex::new(DecompressState {
        next_chunk: 0,
        outputs: vec![None; count],
        failed: false,
    });

    std::thread::scope(|scope| {
        for _ in 0..worker_count() {
            scope.spawn(|| ceaflate_decompress_worker(&state, input, count));
        }
    });

    let state = state
        .into_inner()
        .map_err(|_| CompressionError::DecompressionFailure(String::from("worker panicked")))?;
    if state.failed {
        return Err(CompressionError::DecompressionFailure(String::from(
            "inflate failed on a chunk",
        ))
        .into());
    }

    let mut out = Vec::with_capacity(total as usize);
    for chunk in state.outputs {
        match chunk {
            Some(chunk) => out.extend_from_slice(&chunk),
            None => {
                return Err(CompressionError::DecompressionFailure(String::from(
                    "a chunk slot was never filled",
                ))
                .into());
            }
        }
    }
    if out.len() as u64 != total {
        return Err(CompressionError::SizeMismatch {
            expected: total,
            found: out.len() as u64,
        }
        .into());
    }
    Ok(out)
}

fn ceaflate_decompress_worker(state: &Mutex<DecompressState>, input: &[u8], count: usize) {
    loop {
        let Ok(mut guard) = state.lock() else {
            return;
        };
        if guard.failed || guard.next_chunk == count {
            return;
        }
        let index = guard.next_chunk;
        guard.next_chunk += 1;
        drop(guard);

        let start = LE::read_u32(&input[(1 + index) * 4..]) as usize;
        let end = if index + 1 < count {
            LE::read_u32(&input[(2 + index) * 4..]) as usize
        } else {
            input.len()
        };
        let expected = LE::read_u32(&input[start..]) as usize;

        let mut chunk = Vec::with_capacity(expected);
        let inflated = ZlibDecoder::new(&input[start + 4..end])
            .read_to_end(&mut chunk)
            .map(|_| ());

        let Ok(mut guard) = state.lock() else {
            return;
        };
        if inflated.is_err() || chunk.len() != expected {
            guard.failed = true;
            return;
        }
        guard.outputs[index] = Some(chunk);
    }
}
