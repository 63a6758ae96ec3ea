//! PNG ancillary-chunk carriage for PNGB modules.
//!
//! A module travels inside a `pnGb` chunk (ancillary, private, safe-to-copy
//! per the PNG naming rules); an optional platform executor image uses
//! `pnGx`. The chunk payload is one version byte, one flags byte (bit 0 =
//! raw-DEFLATE compressed), then the module bytes. The chunk sits between
//! IHDR and the first IDAT so stock decoders skip straight over it.

use std::io::Read;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;
use thiserror::Error;

/// Chunk type carrying the module.
pub const MODULE_CHUNK: [u8; 4] = *b"pnGb";
/// Chunk type carrying the optional executor image.
pub const EXECUTOR_CHUNK: [u8; 4] = *b"pnGx";

pub const PAYLOAD_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0x01;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Default bound on the decompressed payload.
pub const DEFAULT_SIZE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("not a PNG file")]
    MalformedPng,
    #[error("no module chunk present")]
    MissingChunk,
    #[error("chunk CRC mismatch")]
    CrcMismatch,
    #[error("unsupported chunk payload version {0}")]
    UnsupportedPayloadVersion(u8),
    #[error("payload decompression failed")]
    DecompressFailed,
    #[error("decompressed payload exceeds the {limit}-byte limit")]
    TooLarge { limit: usize },
}

/// Parsed metadata of an embedded module chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub version: u8,
    pub compressed: bool,
    pub payload_len: usize,
}

/// One raw chunk as it sits in the file.
struct RawChunk<'p> {
    ty: [u8; 4],
    data: &'p [u8],
    /// Byte range of the whole chunk record (length through CRC).
    range: std::ops::Range<usize>,
}

fn chunks(png: &[u8]) -> Result<Vec<RawChunk<'_>>, ChunkError> {
    if png.len() < PNG_SIGNATURE.len() || png[..8] != PNG_SIGNATURE {
        return Err(ChunkError::MalformedPng);
    }
    let mut out = Vec::new();
    let mut pos = PNG_SIGNATURE.len();
    while pos < png.len() {
        if pos + 8 > png.len() {
            return Err(ChunkError::MalformedPng);
        }
        let len = u32::from_be_bytes([png[pos], png[pos + 1], png[pos + 2], png[pos + 3]]) as usize;
        let ty = [png[pos + 4], png[pos + 5], png[pos + 6], png[pos + 7]];
        let data_start = pos + 8;
        let crc_end = data_start
            .checked_add(len)
            .and_then(|end| end.checked_add(4))
            .ok_or(ChunkError::MalformedPng)?;
        if crc_end > png.len() {
            return Err(ChunkError::MalformedPng);
        }
        out.push(RawChunk {
            ty,
            data: &png[data_start..data_start + len],
            range: pos..crc_end,
        });
        pos = crc_end;
    }
    Ok(out)
}

fn crc(ty: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(ty);
    hasher.update(data);
    hasher.finalize()
}

fn write_chunk(out: &mut Vec<u8>, ty: [u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&ty);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc(&ty, data).to_be_bytes());
}

fn find_chunk<'p>(png: &'p [u8], ty: [u8; 4]) -> Result<RawChunk<'p>, ChunkError> {
    chunks(png)?
        .into_iter()
        .find(|chunk| chunk.ty == ty)
        .ok_or(ChunkError::MissingChunk)
}

/// Verify the stored CRC of `chunk` against its contents.
fn check_crc(png: &[u8], chunk: &RawChunk<'_>) -> Result<(), ChunkError> {
    let crc_at = chunk.range.end - 4;
    let stored = u32::from_be_bytes([png[crc_at], png[crc_at + 1], png[crc_at + 2], png[crc_at + 3]]);
    if stored != crc(&chunk.ty, chunk.data) {
        return Err(ChunkError::CrcMismatch);
    }
    Ok(())
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(bytes);
    encoder.finish().unwrap_or_default()
}

fn inflate(bytes: &[u8], limit: usize) -> Result<Vec<u8>, ChunkError> {
    let mut decoder = DeflateDecoder::new(bytes).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| ChunkError::DecompressFailed)?;
    if out.len() > limit {
        return Err(ChunkError::TooLarge { limit });
    }
    Ok(out)
}

/// Insert (or replace) the module chunk right after IHDR. The previous
/// module chunk, if any, is dropped.
pub fn embed(png: &[u8], pngb: &[u8], compress: bool) -> Result<Vec<u8>, ChunkError> {
    embed_as(png, MODULE_CHUNK, pngb, compress)
}

/// Embed a platform executor image in its own chunk.
pub fn embed_executor(png: &[u8], executor: &[u8], compress: bool) -> Result<Vec<u8>, ChunkError> {
    embed_as(png, EXECUTOR_CHUNK, executor, compress)
}

fn embed_as(png: &[u8], ty: [u8; 4], blob: &[u8], compress: bool) -> Result<Vec<u8>, ChunkError> {
    let parsed = chunks(png)?;
    if parsed.first().map(|chunk| &chunk.ty) != Some(b"IHDR") {
        return Err(ChunkError::MalformedPng);
    }

    let mut payload = Vec::with_capacity(blob.len() + 2);
    payload.push(PAYLOAD_VERSION);
    if compress {
        payload.push(FLAG_COMPRESSED);
        payload.extend_from_slice(&deflate(blob));
    } else {
        payload.push(0);
        payload.extend_from_slice(blob);
    }

    let mut out = Vec::with_capacity(png.len() + payload.len() + 12);
    out.extend_from_slice(&PNG_SIGNATURE);
    for (index, chunk) in parsed.iter().enumerate() {
        if chunk.ty == ty {
            continue;
        }
        out.extend_from_slice(&png[chunk.range.clone()]);
        if index == 0 {
            write_chunk(&mut out, ty, &payload);
        }
    }
    Ok(out)
}

/// Extract the module bytes with the default size bound.
pub fn extract(png: &[u8]) -> Result<Vec<u8>, ChunkError> {
    extract_with_limit(png, DEFAULT_SIZE_LIMIT)
}

/// Extract the module bytes, bounding decompression at `limit` bytes.
pub fn extract_with_limit(png: &[u8], limit: usize) -> Result<Vec<u8>, ChunkError> {
    extract_chunk(png, MODULE_CHUNK, limit)
}

/// Extract the executor image, if embedded.
pub fn extract_executor(png: &[u8], limit: usize) -> Result<Vec<u8>, ChunkError> {
    extract_chunk(png, EXECUTOR_CHUNK, limit)
}

fn extract_chunk(png: &[u8], ty: [u8; 4], limit: usize) -> Result<Vec<u8>, ChunkError> {
    let chunk = find_chunk(png, ty)?;
    check_crc(png, &chunk)?;
    let (version, flags, payload) = split_payload(chunk.data)?;
    if version != PAYLOAD_VERSION {
        return Err(ChunkError::UnsupportedPayloadVersion(version));
    }
    if flags & FLAG_COMPRESSED != 0 {
        inflate(payload, limit)
    } else {
        Ok(payload.to_vec())
    }
}

fn split_payload(data: &[u8]) -> Result<(u8, u8, &[u8]), ChunkError> {
    if data.len() < 2 {
        return Err(ChunkError::MalformedPng);
    }
    Ok((data[0], data[1], &data[2..]))
}

/// Whether a module chunk is present (without validating it).
pub fn has_chunk(png: &[u8]) -> bool {
    find_chunk(png, MODULE_CHUNK).is_ok()
}

/// Metadata of the embedded module chunk.
pub fn chunk_info(png: &[u8]) -> Result<ChunkInfo, ChunkError> {
    let chunk = find_chunk(png, MODULE_CHUNK)?;
    check_crc(png, &chunk)?;
    let (version, flags, payload) = split_payload(chunk.data)?;
    Ok(ChunkInfo {
        version,
        compressed: flags & FLAG_COMPRESSED != 0,
        payload_len: payload.len(),
    })
}

/// A minimal 1x1 grayscale PNG, handy for tests and size probes.
pub fn tiny_png() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&PNG_SIGNATURE);
    // IHDR: 1x1, bit depth 8, grayscale.
    let ihdr = [0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0];
    write_chunk(&mut out, *b"IHDR", &ihdr);
    // IDAT: one zlib-wrapped scanline (filter byte + one pixel).
    let mut idat = vec![0x78, 0x01];
    let raw = [0u8, 0u8];
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    let _ = encoder.write_all(&raw);
    idat.extend_from_slice(&encoder.finish().unwrap_or_default());
    let adler = adler32(&raw);
    idat.extend_from_slice(&adler.to_be_bytes());
    write_chunk(&mut out, *b"IDAT", &idat);
    write_chunk(&mut out, *b"IEND", &[]);
    out
}

fn adler32(bytes: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in bytes {
        a = (a + u32::from(byte)) % 65521;
        b = (b + a) % 65521;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_places_chunk_after_ihdr() {
        let png = tiny_png();
        let out = embed(&png, &[1, 2, 3], false).unwrap();
        let parsed = chunks(&out).unwrap();
        assert_eq!(&parsed[0].ty, b"IHDR");
        assert_eq!(parsed[1].ty, MODULE_CHUNK);
        assert_eq!(&parsed[2].ty, b"IDAT");
    }

    #[test]
    fn embed_extract_roundtrip() {
        let png = tiny_png();
        let blob: Vec<u8> = (0..=255u8).cycle().take(500).collect();
        let out = embed(&png, &blob, false).unwrap();
        assert!(has_chunk(&out));
        assert_eq!(extract(&out).unwrap(), blob);
        let info = chunk_info(&out).unwrap();
        assert_eq!(info.version, PAYLOAD_VERSION);
        assert!(!info.compressed);
        assert_eq!(info.payload_len, 500);
    }

    #[test]
    fn compressed_roundtrip() {
        let png = tiny_png();
        let blob = vec![0x5a; 4096];
        let out = embed(&png, &blob, true).unwrap();
        let info = chunk_info(&out).unwrap();
        assert!(info.compressed);
        assert!(info.payload_len < blob.len());
        assert_eq!(extract(&out).unwrap(), blob);
    }

    #[test]
    fn replacing_an_existing_chunk() {
        let png = tiny_png();
        let first = embed(&png, &[1], false).unwrap();
        let second = embed(&first, &[2, 2], false).unwrap();
        assert_eq!(extract(&second).unwrap(), vec![2, 2]);
        let count = chunks(&second)
            .unwrap()
            .iter()
            .filter(|chunk| chunk.ty == MODULE_CHUNK)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn corrupted_crc_is_detected() {
        let png = tiny_png();
        let mut out = embed(&png, &[9; 16], false).unwrap();
        // Flip one payload byte inside the module chunk.
        let parsed_range = {
            let parsed = chunks(&out).unwrap();
            parsed
                .iter()
                .find(|chunk| chunk.ty == MODULE_CHUNK)
                .unwrap()
                .range
                .clone()
        };
        out[parsed_range.start + 10] ^= 0xff;
        assert_eq!(extract(&out), Err(ChunkError::CrcMismatch));
    }

    #[test]
    fn missing_chunk_and_bad_signature() {
        assert_eq!(extract(&tiny_png()), Err(ChunkError::MissingChunk));
        assert_eq!(extract(b"not a png"), Err(ChunkError::MalformedPng));
    }

    #[test]
    fn size_limit_applies_to_decompression() {
        let png = tiny_png();
        let blob = vec![0u8; 1 << 16];
        let out = embed(&png, &blob, true).unwrap();
        assert_eq!(
            extract_with_limit(&out, 1024),
            Err(ChunkError::TooLarge { limit: 1024 })
        );
    }

    #[test]
    fn executor_chunk_is_independent()  {
        let png = tiny_png();
        let with_module = embed(&png, &[1, 2, 3], false).unwrap();
        let with_both = embed_executor(&with_module, &[7; 32], false).unwrap();
        assert_eq!(extract(&with_both).unwrap(), vec![1, 2, 3]);
        assert_eq!(extract_executor(&with_both, 1024).unwrap(), vec![7; 32]);
    }
}
