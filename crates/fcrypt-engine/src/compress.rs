//! GZIP (RFC 1952) stage. Compression always happens before encryption.

use std::io::{Read, Write};

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use fcrypt_core::{FcryptError, FcryptResult};
use fcrypt_crypto::{payload_error, pump, ChunkBuffer};

/// Wrap `dst` so bytes written through it are gzip-compressed.
pub fn gzip_writer<W: Write>(dst: W) -> GzEncoder<W> {
    GzEncoder::new(dst, Compression::default())
}

/// Wrap `dst` so gzip bytes written through it are decompressed.
pub fn gunzip_writer<W: Write>(dst: W) -> GzDecoder<W> {
    GzDecoder::new(dst)
}

/// Compress all of `src` into `dst`, returning `dst` and the bytes read.
pub fn compress_stream<R: Read + ?Sized, W: Write>(
    src: &mut R,
    dst: W,
    buf: &mut ChunkBuffer,
) -> FcryptResult<(W, u64)> {
    let mut encoder = gzip_writer(dst);
    let bytes_in = pump(src, &mut encoder, buf, |_| Ok(()))?;
    Ok((encoder.finish()?, bytes_in))
}

/// Decompress all of `src` into `dst`. Malformed input is `Corrupted`.
pub fn decompress_stream<R: Read + ?Sized, W: Write>(
    src: &mut R,
    dst: W,
    buf: &mut ChunkBuffer,
) -> FcryptResult<W> {
    let mut decoder = gunzip_writer(dst);
    match pump(src, &mut decoder, buf, |_| Ok(())) {
        Ok(_) => {}
        Err(FcryptError::Io(err)) => return Err(payload_error(err)),
        Err(other) => return Err(other),
    }
    decoder.finish().map_err(payload_error)
}
