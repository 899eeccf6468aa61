//! Chunked streaming: the zeroizing chunk buffer, the read/write pump, and the
//! `encrypt_stream` / `decrypt_stream` entry points.

use std::io::{self, Read, Write};

use zeroize::{Zeroize, Zeroizing};

use fcrypt_core::{FcryptError, FcryptResult, IV_SIZE};

use crate::gcm::{DecryptingWriter, EncryptingWriter};
use crate::kdf::FileKey;

const MIB: usize = 1024 * 1024;

/// The `B`-byte buffer plaintext passes through. Zeroized on drop.
pub struct ChunkBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl ChunkBuffer {
    pub fn new(size: usize) -> FcryptResult<Self> {
        if size == 0 {
            return Err(FcryptError::InvalidParameter(
                "chunk buffer size must be non-zero".into(),
            ));
        }
        Ok(Self {
            bytes: Zeroizing::new(vec![0u8; size]),
        })
    }

    pub fn from_mib(mib: usize) -> FcryptResult<Self> {
        let size = mib.checked_mul(MIB).ok_or_else(|| {
            FcryptError::InvalidParameter(format!("chunk buffer of {mib} MiB overflows"))
        })?;
        Self::new(size)
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Overwrite the buffer with zeros without releasing it.
    pub fn wipe(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("capacity", &self.bytes.len())
            .finish()
    }
}

/// Fill `buf` from `src` until it is full or `src` is exhausted.
fn fill<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copy `src` into `sink` one full buffer at a time.
///
/// `on_chunk` runs after every chunk with the running byte total; an error
/// from it (typically `Cancelled`) stops the copy before the next read.
/// The buffer is wiped before returning.
pub fn pump<R, W, F>(
    src: &mut R,
    sink: &mut W,
    buf: &mut ChunkBuffer,
    mut on_chunk: F,
) -> FcryptResult<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64) -> FcryptResult<()>,
{
    let result = (|| -> FcryptResult<u64> {
        let mut total = 0u64;
        loop {
            let n = fill(src, buf.as_mut_slice())?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf.as_mut_slice()[..n])?;
            total += n as u64;
            on_chunk(total)?;
            if n < buf.capacity() {
                break;
            }
        }
        Ok(total)
    })();
    buf.wipe();
    result
}

/// Map a payload-stage I/O error (decompressor or nested writer) to the error kind.
///
/// Undecodable data is `Corrupted`; anything else stays an I/O failure.
pub fn payload_error(err: io::Error) -> FcryptError {
    match err.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero => FcryptError::Corrupted(format!("undecodable payload: {err}")),
        _ => FcryptError::Io(err),
    }
}

/// Encrypt `src` to EOF into `dst` as a single `C || T` frame.
///
/// Returns the number of plaintext bytes read.
pub fn encrypt_stream<R: Read + ?Sized, W: Write>(
    key: &FileKey,
    iv: &[u8; IV_SIZE],
    src: &mut R,
    dst: W,
    buf: &mut ChunkBuffer,
) -> FcryptResult<u64> {
    let mut sealer = EncryptingWriter::new(key, iv, dst);
    let bytes_in = pump(src, &mut sealer, buf, |_| Ok(()))?;
    sealer.finish()?;
    Ok(bytes_in)
}

/// Decrypt a `C || T` frame from `src` into `dst`.
///
/// Returns the number of plaintext bytes written. On error, whatever reached
/// `dst` is invalid and must be discarded by the caller.
pub fn decrypt_stream<R: Read + ?Sized, W: Write>(
    key: &FileKey,
    iv: &[u8; IV_SIZE],
    src: &mut R,
    dst: W,
    buf: &mut ChunkBuffer,
) -> FcryptResult<u64> {
    let mut opener = DecryptingWriter::new(key, iv, dst);
    pump(src, &mut opener, buf, |_| Ok(()))?;
    let (_, bytes_out) = opener.finish()?;
    Ok(bytes_out)
}
