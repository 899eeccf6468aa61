//! Single-frame streaming AES-256-GCM
//!
//! Ciphertext layout (no header, parameters live in the file record):
//! ```text
//! [N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! The frame is built from its parts so it can be streamed without holding
//! the whole plaintext: `H = E_K(0^128)`, `J0 = IV || 0^31 || 1`, CTR32
//! keystream starting at `inc32(J0)`, GHASH over the ciphertext (no AAD) and
//! `tag = GHASH ^ E_K(J0)`. Output is byte-identical to a one-shot AES-GCM
//! seal of the same plaintext.

use std::io::{self, Write};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use fcrypt_core::{FcryptError, FcryptResult, IV_SIZE};

use crate::kdf::FileKey;
use crate::TAG_SIZE;

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

const BLOCK_SIZE: usize = 16;

/// Largest plaintext one (key, IV) frame may carry: 2^32 - 2 counter blocks.
pub const MAX_FRAME_LEN: u64 = (1 << 36) - 32;

/// Working block used to transform bytes handed to the writers.
const WORK_BLOCK: usize = 64 * 1024;

struct GcmCore {
    ctr: Aes256Ctr32,
    ghash: GHash,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    ct_len: u64,
    tag_mask: Zeroizing<[u8; TAG_SIZE]>,
}

impl GcmCore {
    fn new(key: &FileKey, iv: &[u8; IV_SIZE]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key.as_bytes()));

        let mut hash_key = Zeroizing::new([0u8; BLOCK_SIZE]);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut hash_key[..]));
        let ghash = <GHash as ghash::universal_hash::KeyInit>::new(GenericArray::from_slice(
            &hash_key[..],
        ));

        let mut j0 = [0u8; BLOCK_SIZE];
        j0[..IV_SIZE].copy_from_slice(iv);
        j0[BLOCK_SIZE - 1] = 1;

        let mut tag_mask = Zeroizing::new(j0);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut tag_mask[..]));

        let mut first_counter = j0;
        first_counter[BLOCK_SIZE - 1] = 2;
        let ctr = Aes256Ctr32::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&first_counter),
        );

        Self {
            ctr,
            ghash,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
            ct_len: 0,
            tag_mask,
        }
    }

    /// Encrypt `block` in place and absorb the resulting ciphertext.
    fn seal(&mut self, block: &mut [u8]) -> io::Result<()> {
        self.keystream(block)?;
        self.absorb(block);
        Ok(())
    }

    /// Absorb ciphertext `block`, then decrypt it in place.
    fn open(&mut self, block: &mut [u8]) -> io::Result<()> {
        self.absorb(block);
        self.keystream(block)
    }

    fn keystream(&mut self, block: &mut [u8]) -> io::Result<()> {
        let frame_overflow = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload exceeds the {MAX_FRAME_LEN}-byte single-frame GCM limit"),
            )
        };
        if self.ct_len > MAX_FRAME_LEN {
            return Err(frame_overflow());
        }
        self.ctr
            .try_apply_keystream(block)
            .map_err(|_| frame_overflow())
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.ct_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_SIZE {
                return;
            }
            self.ghash.update_padded(&self.pending);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK_SIZE;
        if whole > 0 {
            self.ghash.update_padded(&data[..whole]);
        }
        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn tag(mut self) -> [u8; TAG_SIZE] {
        self.ghash.update_padded(&self.pending[..self.pending_len]);

        // no associated data: the AAD length half stays zero
        let mut lengths = [0u8; BLOCK_SIZE];
        lengths[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// `Write` adapter that encrypts everything written through it into `inner`.
///
/// Call [`EncryptingWriter::finish`] to append the tag; dropping the writer
/// without finishing leaves an unauthenticated (and therefore unusable) frame.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    core: GcmCore,
    scratch: Zeroizing<Vec<u8>>,
    bytes_in: u64,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(key: &FileKey, iv: &[u8; IV_SIZE], inner: W) -> Self {
        Self {
            inner,
            core: GcmCore::new(key, iv),
            scratch: Zeroizing::new(vec![0u8; WORK_BLOCK]),
            bytes_in: 0,
        }
    }

    /// Plaintext bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Write the tag and hand back the inner writer with the plaintext byte count.
    pub fn finish(self) -> FcryptResult<(W, u64)> {
        let Self {
            mut inner,
            core,
            bytes_in,
            ..
        } = self;
        let tag = core.tag();
        inner.write_all(&tag)?;
        inner.flush()?;
        Ok((inner, bytes_in))
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.scratch.len());
        if n == 0 {
            return Ok(0);
        }
        let block = &mut self.scratch[..n];
        block.copy_from_slice(&buf[..n]);
        self.core.seal(block)?;
        self.inner.write_all(block)?;
        self.bytes_in += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `Write` adapter that decrypts a `C || T` stream into `inner`.
///
/// The last 16 bytes seen are held back as the candidate tag. Plaintext is
/// released before the tag is checked, so on any error from
/// [`DecryptingWriter::finish`] whatever reached `inner` must be discarded.
///
/// A failing `inner` does not stop authentication: the error is kept, the
/// rest of the frame is still absorbed, and `finish` reports
/// `AuthenticationFailed` ahead of the sink error when the tag is bad.
pub struct DecryptingWriter<W: Write> {
    inner: W,
    core: GcmCore,
    tail: [u8; TAG_SIZE],
    tail_len: usize,
    scratch: Zeroizing<Vec<u8>>,
    bytes_out: u64,
    sink_error: Option<io::Error>,
}

impl<W: Write> DecryptingWriter<W> {
    pub fn new(key: &FileKey, iv: &[u8; IV_SIZE], inner: W) -> Self {
        Self {
            inner,
            core: GcmCore::new(key, iv),
            tail: [0u8; TAG_SIZE],
            tail_len: 0,
            scratch: Zeroizing::new(vec![0u8; WORK_BLOCK]),
            bytes_out: 0,
            sink_error: None,
        }
    }

    /// Plaintext bytes delivered to the inner writer so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Verify the tag and hand back the inner writer with the plaintext byte count.
    ///
    /// `Corrupted` when fewer than 16 bytes were written, `AuthenticationFailed`
    /// on tag mismatch, otherwise any deferred sink error (see [`payload_error`]).
    ///
    /// [`payload_error`]: crate::stream::payload_error
    pub fn finish(self) -> FcryptResult<(W, u64)> {
        let Self {
            mut inner,
            core,
            tail,
            tail_len,
            bytes_out,
            sink_error,
            ..
        } = self;

        if tail_len < TAG_SIZE {
            return Err(FcryptError::Corrupted(format!(
                "ciphertext is {tail_len} bytes, shorter than the {TAG_SIZE}-byte tag"
            )));
        }
        let expected = core.tag();
        if !bool::from(expected[..].ct_eq(&tail[..])) {
            return Err(FcryptError::AuthenticationFailed);
        }
        if let Some(err) = sink_error {
            return Err(crate::stream::payload_error(err));
        }
        inner.flush()?;
        Ok((inner, bytes_out))
    }
}

impl<W: Write> Write for DecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buf = &buf[..buf.len().min(self.scratch.len())];
        let total = self.tail_len + buf.len();
        if total <= TAG_SIZE {
            self.tail[self.tail_len..total].copy_from_slice(buf);
            self.tail_len = total;
            return Ok(buf.len());
        }

        // everything except the final 16 bytes of (tail ++ buf) is ciphertext
        let release = total - TAG_SIZE;
        let from_tail = release.min(self.tail_len);
        let from_buf = release - from_tail;

        let block = &mut self.scratch[..release];
        block[..from_tail].copy_from_slice(&self.tail[..from_tail]);
        block[from_tail..].copy_from_slice(&buf[..from_buf]);

        let kept = self.tail_len - from_tail;
        let mut next_tail = [0u8; TAG_SIZE];
        next_tail[..kept].copy_from_slice(&self.tail[from_tail..self.tail_len]);
        next_tail[kept..].copy_from_slice(&buf[from_buf..]);
        self.tail = next_tail;
        self.tail_len = TAG_SIZE;

        self.core.open(block)?;
        if self.sink_error.is_none() {
            match self.inner.write_all(block) {
                Ok(()) => self.bytes_out += release as u64,
                Err(err) => self.sink_error = Some(err),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.sink_error.is_some() {
            return Ok(());
        }
        self.inner.flush()
    }
}
