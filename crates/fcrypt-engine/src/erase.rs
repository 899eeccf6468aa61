//! Secure eraser: best-effort overwrite of a file's logical extent, then unlink.
//!
//! Journaling filesystems and SSD wear-levelling can keep older copies of the
//! blocks; only the bytes reachable through the file are overwritten.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use fcrypt_core::config::{MAX_DELETE_PASSES, MIN_DELETE_PASSES};
use fcrypt_core::{DeleteMode, FcryptError, FcryptResult};

const ERASE_BLOCK: usize = 64 * 1024;

/// Erase `path` according to `mode`.
///
/// In overwrite mode the unlink is attempted even when an overwrite pass
/// fails; the first error is returned.
pub fn erase(path: &Path, mode: DeleteMode, passes: u8) -> FcryptResult<()> {
    match mode {
        DeleteMode::Fast => {
            fs::remove_file(path)?;
        }
        DeleteMode::Overwrite => {
            if !(MIN_DELETE_PASSES..=MAX_DELETE_PASSES).contains(&passes) {
                return Err(FcryptError::InvalidParameter(format!(
                    "delete passes must be {MIN_DELETE_PASSES}-{MAX_DELETE_PASSES} (got {passes})"
                )));
            }
            let overwritten = overwrite_file(path, passes);
            let unlinked = fs::remove_file(path);
            overwritten?;
            unlinked?;
        }
    }
    debug!(path = %path.display(), ?mode, passes, "erased");
    Ok(())
}

fn overwrite_file(path: &Path, passes: u8) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    overwrite_passes(&mut file, len, passes, |f| f.sync_data())
}

/// Overwrite the first `len` bytes of `target` `passes` times.
///
/// Pass 1 writes zeros, pass 2 writes `0xFF`, later passes write random
/// bytes. `sync` runs after every pass.
pub fn overwrite_passes<F, S>(target: &mut F, len: u64, passes: u8, mut sync: S) -> io::Result<()>
where
    F: Write + Seek,
    S: FnMut(&mut F) -> io::Result<()>,
{
    let block_len = (len.min(ERASE_BLOCK as u64) as usize).max(1);
    let mut block = Zeroizing::new(vec![0u8; block_len]);
    let mut rng = rand::thread_rng();

    for pass in 0..passes {
        target.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(block_len as u64) as usize;
            match pass {
                0 => block[..n].fill(0x00),
                1 => block[..n].fill(0xFF),
                _ => rng.fill_bytes(&mut block[..n]),
            }
            target.write_all(&block[..n])?;
            remaining -= n as u64;
        }
        target.flush()?;
        sync(target)?;
    }
    Ok(())
}
