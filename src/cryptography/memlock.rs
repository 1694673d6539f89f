use crate::cryptography::primitives::KEY_LEN;
use anyhow::Result;
use zeroize::Zeroize;

/// Best-effort memory locking helpers for derived keys.
///
/// On Unix with the `memlock` feature these mlock/munlock the slice for the
/// duration of a sensitive operation. Elsewhere they are no-ops.
#[inline]
pub fn lock_slice(_data: &mut [u8]) -> Result<()> {
    #[cfg(all(target_family = "unix", feature = "memlock"))]
    {
        let len = _data.len();
        if len == 0 {
            return Ok(());
        }
        // Safety: mlock only reads the pointer and length.
        let rc = unsafe { libc::mlock(_data.as_ptr() as *const core::ffi::c_void, len) };
        if rc != 0 {
            tracing::debug!("mlock failed; continuing without locked pages");
        }
    }
    Ok(())
}

#[inline]
pub fn unlock_slice(_data: &mut [u8]) -> Result<()> {
    #[cfg(all(target_family = "unix", feature = "memlock"))]
    {
        let len = _data.len();
        if len == 0 {
            return Ok(());
        }
        let _ = unsafe { libc::munlock(_data.as_ptr() as *const core::ffi::c_void, len) };
    }
    Ok(())
}

/// Copy `key` into a stack buffer, lock it, run `f`, then unlock and wipe.
pub fn with_locked_key<T>(key: &[u8], f: impl FnOnce(&[u8; KEY_LEN]) -> Result<T>) -> Result<T> {
    if key.len() < KEY_LEN {
        anyhow::bail!("derived key is shorter than {KEY_LEN} bytes");
    }
    let mut arr = [0u8; KEY_LEN];
    arr.copy_from_slice(&key[..KEY_LEN]);
    let _ = lock_slice(&mut arr);
    let out = f(&arr);
    let _ = unlock_slice(&mut arr);
    arr.zeroize();
    out
}
