use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Create the parent directory of `path`, 0700 on Unix.
pub fn ensure_parent_secure(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        #[cfg(unix)]
        {
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to a sibling temp file (0600 on Unix), sync it, then rename over `path`.
pub fn atomic_write_secure(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_secure(path)?;
    let tmp = tmp_path(path);
    {
        let mut opts = fs::OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file: File = opts
            .open(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_data()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {} atomically", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_perm_0600(path: &Path) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

/// `<file>.n`
pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{n}", path.display()))
}

/// Rotate up to `backups` numbered copies (`<file>.1` newest), then write atomically.
pub fn write_with_backups(path: &Path, bytes: &[u8], backups: usize) -> Result<()> {
    ensure_parent_secure(path)?;

    if backups > 0 && path.exists() {
        let _ = fs::remove_file(backup_path(path, backups));
        for i in (1..backups).rev() {
            let src = backup_path(path, i);
            if src.exists() {
                let dst = backup_path(path, i + 1);
                let _ = fs::rename(&src, &dst);
                #[cfg(unix)]
                set_perm_0600(&dst);
            }
        }
        // Copy rather than move so a failed write still leaves the live file.
        let first = backup_path(path, 1);
        fs::copy(path, &first)
            .with_context(|| format!("Failed to back up {}", path.display()))?;
        #[cfg(unix)]
        set_perm_0600(&first);
    }

    atomic_write_secure(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backups_rotate_and_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("vault.blk");
        for i in 0..4u8 {
            write_with_backups(&path, &[i], 2).unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), vec![3]);
        assert_eq!(fs::read(backup_path(&path, 1)).unwrap(), vec![2]);
        assert_eq!(fs::read(backup_path(&path, 2)).unwrap(), vec![1]);
        assert!(!backup_path(&path, 3).exists());
        assert!(!tmp_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_owner_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret");
        atomic_write_secure(&path, b"x").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
