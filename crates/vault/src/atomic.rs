//! Staged writes: a fresh owner-only temp file in the target directory,
//! fsynced, then published by rename (or hard link when the target must not
//! already exist).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn private_options() -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}

/// Write `bytes` to a temp file beside `target` and fsync it. The target is untouched.
pub(crate) fn stage(target: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let dir = parent_dir(target);
    fs::create_dir_all(dir)?;

    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("staged");
    let tmp = dir.join(format!(
        ".{}.tmp-{}-{:016x}",
        file_name,
        std::process::id(),
        rand::random::<u64>()
    ));

    let mut file = private_options().open(&tmp)?;
    if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(tmp)
}

/// Replace `target` with the staged file.
pub(crate) fn commit(tmp: &Path, target: &Path) -> io::Result<()> {
    if let Err(e) = fs::rename(tmp, target) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    sync_dir(parent_dir(target));
    Ok(())
}

/// Publish the staged file only if `target` does not exist yet.
///
/// Returns `false` when another writer got there first; the staged file is discarded.
pub(crate) fn commit_new(tmp: &Path, target: &Path) -> io::Result<bool> {
    match fs::hard_link(tmp, target) {
        Ok(()) => {
            let _ = fs::remove_file(tmp);
            sync_dir(parent_dir(target));
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(tmp);
            Ok(false)
        }
        // Filesystems without hard links.
        Err(_) => {
            if target.exists() {
                let _ = fs::remove_file(tmp);
                Ok(false)
            } else {
                commit(tmp, target)?;
                Ok(true)
            }
        }
    }
}

// Best effort: directories cannot be opened for sync on every platform.
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}
