//! Destination path handling.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;

use proxmox_lang::io_format_err;
use proxmox_sys::fs::{create_path, CreateOptions};

use restore_buildcfg::RESTORE_DIR_MODE;

use super::UntarError;

/// Join an entry name onto the destination root.
///
/// The name is appended textually, so absolute entry names also end up
/// below `root`. With `reject_traversal`, names containing a `..`
/// component are refused. Symlinks already on disk are not looked at here,
/// see [`check_symlink_free`].
pub fn gen_real_path(
    root: &Path,
    name: &[u8],
    path_max_len: usize,
    reject_traversal: bool,
) -> Result<PathBuf, UntarError> {
    let root = root.as_os_str().as_bytes();
    if root.is_empty() || name.is_empty() {
        return Err(UntarError::Param("empty destination root or entry name".into()));
    }

    if reject_traversal && name.split(|&b| b == b'/').any(|c| c == b"..") {
        return Err(UntarError::Param(format!(
            "entry {:?} leaves the destination directory",
            String::from_utf8_lossy(name)
        )));
    }

    let mut full = Vec::with_capacity(root.len() + name.len() + 1);
    full.extend_from_slice(root);
    if !root.ends_with(b"/") && !name.starts_with(b"/") {
        full.push(b'/');
    }
    full.extend_from_slice(name);

    if full.len() >= path_max_len {
        return Err(UntarError::Param(format!(
            "path of entry {:?} exceeds {} bytes",
            String::from_utf8_lossy(name),
            path_max_len
        )));
    }

    Ok(PathBuf::from(OsStr::from_bytes(&full)))
}

/// Refuse destinations that run through a symlink below `root`.
///
/// Every existing component of `path` after `root` is checked, the last one
/// only with `include_last`. Components that do not exist yet are fine,
/// they get created as real directories.
pub fn check_symlink_free(root: &Path, path: &Path, include_last: bool) -> Result<(), UntarError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| UntarError::Param(format!("{:?} is not below {:?}", path, root)))?;

    let mut components: Vec<_> = rel.components().collect();
    if !include_last {
        components.pop();
    }

    let mut current = root.to_path_buf();
    for component in components {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(UntarError::Param(format!(
                    "destination {:?} runs through symlink {:?}",
                    path, current
                )));
            }
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Create `path` and all missing parents with the restore directory mode.
///
/// Existing directories are left untouched.
pub fn create_dir_with_recursive(path: &Path) -> Result<(), UntarError> {
    if path.as_os_str().is_empty() {
        return Err(UntarError::Param("cannot create empty path".into()));
    }
    if path.is_dir() {
        return Ok(());
    }

    let opts = CreateOptions::new().perm(Mode::from_bits_truncate(RESTORE_DIR_MODE));

    create_path(path, Some(opts.clone()), Some(opts)).map_err(|err| {
        UntarError::Io(io_format_err!("unable to create directory {:?} - {}", path, err))
    })?;

    Ok(())
}

/// Create the parent directory of an entry destination.
pub fn create_parent_dirs(path: &Path) -> Result<(), UntarError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => create_dir_with_recursive(parent),
        _ => Ok(()),
    }
}
