//! Writing entries to the destination tree.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{FchmodatFlags, Mode};
use nix::unistd::{FchownatFlags, Gid, Uid, UnlinkatFlags};

use proxmox_lang::io_format_err;

use restore_buildcfg::{APP_ID_START, RESTORE_FILE_MODE, RESTORE_NEW_FILE_MODE, UID_GID_OFFSET};

use super::block::BlockReader;
use super::{ParsedEntry, UntarError};

/// Map the owner of a sandboxed entry onto the restoring application.
///
/// Entries of system users (below [`APP_ID_START`]) and restores without a
/// target owner keep their ids. Otherwise the uid becomes `target_owner`,
/// and the gid keeps its distance to the uid if that distance is a multiple
/// of [`UID_GID_OFFSET`].
pub fn fix_up_owner(uid: u64, gid: u64, target_owner: u32) -> (u32, u32) {
    if target_owner == 0 || uid < APP_ID_START as u64 {
        return (uid as u32, gid as u32);
    }

    let new_uid = target_owner;
    if uid == gid {
        return (new_uid, new_uid);
    }

    let delta = gid as i64 - uid as i64;
    let new_gid = if delta % UID_GID_OFFSET as i64 == 0 {
        u32::try_from(delta + new_uid as i64).unwrap_or(gid as u32)
    } else {
        gid as u32
    };

    (new_uid, new_gid)
}

/// Materializes entries below a destination root.
///
/// Owns the transfer buffer, which is reused for every regular file of
/// one operation.
pub struct EntryMaterializer {
    buffer: Vec<u8>,
    owner: u32,
}

impl EntryMaterializer {
    pub fn new(read_buffer_size: usize, owner: u32) -> Self {
        Self {
            buffer: vec![0u8; read_buffer_size.max(1)],
            owner,
        }
    }

    /// Restore a regular file or a split piece.
    ///
    /// Returns `Ok(false)` if the entry was skipped. Partially written files
    /// are removed. The archive is always positioned after the payload.
    pub fn write_regular<R: Read + Seek>(
        &mut self,
        reader: &mut BlockReader<R>,
        entry: &ParsedEntry,
    ) -> Result<bool, UntarError> {
        let written = match create_file(&entry.path, entry.kind.appends()) {
            Ok(mut file) => match self.copy_payload(reader, entry.size, &mut file) {
                Ok(()) => true,
                Err(err) => {
                    log::error!("failed to restore {:?} - {}", entry.path, err);
                    drop(file);
                    if let Err(err) = std::fs::remove_file(&entry.path) {
                        log::warn!("unable to remove partial file {:?} - {}", entry.path, err);
                    }
                    false
                }
            },
            Err(err) => {
                log::error!("unable to create {:?} - {}", entry.path, err);
                false
            }
        };

        reader.seek_to(entry.next_header_offset())?;

        Ok(written)
    }

    fn copy_payload<R: Read + Seek>(
        &mut self,
        reader: &mut BlockReader<R>,
        size: u64,
        file: &mut File,
    ) -> Result<(), UntarError> {
        let mut rest = size;
        while rest > 0 {
            let len = rest.min(self.buffer.len() as u64) as usize;
            let buf = &mut self.buffer[..len];
            if !reader.read_payload(buf)? {
                return Err(UntarError::Io(io_format_err!("short read of entry payload")));
            }
            file.write_all(buf)?;
            rest -= len as u64;
        }

        file.flush()?;
        Ok(())
    }

    /// Create a directory, an existing one is fine.
    pub fn create_dir(&self, entry: &ParsedEntry) -> bool {
        match super::path::create_dir_with_recursive(&entry.path) {
            Ok(()) => true,
            Err(err) => {
                log::error!("failed to create directory {:?} - {}", entry.path, err);
                false
            }
        }
    }

    /// Replace whatever exists at the destination with a symlink.
    pub fn create_symlink(&self, entry: &ParsedEntry) -> bool {
        let target = OsStr::from_bytes(&entry.link_target);

        match nix::unistd::unlinkat(None, &entry.path, UnlinkatFlags::NoRemoveDir) {
            Ok(()) | Err(Errno::ENOENT) => (),
            Err(err) => log::warn!("unable to unlink {:?} - {}", entry.path, err),
        }

        match nix::unistd::symlinkat(target, None, &entry.path) {
            Ok(()) => true,
            Err(err) => {
                log::error!(
                    "failed to create symlink {:?} -> {:?} - {}",
                    entry.path,
                    target,
                    err
                );
                false
            }
        }
    }

    /// Apply the restore mode and the remapped owner.
    ///
    /// Symlinks only get their owner changed. Failures are logged, since
    /// unprivileged restores cannot change ownership.
    pub fn apply_metadata(&self, entry: &ParsedEntry, is_symlink: bool) {
        let (uid, gid) = fix_up_owner(entry.uid, entry.gid, self.owner);

        if !is_symlink {
            if let Err(err) = nix::sys::stat::fchmodat(
                None,
                &entry.path,
                Mode::from_bits_truncate(RESTORE_FILE_MODE),
                FchmodatFlags::FollowSymlink,
            ) {
                log::warn!("chmod {:?} failed - {}", entry.path, err);
            }
        }

        let flags = if is_symlink {
            FchownatFlags::NoFollowSymlink
        } else {
            FchownatFlags::FollowSymlink
        };

        if let Err(err) = nix::unistd::fchownat(
            None,
            &entry.path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            flags,
        ) {
            log::debug!("chown {:?} to {}:{} failed - {}", entry.path, uid, gid, err);
        }
    }
}

fn create_file(path: &Path, append: bool) -> Result<File, UntarError> {
    // never write through a symlink at the destination
    let mut oflags = OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
    if append {
        oflags |= OFlag::O_APPEND;
    } else {
        oflags |= OFlag::O_TRUNC;
    }

    let fd = nix::fcntl::open(path, oflags, Mode::from_bits_truncate(RESTORE_NEW_FILE_MODE))?;
    let file = unsafe { File::from_raw_fd(fd) };

    // O_CREAT does not touch the mode of existing files
    nix::sys::stat::fchmod(file.as_raw_fd(), Mode::from_bits_truncate(RESTORE_NEW_FILE_MODE))?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use super::super::header::EntryKind;
    use super::super::BLOCK_SIZE;
    use super::*;

    #[test]
    fn test_fix_up_owner() {
        assert_eq!(fix_up_owner(10010005, 10010005, 20010008), (20010008, 20010008));
        assert_eq!(fix_up_owner(10010005, 10030005, 20010008), (20010008, 20030008));
        // gid below uid
        assert_eq!(fix_up_owner(10030005, 10010005, 20030008), (20030008, 20010008));
        // unrelated gid is kept
        assert_eq!(fix_up_owner(10010005, 1023, 20010008), (20010008, 1023));
        // system users and restores without target owner are untouched
        assert_eq!(fix_up_owner(1000, 1000, 20010008), (1000, 1000));
        assert_eq!(fix_up_owner(10010005, 10010005, 0), (10010005, 10010005));
    }

    fn testdir(name: &str) -> PathBuf {
        let mut path = PathBuf::from("./target/testout");
        path.push(module_path!());
        path.push(name);
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn entry(path: PathBuf, kind: EntryKind, size: u64) -> ParsedEntry {
        ParsedEntry {
            name: b"entry".to_vec(),
            link_target: Vec::new(),
            path,
            kind,
            size,
            block_count: size.div_ceil(BLOCK_SIZE as u64),
            uid: 0,
            gid: 0,
            data_offset: 0,
        }
    }

    fn payload(data: &[u8]) -> BlockReader<Cursor<Vec<u8>>> {
        let mut buf = data.to_vec();
        buf.resize(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
        BlockReader::new(Cursor::new(buf)).unwrap()
    }

    #[test]
    fn test_write_and_append() {
        let dir = testdir("append");
        let path = dir.join("piece");
        let mut materializer = EntryMaterializer::new(4, 0);

        let mut reader = payload(b"hello, ");
        let written = materializer
            .write_regular(&mut reader, &entry(path.clone(), EntryKind::SplitStart, 7))
            .unwrap();
        assert!(written);
        assert_eq!(reader.position(), BLOCK_SIZE as u64);

        let mut reader = payload(b"world!");
        materializer
            .write_regular(&mut reader, &entry(path.clone(), EntryKind::SplitEnd, 6))
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello, world!");

        let mut reader = payload(b"new");
        materializer
            .write_regular(&mut reader, &entry(path.clone(), EntryKind::Regular, 3))
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_short_payload_removes_file() {
        let dir = testdir("short");
        let path = dir.join("file");
        let mut materializer = EntryMaterializer::new(512, 0);

        let mut reader = payload(b"abc");
        let written = materializer
            .write_regular(&mut reader, &entry(path.clone(), EntryKind::Regular, 1024))
            .unwrap();
        assert!(!written);
        assert!(!path.exists());
    }

    #[test]
    fn test_regular_file_not_written_through_symlink() {
        let dir = testdir("nofollow");
        let target = dir.join("target");
        std::fs::write(&target, b"orig").unwrap();
        let path = dir.join("link");
        std::os::unix::fs::symlink("target", &path).unwrap();

        let mut materializer = EntryMaterializer::new(512, 0);
        let mut reader = payload(b"evil");
        let written = materializer
            .write_regular(&mut reader, &entry(path.clone(), EntryKind::Regular, 4))
            .unwrap();
        assert!(!written);
        assert_eq!(reader.position(), BLOCK_SIZE as u64);
        assert_eq!(std::fs::read(&target).unwrap(), b"orig");
    }

    #[test]
    fn test_symlink_replaces_file() {
        let dir = testdir("symlink");
        let path = dir.join("link");
        std::fs::write(&path, b"old").unwrap();

        let mut link = entry(path.clone(), EntryKind::Symlink, 0);
        link.link_target = b"some/target".to_vec();

        let materializer = EntryMaterializer::new(512, 0);
        assert!(materializer.create_symlink(&link));
        materializer.apply_metadata(&link, true);
        assert_eq!(std::fs::read_link(&path).unwrap(), Path::new("some/target"));
    }
}
