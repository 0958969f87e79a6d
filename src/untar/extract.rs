//! Listing and extraction of tar archives onto the file system.

use std::ffi::OsStr;
use std::io::{Read, Seek};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use restore_buildcfg::{PATH_MAX_LEN, READ_BUFF_SIZE};

use super::block::{BlockRead, BlockReader};
use super::extension::PendingExtensions;
use super::header::{EntryKind, TarHeader};
use super::materialize::EntryMaterializer;
use super::path::{
    check_symlink_free, create_dir_with_recursive, create_parent_dirs, gen_real_path,
};
use super::split::SplitManifest;
use super::{UntarError, BLOCK_SIZE};

/// What happens to the source archive after a non-split [`UnTarFile::unpack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceRemoval {
    /// Keep the archive.
    Never,
    /// Remove the archive only if extraction succeeded.
    OnSuccess,
    /// Remove the archive after extraction, whatever the result.
    #[default]
    Always,
}

/// Settings of an [`UnTarFile`], defaults come from `restore_buildcfg`.
#[derive(Clone)]
pub struct UntarOptions {
    /// Upper bound for destination paths and GNU extension payloads.
    pub path_max_len: usize,
    /// Size of the transfer buffer, and the read-past-end tolerance of split chunks.
    pub read_buffer_size: usize,
    /// Refuse entry names with `..` components, and entries whose
    /// destination runs through a symlink below the destination root.
    pub reject_path_traversal: bool,
    /// Handling of the archive file after a non-split unpack.
    pub source_removal: SourceRemoval,
    /// Checked between entries, set to abort the running operation.
    pub abort: Option<Arc<AtomicBool>>,
}

impl Default for UntarOptions {
    fn default() -> Self {
        Self {
            path_max_len: PATH_MAX_LEN,
            read_buffer_size: READ_BUFF_SIZE,
            reject_path_traversal: true,
            source_removal: SourceRemoval::default(),
            abort: None,
        }
    }
}

/// A regular file found while listing an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub path: String,
    pub size: u64,
    /// Archive offset of the first payload byte.
    pub data_offset: u64,
}

/// A header with any pending GNU overrides applied.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub name: Vec<u8>,
    pub link_target: Vec<u8>,
    /// Destination path, or the plain entry name when listing.
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub block_count: u64,
    pub uid: u64,
    pub gid: u64,
    pub data_offset: u64,
}

impl ParsedEntry {
    fn new(header: &TarHeader, pending: &mut PendingExtensions, data_offset: u64) -> Self {
        let (long_name, long_link) = pending.take();

        let name = long_name.unwrap_or_else(|| header.name_bytes().to_vec());
        let link_target = long_link.unwrap_or_else(|| header.link_name_bytes().to_vec());

        Self {
            path: PathBuf::from(OsStr::from_bytes(&name)),
            name,
            link_target,
            kind: header.kind(),
            size: header.size(),
            block_count: header.block_count(),
            uid: header.uid(),
            gid: header.gid(),
            data_offset,
        }
    }

    pub fn next_header_offset(&self) -> u64 {
        self.data_offset + self.block_count * BLOCK_SIZE as u64
    }

    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

enum ParseMode<'a> {
    List(&'a mut Vec<ListedEntry>),
    Unpack(&'a Path, &'a mut EntryMaterializer),
    CheckSplit,
}

/// Tar extraction engine of a restore session.
///
/// One instance handles one archive (or one split set) at a time, and may
/// be reused for further archives after [`UnTarFile::reset`].
pub struct UnTarFile {
    options: UntarOptions,
    cache: Option<(PathBuf, Vec<ListedEntry>)>,
    is_split: bool,
    pending: PendingExtensions,
}

impl Default for UnTarFile {
    fn default() -> Self {
        Self::new()
    }
}

impl UnTarFile {
    pub fn new() -> Self {
        Self::with_options(UntarOptions::default())
    }

    pub fn with_options(options: UntarOptions) -> Self {
        Self {
            options,
            cache: None,
            is_split: false,
            pending: PendingExtensions::new(),
        }
    }

    pub fn options(&self) -> &UntarOptions {
        &self.options
    }

    /// Whether the last split check or split extraction saw split entries.
    pub fn is_split(&self) -> bool {
        self.is_split
    }

    /// Forget cached listings, the split state and pending extension records.
    pub fn reset(&mut self) {
        self.cache = None;
        self.is_split = false;
        self.pending.clear();
    }

    /// List the regular file paths of `archive` in archive order.
    pub fn list_entries(&mut self, archive: &Path) -> Result<Vec<String>, UntarError> {
        Ok(self
            .entries(archive)?
            .iter()
            .map(|entry| entry.path.clone())
            .collect())
    }

    /// List regular files with their sizes and payload offsets.
    ///
    /// The archive is scanned once and the result cached until [`reset`](Self::reset)
    /// or a listing of another archive.
    pub fn entries(&mut self, archive: &Path) -> Result<&[ListedEntry], UntarError> {
        let cached = matches!(&self.cache, Some((path, _)) if path == archive);

        if !cached {
            log::info!("listing archive {:?}", archive);
            let mut reader = BlockReader::open(archive)?;
            let mut list = Vec::new();
            self.parse_archive(&mut reader, ParseMode::List(&mut list))?;
            self.cache = Some((archive.to_path_buf(), list));
        }

        match &self.cache {
            Some((_, list)) => Ok(list),
            None => Ok(&[]),
        }
    }

    /// Extract `archive` below `dest_root`, remapping sandbox owners onto `owner_uid`.
    ///
    /// The archive is removed afterwards according to the configured
    /// [`SourceRemoval`] policy.
    pub fn unpack(
        &mut self,
        archive: &Path,
        dest_root: &Path,
        owner_uid: u32,
    ) -> Result<(), UntarError> {
        log::info!("unpacking {:?} to {:?}", archive, dest_root);

        let result = self.unpack_do(archive, dest_root, owner_uid);

        let remove = match self.options.source_removal {
            SourceRemoval::Never => false,
            SourceRemoval::OnSuccess => result.is_ok(),
            SourceRemoval::Always => true,
        };
        if remove {
            if let Err(err) = std::fs::remove_file(archive) {
                log::warn!("unable to remove archive {:?} - {}", archive, err);
            }
        }

        match &result {
            Ok(()) => log::info!("unpacked {:?}", archive),
            Err(err) => log::error!("unpacking {:?} failed - {}", archive, err),
        }

        result
    }

    fn unpack_do(
        &mut self,
        archive: &Path,
        dest_root: &Path,
        owner_uid: u32,
    ) -> Result<(), UntarError> {
        check_dest_root(dest_root)?;

        let mut reader = BlockReader::open(archive)?;
        create_dir_with_recursive(dest_root)?;

        let mut materializer = EntryMaterializer::new(self.options.read_buffer_size, owner_uid);
        self.parse_archive(&mut reader, ParseMode::Unpack(dest_root, &mut materializer))
    }

    /// Check whether `archive` contains split entries.
    ///
    /// Nothing is written. Errors are logged and reported as `false`.
    pub fn is_split_archive(&mut self, archive: &Path, dest_root: &Path) -> bool {
        self.is_split = false;

        let result = check_dest_root(dest_root).and_then(|()| {
            let mut reader = BlockReader::open(archive)?;
            self.parse_archive(&mut reader, ParseMode::CheckSplit)
        });

        match result {
            Ok(()) => {
                log::info!("{:?} is split: {}", archive, self.is_split);
                self.is_split
            }
            Err(err) => {
                log::error!("checking {:?} for split entries failed - {}", archive, err);
                false
            }
        }
    }

    /// Extract a split set described by `manifest`.
    ///
    /// All chunks are validated before anything is extracted. Chunks are
    /// extracted in manifest order and removed once extracted, the first
    /// failing chunk aborts the whole set.
    pub fn unpack_split(
        &mut self,
        manifest: &Path,
        dest_root: &Path,
        owner_uid: u32,
    ) -> Result<(), UntarError> {
        log::info!("unpacking split set {:?} to {:?}", manifest, dest_root);
        check_dest_root(dest_root)?;

        let manifest = SplitManifest::load(manifest, self.options.path_max_len)?;
        manifest.validate()?;
        if manifest.is_empty() {
            log::warn!("split manifest lists no chunks");
        }

        self.is_split = true;
        create_dir_with_recursive(dest_root)?;

        let mut materializer = EntryMaterializer::new(self.options.read_buffer_size, owner_uid);

        for chunk in manifest.chunks() {
            self.check_abort()?;

            if let Err(err) = self.unpack_chunk(&chunk.path, dest_root, &mut materializer) {
                log::error!("unpacking split chunk {:?} failed - {}", chunk.path, err);
                return Err(err);
            }
            log::info!("unpacked split chunk {:?}", chunk.path);

            if let Err(err) = std::fs::remove_file(&chunk.path) {
                log::warn!("unable to remove split chunk {:?} - {}", chunk.path, err);
            }
        }

        log::info!("split set unpacked");
        Ok(())
    }

    /// Extract a single split chunk without owner remapping. The chunk is kept.
    pub fn unpack_split_chunk(&mut self, chunk: &Path, dest_root: &Path) -> Result<(), UntarError> {
        check_dest_root(dest_root)?;

        self.is_split = true;
        create_dir_with_recursive(dest_root)?;

        let mut materializer = EntryMaterializer::new(self.options.read_buffer_size, 0);
        let result = self.unpack_chunk(chunk, dest_root, &mut materializer);

        match &result {
            Ok(()) => log::info!("unpacked split chunk {:?}", chunk),
            Err(err) => log::error!("unpacking split chunk {:?} failed - {}", chunk, err),
        }

        result
    }

    fn unpack_chunk(
        &mut self,
        chunk: &Path,
        dest_root: &Path,
        materializer: &mut EntryMaterializer,
    ) -> Result<(), UntarError> {
        let mut reader = BlockReader::open(chunk)?;
        reader.set_split_tolerant(true, self.options.read_buffer_size as u64);
        self.parse_archive(&mut reader, ParseMode::Unpack(dest_root, materializer))
    }

    fn check_abort(&self) -> Result<(), UntarError> {
        match &self.options.abort {
            Some(abort) if abort.load(Ordering::SeqCst) => Err(UntarError::Aborted),
            _ => Ok(()),
        }
    }

    fn parse_archive<R: Read + Seek>(
        &mut self,
        reader: &mut BlockReader<R>,
        mut mode: ParseMode,
    ) -> Result<(), UntarError> {
        self.pending.clear();
        let result = self.parse_entries(reader, &mut mode);
        self.pending.clear();
        result
    }

    fn parse_entries<R: Read + Seek>(
        &mut self,
        reader: &mut BlockReader<R>,
        mode: &mut ParseMode,
    ) -> Result<(), UntarError> {
        loop {
            self.check_abort()?;

            let header = match reader.next_header()? {
                BlockRead::Header(header) => header,
                BlockRead::End => return Ok(()),
            };

            let kind = header.kind();
            if matches!(kind, EntryKind::GnuLongName | EntryKind::GnuLongLink) {
                self.pending.accumulate(&header, reader, self.options.path_max_len)?;
                continue;
            }

            let mut entry = ParsedEntry::new(&header, &mut self.pending, reader.position());

            match mode {
                ParseMode::List(list) => {
                    if matches!(kind, EntryKind::Regular) || kind.is_split_marker() {
                        list.push(ListedEntry {
                            path: entry.display_name(),
                            size: entry.size,
                            data_offset: entry.data_offset,
                        });
                    }
                }
                ParseMode::CheckSplit => {
                    if kind.is_split_marker() {
                        self.is_split = true;
                        return Ok(());
                    }
                }
                ParseMode::Unpack(root, materializer) => {
                    let path = gen_real_path(
                        root,
                        &entry.name,
                        self.options.path_max_len,
                        self.options.reject_path_traversal,
                    )
                    .and_then(|path| {
                        if self.options.reject_path_traversal {
                            // a symlink entry replaces its own last component
                            let include_last = entry.kind != EntryKind::Symlink;
                            check_symlink_free(root, &path, include_last)?;
                        }
                        Ok(path)
                    });

                    match path {
                        Ok(path) => {
                            entry.path = path;
                            self.materialize(reader, &entry, materializer)?;
                        }
                        Err(err) => {
                            log::warn!("skipping entry {:?} - {}", entry.display_name(), err)
                        }
                    }
                }
            }

            reader.seek_to(entry.next_header_offset())?;
        }
    }

    fn materialize<R: Read + Seek>(
        &self,
        reader: &mut BlockReader<R>,
        entry: &ParsedEntry,
        materializer: &mut EntryMaterializer,
    ) -> Result<(), UntarError> {
        log::debug!("restore {:?} ({:?}, {} bytes)", entry.path, entry.kind, entry.size);

        if let EntryKind::Unknown(flag) = entry.kind {
            log::warn!(
                "skipping entry {:?} with unsupported type {:?}",
                entry.display_name(),
                flag as char
            );
            return Ok(());
        }

        if let Err(err) = create_parent_dirs(&entry.path) {
            log::error!("skipping entry {:?} - {}", entry.display_name(), err);
            return Ok(());
        }

        let (restored, is_symlink) = match entry.kind {
            EntryKind::Directory => (materializer.create_dir(entry), false),
            EntryKind::Symlink => (materializer.create_symlink(entry), true),
            _ => (materializer.write_regular(reader, entry)?, false),
        };

        if restored {
            materializer.apply_metadata(entry, is_symlink);
        }

        Ok(())
    }
}

fn check_dest_root(dest_root: &Path) -> Result<(), UntarError> {
    if dest_root.as_os_str().is_empty() {
        return Err(UntarError::NotExist(dest_root.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let mut path = PathBuf::from("./target/testout");
        path.push(module_path!());
        path.push(name);
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn build_archive(path: &Path, files: &[(&str, &str)]) {
        let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_entries_are_cached() {
        let dir = testdir("cache");
        let archive = dir.join("a.tar");
        build_archive(&archive, &[("one", "1"), ("dir/two", "22")]);

        let mut untar = UnTarFile::new();
        let entries = untar.entries(&archive).unwrap().to_vec();
        assert_eq!(
            entries,
            vec![
                ListedEntry {
                    path: "one".into(),
                    size: 1,
                    data_offset: 512
                },
                ListedEntry {
                    path: "dir/two".into(),
                    size: 2,
                    data_offset: 1536
                },
            ]
        );

        // answered from the cache
        std::fs::remove_file(&archive).unwrap();
        assert_eq!(untar.list_entries(&archive).unwrap(), vec!["one", "dir/two"]);

        untar.reset();
        assert!(matches!(untar.list_entries(&archive), Err(UntarError::Io(_))));
    }

    #[test]
    fn test_abort() {
        let dir = testdir("abort");
        let archive = dir.join("a.tar");
        build_archive(&archive, &[("one", "1")]);

        let abort = Arc::new(AtomicBool::new(true));
        let mut untar = UnTarFile::with_options(UntarOptions {
            abort: Some(Arc::clone(&abort)),
            source_removal: SourceRemoval::Never,
            ..Default::default()
        });

        let out = dir.join("out");
        assert!(matches!(untar.unpack(&archive, &out, 0), Err(UntarError::Aborted)));
        assert!(!out.join("one").exists());

        abort.store(false, Ordering::SeqCst);
        untar.unpack(&archive, &out, 0).unwrap();
        assert_eq!(std::fs::read(out.join("one")).unwrap(), b"1");
        assert!(archive.exists());
    }

    #[test]
    fn test_empty_dest_root() {
        let dir = testdir("empty-root");
        let archive = dir.join("a.tar");
        build_archive(&archive, &[("one", "1")]);

        let mut untar = UnTarFile::with_options(UntarOptions {
            source_removal: SourceRemoval::OnSuccess,
            ..Default::default()
        });
        assert!(matches!(
            untar.unpack(&archive, Path::new(""), 0),
            Err(UntarError::NotExist(_))
        ));
        assert!(archive.exists());
        assert!(!untar.is_split_archive(&archive, Path::new("")));
    }
}
