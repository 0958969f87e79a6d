//! Tar archive extraction for restore sessions.
//!
//! Archives are POSIX ustar streams of 512 byte blocks, with GNU long name
//! (`'L'`) and long link (`'K'`) records. Large backups may be spread over
//! several archive chunks ("split sets"). Files crossing a chunk boundary
//! are stored as pieces with the type flags `'8'` (start), `'9'` (continue)
//! and `'A'` (end), and the chunks are listed in a manifest, see [`split`].
//!
//! Restored entries get a fixed mode, and owners of sandboxed applications
//! are remapped onto the restoring application, see [`fix_up_owner`].

pub(crate) mod block;
pub(crate) mod extension;
pub(crate) mod header;
pub(crate) mod materialize;
pub(crate) mod path;
pub mod split;

mod error;
mod extract;

pub use error::{
    status_code, UntarError, ERR_ABORTED, ERR_FORMAT, ERR_IO, ERR_MALLOC, ERR_NOEXIST, ERR_PARAM,
};
pub(crate) use error::format_bail;

pub use block::{BlockRead, BlockReader};
pub use extension::PendingExtensions;
pub use extract::{ListedEntry, ParsedEntry, SourceRemoval, UnTarFile, UntarOptions};
pub use header::{parse_octal, EntryKind, TarHeader};
pub use materialize::{fix_up_owner, EntryMaterializer};
pub use path::{create_dir_with_recursive, gen_real_path};

/// Size of a tar block.
pub const BLOCK_SIZE: usize = 512;
