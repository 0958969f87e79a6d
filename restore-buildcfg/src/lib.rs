//! Exports configuration data from the build system

/// First uid handed out to application sandboxes. Files owned by a lower uid
/// belong to the system and keep their ownership on restore.
pub const APP_ID_START: u32 = 10000;

/// Distance between the gids of one application sandbox (e.g. the "cache"
/// gid relative to the base uid).
pub const UID_GID_OFFSET: u32 = 10000;

/// Mode applied to every restored file and directory once it is complete.
pub const RESTORE_FILE_MODE: u32 = 0o700;

/// Mode a regular file is created with while its contents are written.
pub const RESTORE_NEW_FILE_MODE: u32 = 0o600;

/// Mode used for directories created on the way to an entry.
pub const RESTORE_DIR_MODE: u32 = 0o700;

/// Upper bound for destination paths and GNU long name/link payloads.
pub const PATH_MAX_LEN: usize = 2048;

/// Size of the copy buffer used to stream file contents out of an archive.
///
/// Split chunks may report a read position up to this far past their size.
pub const READ_BUFF_SIZE: usize = 512 * 1024;

/// Environment variable holding the log level of the command line tools.
pub const UNTAR_LOG_ENV: &str = "UNTAR_LOG";
