//! Tar block header decoding.

use std::fmt;

use super::BLOCK_SIZE;

const NAME_OFFSET: usize = 0;
const NAME_LEN: usize = 100;
const MODE_OFFSET: usize = 100;
const MODE_LEN: usize = 8;
const UID_OFFSET: usize = 108;
const UID_LEN: usize = 8;
const GID_OFFSET: usize = 116;
const GID_LEN: usize = 8;
const SIZE_OFFSET: usize = 124;
const SIZE_LEN: usize = 12;
const CHKSUM_OFFSET: usize = 148;
const CHKSUM_LEN: usize = 8;
const TYPEFLAG_OFFSET: usize = 156;
const LINKNAME_OFFSET: usize = 157;
const LINKNAME_LEN: usize = 100;
const MAGIC_OFFSET: usize = 257;

/// Matches both the POSIX `"ustar\0"` and the GNU `"ustar "` magic.
pub const TMAGIC: &[u8; 5] = b"ustar";

const BLANK_SPACE: u32 = 0x20;

/// Entry type, decoded from the typeflag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `'0'` or `'\0'`
    Regular,
    /// `'2'`
    Symlink,
    /// `'5'`
    Directory,
    /// `'L'`, the payload is the name of the following entry
    GnuLongName,
    /// `'K'`, the payload is the link target of the following entry
    GnuLongLink,
    /// `'8'`, first piece of a file spread over several chunks
    SplitStart,
    /// `'9'`
    SplitContinue,
    /// `'A'`
    SplitEnd,
    Unknown(u8),
}

impl EntryKind {
    pub fn from_typeflag(flag: u8) -> Self {
        match flag {
            b'0' | b'\0' => EntryKind::Regular,
            b'2' => EntryKind::Symlink,
            b'5' => EntryKind::Directory,
            b'L' => EntryKind::GnuLongName,
            b'K' => EntryKind::GnuLongLink,
            b'8' => EntryKind::SplitStart,
            b'9' => EntryKind::SplitContinue,
            b'A' => EntryKind::SplitEnd,
            other => EntryKind::Unknown(other),
        }
    }

    pub fn is_split_marker(self) -> bool {
        matches!(
            self,
            EntryKind::SplitStart | EntryKind::SplitContinue | EntryKind::SplitEnd
        )
    }

    /// Continuation pieces are appended to what previous chunks restored.
    pub fn appends(self) -> bool {
        matches!(self, EntryKind::SplitContinue | EntryKind::SplitEnd)
    }
}

/// Parse an octal number field.
///
/// Leading non-octal bytes (spaces, padding) are skipped, then digits are
/// accumulated until a non-octal byte, the end of the C string or `width`
/// bytes have been consumed.
pub fn parse_octal(field: &[u8], width: usize) -> u64 {
    let field = &field[..width.min(field.len())];
    let field = match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    };

    let is_octal = |b: &u8| (b'0'..=b'7').contains(b);

    field
        .iter()
        .skip_while(|b| !is_octal(b))
        .take_while(|b| is_octal(b))
        .fold(0u64, |value, &b| value.wrapping_mul(8).wrapping_add((b - b'0') as u64))
}

/// Return the bytes of a NUL terminated string field.
fn c_str_field(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

/// A raw 512 byte tar header block.
#[derive(Clone)]
pub struct TarHeader {
    block: [u8; BLOCK_SIZE],
}

impl TarHeader {
    pub fn from_block(block: &[u8; BLOCK_SIZE]) -> Self {
        Self { block: *block }
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.block
    }

    fn field(&self, offset: usize, len: usize) -> &[u8] {
        &self.block[offset..offset + len]
    }

    pub fn name_bytes(&self) -> &[u8] {
        c_str_field(self.field(NAME_OFFSET, NAME_LEN))
    }

    pub fn link_name_bytes(&self) -> &[u8] {
        c_str_field(self.field(LINKNAME_OFFSET, LINKNAME_LEN))
    }

    pub fn mode(&self) -> u32 {
        parse_octal(self.field(MODE_OFFSET, MODE_LEN), MODE_LEN) as u32
    }

    pub fn uid(&self) -> u64 {
        parse_octal(self.field(UID_OFFSET, UID_LEN), UID_LEN)
    }

    pub fn gid(&self) -> u64 {
        parse_octal(self.field(GID_OFFSET, GID_LEN), GID_LEN)
    }

    pub fn size(&self) -> u64 {
        parse_octal(self.field(SIZE_OFFSET, SIZE_LEN), SIZE_LEN)
    }

    /// Number of 512 byte blocks occupied by the payload.
    pub fn block_count(&self) -> u64 {
        self.size().div_ceil(BLOCK_SIZE as u64)
    }

    pub fn typeflag(&self) -> u8 {
        self.block[TYPEFLAG_OFFSET]
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_typeflag(self.typeflag())
    }

    pub fn checksum(&self) -> u32 {
        parse_octal(self.field(CHKSUM_OFFSET, CHKSUM_LEN), CHKSUM_LEN) as u32
    }

    /// Sum of all header bytes, the checksum field counted as blanks.
    pub fn compute_checksum(&self) -> u32 {
        self.block
            .iter()
            .enumerate()
            .map(|(n, &b)| {
                if (CHKSUM_OFFSET..CHKSUM_OFFSET + CHKSUM_LEN).contains(&n) {
                    BLANK_SPACE
                } else {
                    b as u32
                }
            })
            .sum()
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum()
    }

    pub fn has_magic(&self) -> bool {
        self.block[MAGIC_OFFSET..].starts_with(TMAGIC)
    }

    pub fn is_valid(&self) -> bool {
        self.has_magic() && self.verify_checksum()
    }

    /// An empty block has a NUL in place of the first name byte.
    pub fn is_empty(&self) -> bool {
        self.block[0] == 0
    }
}

impl fmt::Debug for TarHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarHeader")
            .field("name", &String::from_utf8_lossy(self.name_bytes()))
            .field("kind", &self.kind())
            .field("size", &self.size())
            .field("mode", &format_args!("{:o}", self.mode()))
            .field("uid", &self.uid())
            .field("gid", &self.gid())
            .finish()
    }
}
