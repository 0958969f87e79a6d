//! Block level access to a tar stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use proxmox_io::ReadExt;
use proxmox_lang::io_format_err;

use super::header::TarHeader;
use super::{format_bail, UntarError, BLOCK_SIZE};

/// Result of reading the next header position.
#[derive(Debug)]
pub enum BlockRead {
    /// A valid header block.
    Header(TarHeader),
    /// Clean end of archive.
    End,
}

/// Reads 512 byte blocks from an archive file.
///
/// Keeps track of the read position, so that handlers can re-synchronise
/// to the next header after reading only parts of a payload.
pub struct BlockReader<R> {
    reader: R,
    total_size: u64,
    position: u64,
    split_tolerant: bool,
    tolerance: u64,
}

impl BlockReader<File> {
    /// Open an archive and check that its size is a multiple of the block size.
    pub fn open(path: &Path) -> Result<Self, UntarError> {
        let file = File::open(path).map_err(|err| {
            log::error!("unable to open archive {:?} - {}", path, err);
            UntarError::Io(err)
        })?;
        Self::new(file)
    }
}

impl<R: Read + Seek> BlockReader<R> {
    pub fn new(mut reader: R) -> Result<Self, UntarError> {
        let total_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        if total_size % BLOCK_SIZE as u64 != 0 {
            format_bail!("archive size {} is not a multiple of {} bytes", total_size, BLOCK_SIZE);
        }

        Ok(Self {
            reader,
            total_size,
            position: 0,
            split_tolerant: false,
            tolerance: 0,
        })
    }

    /// Split chunks may end in the middle of an entry. In this mode an empty
    /// read, or an empty invalid block at a position not past the end of the
    /// stream plus `tolerance`, counts as the end of the chunk instead of an
    /// error. This includes empty blocks inside the chunk.
    pub fn set_split_tolerant(&mut self, tolerant: bool, tolerance: u64) {
        self.split_tolerant = tolerant;
        self.tolerance = tolerance;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn not_past_end(&self) -> bool {
        self.position <= self.total_size.saturating_add(self.tolerance)
    }

    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<bool, UntarError> {
        let complete = self.reader.read_exact_or_eof(block)?;
        if complete {
            self.position += BLOCK_SIZE as u64;
        }
        Ok(complete)
    }

    /// Read the next header block.
    pub fn next_header(&mut self) -> Result<BlockRead, UntarError> {
        let mut block = [0u8; BLOCK_SIZE];

        if !self.read_block(&mut block)? {
            // read_exact_or_eof only reports a clean EOF here, partial reads are errors
            if self.split_tolerant && self.not_past_end() {
                log::debug!("end of split chunk at {}", self.position);
                return Ok(BlockRead::End);
            }
            return Err(UntarError::Io(io_format_err!(
                "unexpected end of archive at offset {}",
                self.position
            )));
        }

        let header = TarHeader::from_block(&block);

        if header.is_empty() {
            let mut tail = [0u8; BLOCK_SIZE];
            if self.read_block(&mut tail)? && tail[0] == 0 {
                log::debug!("found end of archive marker at {}", self.position);
                return Ok(BlockRead::End);
            }
        }

        if !header.is_valid() {
            if self.split_tolerant && self.not_past_end() && header.is_empty() {
                log::debug!("empty block at end of split chunk ({})", self.position);
                return Ok(BlockRead::End);
            }
            format_bail!(
                "invalid tar header at offset {} (size {})",
                self.position.saturating_sub(BLOCK_SIZE as u64),
                self.total_size
            );
        }

        Ok(BlockRead::Header(header))
    }

    /// Fill `buf` from the current payload position.
    ///
    /// Returns `false` if the archive ends before the buffer is filled.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<bool, UntarError> {
        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.position = self.reader.stream_position()?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Position the stream at an absolute offset.
    pub fn seek_to(&mut self, offset: u64) -> Result<(), UntarError> {
        self.position = self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn header_block(name: &str, size: u64) -> [u8; BLOCK_SIZE] {
        let mut header = tar::Header::new_ustar();
        header.set_path(name).unwrap();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        *header.as_bytes()
    }

    fn archive(blocks: &[[u8; BLOCK_SIZE]]) -> Cursor<Vec<u8>> {
        Cursor::new(blocks.iter().flat_map(|b| b.iter().copied()).collect())
    }

    #[test]
    fn test_unaligned_size() {
        let data = Cursor::new(vec![0u8; BLOCK_SIZE + 1]);
        match BlockReader::new(data) {
            Err(UntarError::Format(_)) => (),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_two_zero_blocks_end() {
        let zero = [0u8; BLOCK_SIZE];
        let mut payload = [0u8; BLOCK_SIZE];
        payload[..4].copy_from_slice(b"data");

        // trailing garbage after the end marker is never read
        let data = archive(&[header_block("a", 4), payload, zero, zero, [0xffu8; BLOCK_SIZE]]);
        let mut reader = BlockReader::new(data).unwrap();

        let header = match reader.next_header().unwrap() {
            BlockRead::Header(header) => header,
            BlockRead::End => panic!("missing header"),
        };
        assert_eq!(header.name_bytes(), b"a");
        assert_eq!(reader.position(), 512);

        let mut buf = [0u8; 4];
        assert!(reader.read_payload(&mut buf).unwrap());
        assert_eq!(&buf, b"data");
        reader.seek_to(512 + header.block_count() * BLOCK_SIZE as u64).unwrap();

        assert!(matches!(reader.next_header().unwrap(), BlockRead::End));
        assert_eq!(reader.position(), 2048);
    }

    #[test]
    fn test_truncated_archive() {
        let data = archive(&[header_block("a", 0)]);
        let mut reader = BlockReader::new(data).unwrap();
        assert!(matches!(reader.next_header().unwrap(), BlockRead::Header(_)));
        match reader.next_header() {
            Err(UntarError::Io(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_split_tolerant_end() {
        let data = archive(&[header_block("a", 0)]);
        let mut reader = BlockReader::new(data).unwrap();
        reader.set_split_tolerant(true, 512 * 1024);
        assert!(matches!(reader.next_header().unwrap(), BlockRead::Header(_)));
        assert!(matches!(reader.next_header().unwrap(), BlockRead::End));
    }

    #[test]
    fn test_invalid_header() {
        let mut block = header_block("a", 0);
        block[0] = b'b';
        let mut reader = BlockReader::new(archive(&[block])).unwrap();
        match reader.next_header() {
            Err(UntarError::Format(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }

        // a single zero block followed by data is not an end marker
        let zero = [0u8; BLOCK_SIZE];
        let mut reader = BlockReader::new(archive(&[zero, header_block("a", 0)])).unwrap();
        assert!(matches!(reader.next_header(), Err(UntarError::Format(_))));

        // split chunks end at an empty block, also in the middle of the stream
        let mut reader = BlockReader::new(archive(&[zero, header_block("a", 0)])).unwrap();
        reader.set_split_tolerant(true, 512 * 1024);
        assert!(matches!(reader.next_header().unwrap(), BlockRead::End));
    }
}
