//! GNU long name and long link records.

use std::io::{Read, Seek};

use proxmox_lang::io_format_err;

use super::block::BlockReader;
use super::header::{EntryKind, TarHeader};
use super::UntarError;

/// Overrides collected from GNU extension records, applied to the next
/// regular header.
#[derive(Debug, Default)]
pub struct PendingExtensions {
    long_name: Option<Vec<u8>>,
    long_link: Option<Vec<u8>>,
}

impl PendingExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the payload of a `'L'` or `'K'` record.
    ///
    /// Payloads of `path_max_len` bytes or more are refused. A short payload
    /// read drops the override and fails with an I/O error. The stream is
    /// always left at the next header position.
    pub fn accumulate<R: Read + Seek>(
        &mut self,
        header: &TarHeader,
        reader: &mut BlockReader<R>,
        path_max_len: usize,
    ) -> Result<(), UntarError> {
        let kind = header.kind();
        let slot = match kind {
            EntryKind::GnuLongName => &mut self.long_name,
            EntryKind::GnuLongLink => &mut self.long_link,
            other => {
                return Err(UntarError::Param(format!("{:?} is not an extension record", other)));
            }
        };

        *slot = None;

        let size = header.size();
        if size >= path_max_len as u64 {
            return Err(UntarError::Alloc(format!(
                "{:?} record of {} bytes exceeds path limit {}",
                kind, size, path_max_len
            )));
        }

        let start = reader.position();
        let mut buffer = vec![0u8; size as usize + 1];
        let complete = reader.read_payload(&mut buffer[..size as usize])?;
        reader.seek_to(start + header.block_count() * super::BLOCK_SIZE as u64)?;

        if !complete {
            return Err(UntarError::Io(io_format_err!("short read in {:?} record", kind)));
        }

        if let Some(end) = buffer.iter().position(|&b| b == 0) {
            buffer.truncate(end);
        }
        *slot = Some(buffer);

        Ok(())
    }

    pub fn long_name(&self) -> Option<&[u8]> {
        self.long_name.as_deref()
    }

    pub fn long_link(&self) -> Option<&[u8]> {
        self.long_link.as_deref()
    }

    /// Take both overrides, leaving nothing pending.
    pub fn take(&mut self) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        (self.long_name.take(), self.long_link.take())
    }

    pub fn clear(&mut self) {
        self.long_name = None;
        self.long_link = None;
    }

    pub fn is_empty(&self) -> bool {
        self.long_name.is_none() && self.long_link.is_none()
    }
}
