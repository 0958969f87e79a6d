//! Split archive manifests.
//!
//! A split set is described by a text manifest next to its chunks, one line
//! per chunk in extraction order:
//!
//! ```text
//! <chunk file name>|<size in bytes>
//! ```
//!
//! Chunk names are relative to the directory containing the manifest.

use std::path::{Path, PathBuf};

use super::{format_bail, UntarError};

/// One chunk of a split set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct SplitManifest {
    chunks: Vec<ChunkInfo>,
}

impl SplitManifest {
    /// Read and parse a manifest file.
    pub fn load(manifest: &Path, path_max_len: usize) -> Result<Self, UntarError> {
        let text = match std::fs::read(manifest) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UntarError::NotExist(manifest.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };

        let base = match manifest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        Self::parse(base, &text, path_max_len)
    }

    /// Parse manifest content, resolving chunk names against `base`.
    pub fn parse(base: &Path, text: &[u8], path_max_len: usize) -> Result<Self, UntarError> {
        let text = match std::str::from_utf8(text) {
            Ok(text) => text,
            Err(err) => format_bail!("manifest is not valid UTF-8 - {}", err),
        };

        let mut chunks = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            if line.len() >= path_max_len {
                format_bail!("manifest line {} exceeds {} bytes", lineno + 1, path_max_len);
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let (name, size) = match line.rsplit_once('|') {
                Some(parts) => parts,
                None => format_bail!("manifest line {} has no size field", lineno + 1),
            };

            if name.is_empty() {
                format_bail!("manifest line {} has no chunk name", lineno + 1);
            }

            let size: u64 = match size.trim().parse() {
                Ok(size) => size,
                Err(_) => format_bail!("manifest line {} has invalid size {:?}", lineno + 1, size),
            };

            chunks.push(ChunkInfo {
                path: base.join(name),
                size,
            });
        }

        Ok(Self { chunks })
    }

    /// Check that every chunk exists with its declared size.
    pub fn validate(&self) -> Result<(), UntarError> {
        for chunk in &self.chunks {
            let metadata = match std::fs::metadata(&chunk.path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    log::error!("split chunk {:?} does not exist", chunk.path);
                    return Err(UntarError::NotExist(chunk.path.clone()));
                }
                Err(err) => return Err(err.into()),
            };

            if metadata.len() != chunk.size {
                format_bail!(
                    "split chunk {:?} has {} bytes, manifest declares {}",
                    chunk.path,
                    metadata.len(),
                    chunk.size
                );
            }
        }

        Ok(())
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let text = b"part.0.tar|1024\r\n\npart|with|pipes.tar|512\n  \npart.2.tar|0";
        let manifest = SplitManifest::parse(Path::new("/data/set"), text, 2048).unwrap();

        assert_eq!(
            manifest.chunks(),
            &[
                ChunkInfo {
                    path: PathBuf::from("/data/set/part.0.tar"),
                    size: 1024
                },
                ChunkInfo {
                    path: PathBuf::from("/data/set/part|with|pipes.tar"),
                    size: 512
                },
                ChunkInfo {
                    path: PathBuf::from("/data/set/part.2.tar"),
                    size: 0
                },
            ]
        );
    }

    #[test]
    fn test_malformed_manifest() {
        let base = Path::new("/data");
        let cases: [&[u8]; 5] = [
            b"no-size-field\n",
            b"a.tar|\n",
            b"a.tar|12k\n",
            b"|512\n",
            b"\xff|1\n",
        ];
        for text in cases {
            match SplitManifest::parse(base, text, 2048) {
                Err(UntarError::Format(_)) => (),
                other => panic!("{:?} was accepted: {:?}", text, other),
            }
        }

        let long = format!("{}|1\n", "x".repeat(2048));
        assert!(matches!(
            SplitManifest::parse(base, long.as_bytes(), 2048),
            Err(UntarError::Format(_))
        ));
    }

    #[test]
    fn test_missing_manifest() {
        let path = Path::new("./target/testout/no-such-manifest.txt");
        assert!(matches!(
            SplitManifest::load(path, 2048),
            Err(UntarError::NotExist(_))
        ));
    }
}
