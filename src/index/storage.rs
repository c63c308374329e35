//! On-disk layout of one taxonomy's index.
//!
//! `{index_root}/{taxonomy}/` holds two files:
//!
//! `index.bin` (the primary data file)
//! - version: u8 (1)
//! - fingerprint: [u8; 32] (SHA-256 of the embedder id)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - header checksum: u32 (CRC32 of the fields above)
//! - vectors: [f32; entry_count * dimensions] (little-endian, row-major)
//! - vector checksum: u32 (CRC32 of the vector bytes)
//!
//! `documents.json` holds the parallel document array.
//!
//! Saving writes a complete staging directory next to the target and renames
//! it into place, so the two files always come from the same generation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::index::vectors::{IndexError, IndexedDocument, VectorIndex};

const FORMAT_VERSION: u8 = 1;

/// version(1) + fingerprint(32) + dimensions(4) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 49;
const HEADER_BODY: usize = HEADER_SIZE - 4;

pub const INDEX_FILE: &str = "index.bin";
const DOCUMENTS_FILE: &str = "documents.json";

#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error("version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("{0} checksum mismatch: file may be corrupted")]
    ChecksumMismatch(&'static str),

    #[error("documents: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

struct Header {
    version: u8,
    fingerprint: [u8; 32],
    dimensions: u32,
    entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.fingerprint);
        bytes[33..37].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[37..45].copy_from_slice(&self.entry_count.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..HEADER_BODY]);
        bytes[45..49].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, IndexStorageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IndexStorageError::InvalidFormat(format!(
                "file is {} bytes, header needs {HEADER_SIZE}",
                bytes.len()
            )));
        }

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes(le_array(&bytes[45..49]));
        if stored != crc32fast::hash(&bytes[..HEADER_BODY]) {
            return Err(IndexStorageError::ChecksumMismatch("header"));
        }

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&bytes[1..33]);

        Ok(Header {
            version,
            fingerprint,
            dimensions: u32::from_le_bytes(le_array(&bytes[33..37])),
            entry_count: u64::from_le_bytes(le_array(&bytes[37..45])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// One taxonomy's index directory.
#[derive(Clone, Debug)]
pub struct IndexDirectory {
    path: PathBuf,
}

impl IndexDirectory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True only if the primary data file is present, not just the directory.
    pub fn exists(&self) -> bool {
        self.path.join(INDEX_FILE).is_file()
    }

    pub fn load(&self) -> Result<VectorIndex, IndexStorageError> {
        let data = std::fs::read(self.path.join(INDEX_FILE))?;
        let header = Header::decode(&data)?;
        log::debug!(
            "reading index v{} from {} ({} x {})",
            header.version,
            self.path.display(),
            header.entry_count,
            header.dimensions
        );

        let dimensions = header.dimensions as usize;
        let block_len = (header.entry_count as usize)
            .checked_mul(dimensions)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| IndexStorageError::InvalidFormat("vector block overflows".into()))?;

        let body = &data[HEADER_SIZE..];
        if body.len() != block_len + 4 {
            return Err(IndexStorageError::InvalidFormat(format!(
                "expected {} vector bytes, found {}",
                block_len + 4,
                body.len()
            )));
        }

        let (block, checksum) = body.split_at(block_len);
        if u32::from_le_bytes(le_array(checksum)) != crc32fast::hash(block) {
            return Err(IndexStorageError::ChecksumMismatch("vector"));
        }

        let vectors: Vec<f32> = block
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(le_array(c)))
            .collect();

        let documents: Vec<IndexedDocument> =
            serde_json::from_slice(&std::fs::read(self.path.join(DOCUMENTS_FILE))?)?;
        if documents.len() as u64 != header.entry_count {
            return Err(IndexStorageError::InvalidFormat(format!(
                "header lists {} entries, documents.json has {}",
                header.entry_count,
                documents.len()
            )));
        }

        Ok(VectorIndex::from_parts(
            dimensions,
            vectors,
            documents,
            header.fingerprint,
        )?)
    }

    /// Replace the whole directory with `index`.
    pub fn save(&self, index: &VectorIndex) -> Result<(), IndexStorageError> {
        let (parent, name) = self.split_path()?;
        std::fs::create_dir_all(&parent)?;

        let generation = rusty_ulid::generate_ulid_string();
        let staging = parent.join(format!(".{name}.staging-{generation}"));
        let retired = parent.join(format!(".{name}.retired-{generation}"));

        if let Err(err) = write_files(&staging, index) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err);
        }

        let had_previous = self.path.exists();
        if had_previous {
            if let Err(err) = std::fs::rename(&self.path, &retired) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(err.into());
            }
        }

        if let Err(err) = std::fs::rename(&staging, &self.path) {
            if had_previous {
                let _ = std::fs::rename(&retired, &self.path);
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(err.into());
        }

        if had_previous {
            if let Err(err) = std::fs::remove_dir_all(&retired) {
                log::warn!("failed to remove {}: {err}", retired.display());
            }
        }
        Ok(())
    }

    /// Returns whether anything was deleted.
    pub fn delete(&self) -> Result<bool, IndexStorageError> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&self.path)?;
        Ok(true)
    }

    fn split_path(&self) -> Result<(PathBuf, String), IndexStorageError> {
        let parent = self.path.parent().map(Path::to_path_buf);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        match (parent, name) {
            (Some(parent), Some(name)) => Ok((parent, name)),
            _ => Err(IndexStorageError::InvalidFormat(format!(
                "{} is not a valid index directory",
                self.path.display()
            ))),
        }
    }
}

fn write_files(dir: &Path, index: &VectorIndex) -> Result<(), IndexStorageError> {
    std::fs::create_dir_all(dir)?;

    let header = Header {
        version: FORMAT_VERSION,
        fingerprint: *index.fingerprint(),
        dimensions: u32::try_from(index.dimensions())
            .map_err(|_| IndexStorageError::InvalidFormat("dimension too large".into()))?,
        entry_count: index.len() as u64,
    };

    let mut block = Vec::with_capacity(index.vectors().len() * 4);
    for value in index.vectors() {
        block.extend_from_slice(&value.to_le_bytes());
    }

    let file = File::create(dir.join(INDEX_FILE))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header.encode())?;
    writer.write_all(&block)?;
    writer.write_all(&crc32fast::hash(&block).to_le_bytes())?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    let file = File::create(dir.join(DOCUMENTS_FILE))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, index.documents())?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vectors::EntryMeta;

    fn sample(n: usize, fingerprint: [u8; 32]) -> VectorIndex {
        let docs = (0..n)
            .map(|i| IndexedDocument {
                content: format!("reference {i}"),
                meta: EntryMeta {
                    tag: format!("tag{i}"),
                    datatype: "text".to_string(),
                    reference: format!("reference {i}"),
                    taxonomy: "brsr".to_string(),
                },
            })
            .collect();
        let vectors = (0..n).map(|i| vec![i as f32, 0.5, -1.0, 2.0]).collect();
        VectorIndex::from_embeddings(docs, vectors, fingerprint).unwrap()
    }

    #[test]
    fn test_save_then_load_preserves_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDirectory::new(tmp.path().join("brsr"));
        assert!(!dir.exists());

        let index = sample(5, [7u8; 32]);
        dir.save(&index).unwrap();
        assert!(dir.exists());

        let loaded = dir.load().unwrap();
        assert_eq!(loaded.dimensions(), 4);
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.vectors(), index.vectors());
        assert_eq!(loaded.documents(), index.documents());
        assert_eq!(loaded.fingerprint(), &[7u8; 32]);
    }

    #[test]
    fn test_resave_replaces_directory_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDirectory::new(tmp.path().join("brsr"));
        dir.save(&sample(3, [0u8; 32])).unwrap();
        dir.save(&sample(8, [0u8; 32])).unwrap();

        assert_eq!(dir.load().unwrap().len(), 8);
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["brsr".to_string()]);
    }

    #[test]
    fn test_directory_without_index_file_does_not_exist() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("esrs")).unwrap();
        let dir = IndexDirectory::new(tmp.path().join("esrs"));
        assert!(!dir.exists());
        assert!(matches!(dir.load(), Err(IndexStorageError::Io(_))));
    }

    #[test]
    fn test_corrupted_header_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDirectory::new(tmp.path().join("brsr"));
        dir.save(&sample(2, [0u8; 32])).unwrap();

        let path = tmp.path().join("brsr").join(INDEX_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[34] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            dir.load(),
            Err(IndexStorageError::ChecksumMismatch("header"))
        ));
    }

    #[test]
    fn test_corrupted_vectors_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDirectory::new(tmp.path().join("brsr"));
        dir.save(&sample(2, [0u8; 32])).unwrap();

        let path = tmp.path().join("brsr").join(INDEX_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 1] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            dir.load(),
            Err(IndexStorageError::ChecksumMismatch("vector"))
        ));
    }

    #[test]
    fn test_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = IndexDirectory::new(tmp.path().join("brsr"));
        assert!(!dir.delete().unwrap());
        dir.save(&sample(1, [0u8; 32])).unwrap();
        assert!(dir.delete().unwrap());
        assert!(!tmp.path().join("brsr").exists());
    }
}
