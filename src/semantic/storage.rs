//! Durable storage of photo embeddings.
//!
//! File format: vectors.bin (append-only log)
//!
//! Header (39 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, later entries for the same id win):
//! - photo_id: u64 (little-endian)
//! - captured_at: i64 (little-endian, unix seconds)
//! - embedding: [f32; dimensions] (little-endian)
//! - checksum: u32 (CRC32 of the entry fields before checksum)

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + checksum(4)
const HEADER_SIZE: usize = 39;

/// One persisted embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// Stable photo identity
    pub id: u64,
    /// Capture (modification) time in unix seconds
    pub captured_at: i64,
    /// L2-normalized embedding
    pub vector: Vec<f32>,
}

/// Errors that can occur during repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Repository lock poisoned")]
    Poisoned,
}

/// Key/value store of photo id to embedding record.
pub trait EmbeddingRepository: Send + Sync {
    /// Embedding length every record must have.
    fn dimensions(&self) -> usize;

    /// Insert or fully replace the record for `record.id`.
    fn upsert(&self, record: EmbeddingRecord) -> Result<(), RepositoryError>;

    fn get_by_id(&self, id: u64) -> Result<Option<EmbeddingRecord>, RepositoryError>;

    /// Consistent snapshot of every record, ordered by ascending id.
    fn load_all(&self) -> Result<Vec<EmbeddingRecord>, RepositoryError>;

    fn len(&self) -> Result<usize, RepositoryError>;

    /// Drop every record.
    fn clear(&self) -> Result<(), RepositoryError>;

    fn contains(&self, id: u64) -> Result<bool, RepositoryError> {
        Ok(self.get_by_id(id)?.is_some())
    }
}

fn check_dimensions(expected: usize, record: &EmbeddingRecord) -> Result<(), RepositoryError> {
    if record.vector.len() != expected {
        return Err(RepositoryError::DimensionMismatch {
            expected,
            got: record.vector.len(),
        });
    }
    Ok(())
}

/// Compute SHA256 hash of the model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Volatile repository, mostly for tests.
pub struct MemoryRepository {
    dimensions: usize,
    records: RwLock<BTreeMap<u64, EmbeddingRecord>>,
}

impl MemoryRepository {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl EmbeddingRepository for MemoryRepository {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn upsert(&self, record: EmbeddingRecord) -> Result<(), RepositoryError> {
        check_dimensions(self.dimensions, &record)?;
        let mut records = self.records.write().map_err(|_| RepositoryError::Poisoned)?;
        records.insert(record.id, record);
        Ok(())
    }

    fn get_by_id(&self, id: u64) -> Result<Option<EmbeddingRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.get(&id).cloned())
    }

    fn contains(&self, id: u64) -> Result<bool, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.contains_key(&id))
    }

    fn load_all(&self) -> Result<Vec<EmbeddingRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }

    fn len(&self) -> Result<usize, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.len())
    }

    fn clear(&self) -> Result<(), RepositoryError> {
        let mut records = self.records.write().map_err(|_| RepositoryError::Poisoned)?;
        records.clear();
        Ok(())
    }
}

/// Repository persisted to an append-only `vectors.bin` log.
///
/// The whole log is replayed into memory on open. Each upsert appends one
/// entry and syncs it before the in-memory view changes, so readers never
/// observe a record that is not on disk.
pub struct FileRepository {
    path: PathBuf,
    model_id: [u8; 32],
    dimensions: usize,
    records: RwLock<BTreeMap<u64, EmbeddingRecord>>,
    log: Mutex<BufWriter<File>>,
}

impl FileRepository {
    /// Open an existing log, or start a new one if the file is missing.
    ///
    /// Entries with a bad checksum are skipped. A torn trailing entry (e.g.
    /// from a crash mid-append) is cut off.
    pub fn open(
        path: &Path,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, RepositoryError> {
        if !path.exists() {
            return Self::create(path, model_id, dimensions);
        }

        let data = std::fs::read(path)?;
        let header = Header::decode(&data)?;
        header.validate(&model_id, dimensions)?;

        let entry_size = entry_size(dimensions);
        let mut records = BTreeMap::new();
        let mut offset = HEADER_SIZE;

        let mut corrupt = 0usize;

        // entries have a fixed size, so a bad checksum only costs that entry
        while offset + entry_size <= data.len() {
            match decode_entry(&data[offset..offset + entry_size], dimensions) {
                Some(record) => {
                    records.insert(record.id, record);
                }
                None => {
                    log::warn!("{}: skipping corrupt entry at byte {offset}", path.display());
                    corrupt += 1;
                }
            }
            offset += entry_size;
        }

        if corrupt > 0 {
            log::warn!("{}: {corrupt} corrupt entries skipped", path.display());
        }

        if offset < data.len() {
            log::warn!(
                "{}: discarding {} bytes of a torn trailing entry",
                path.display(),
                data.len() - offset
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        log::debug!("{}: loaded {} embeddings", path.display(), records.len());

        Ok(Self {
            path: path.to_path_buf(),
            model_id,
            dimensions,
            records: RwLock::new(records),
            log: Mutex::new(open_append(path)?),
        })
    }

    /// Start an empty log, replacing any existing file.
    pub fn create(
        path: &Path,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, RepositoryError> {
        if dimensions == 0 || dimensions > u16::MAX as usize {
            return Err(RepositoryError::InvalidFormat(format!(
                "unsupported dimensions {dimensions}"
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let header = Header {
            version: FORMAT_VERSION,
            model_id,
            dimensions: dimensions as u16,
        };
        write_atomic(path, &header, std::iter::empty())?;

        Ok(Self {
            path: path.to_path_buf(),
            model_id,
            dimensions,
            records: RwLock::new(BTreeMap::new()),
            log: Mutex::new(open_append(path)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log with exactly one entry per id.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn compact(&self) -> Result<(), RepositoryError> {
        let mut log = self.log.lock().map_err(|_| RepositoryError::Poisoned)?;
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;

        log.flush()?;
        write_atomic(&self.path, &self.header(), records.values())?;
        *log = open_append(&self.path)?;

        log::debug!("{}: compacted to {} entries", self.path.display(), records.len());
        Ok(())
    }

    fn header(&self) -> Header {
        Header {
            version: FORMAT_VERSION,
            model_id: self.model_id,
            dimensions: self.dimensions as u16,
        }
    }
}

impl EmbeddingRepository for FileRepository {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn upsert(&self, record: EmbeddingRecord) -> Result<(), RepositoryError> {
        check_dimensions(self.dimensions, &record)?;

        let mut log = self.log.lock().map_err(|_| RepositoryError::Poisoned)?;
        log.write_all(&encode_entry(&record))?;
        log.flush()?;
        log.get_ref().sync_data()?;

        let mut records = self.records.write().map_err(|_| RepositoryError::Poisoned)?;
        records.insert(record.id, record);
        Ok(())
    }

    fn get_by_id(&self, id: u64) -> Result<Option<EmbeddingRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.get(&id).cloned())
    }

    fn contains(&self, id: u64) -> Result<bool, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.contains_key(&id))
    }

    fn load_all(&self) -> Result<Vec<EmbeddingRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }

    fn len(&self) -> Result<usize, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.len())
    }

    fn clear(&self) -> Result<(), RepositoryError> {
        let mut log = self.log.lock().map_err(|_| RepositoryError::Poisoned)?;
        let mut records = self.records.write().map_err(|_| RepositoryError::Poisoned)?;

        write_atomic(&self.path, &self.header(), std::iter::empty())?;
        *log = open_append(&self.path)?;
        records.clear();
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>, RepositoryError> {
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Write header and entries to a temp file, then rename over `path`.
fn write_atomic<'a>(
    path: &Path,
    header: &Header,
    records: impl Iterator<Item = &'a EmbeddingRecord>,
) -> Result<(), RepositoryError> {
    let temp_path = path.with_extension("tmp");

    let result = (|| -> Result<(), RepositoryError> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        writer.write_all(&header.encode())?;
        for record in records {
            writer.write_all(&encode_entry(record))?;
        }
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        // Clean up temp file on error
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn entry_size(dimensions: usize) -> usize {
    8 + 8 + 4 * dimensions + 4
}

fn encode_entry(record: &EmbeddingRecord) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(entry_size(record.vector.len()));
    bytes.extend_from_slice(&record.id.to_le_bytes());
    bytes.extend_from_slice(&record.captured_at.to_le_bytes());
    for value in &record.vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes
}

/// Decode one entry; `None` if its checksum does not match.
fn decode_entry(bytes: &[u8], dimensions: usize) -> Option<EmbeddingRecord> {
    let body_len = bytes.len() - 4;
    let stored = u32::from_le_bytes(bytes[body_len..].try_into().ok()?);
    if crc32fast::hash(&bytes[..body_len]) != stored {
        return None;
    }

    let id = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let captured_at = i64::from_le_bytes(bytes[8..16].try_into().ok()?);
    let vector = bytes[16..body_len]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();

    if vector.len() != dimensions {
        return None;
    }

    Some(EmbeddingRecord {
        id,
        captured_at,
        vector,
    })
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[0..35]);
        bytes[35..39].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(data: &[u8]) -> Result<Self, RepositoryError> {
        if data.len() < HEADER_SIZE {
            return Err(RepositoryError::InvalidFormat(format!(
                "file is {} bytes, shorter than the header",
                data.len()
            )));
        }

        let version = data[0];

        // Version check first
        if version > FORMAT_VERSION {
            return Err(RepositoryError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes([data[35], data[36], data[37], data[38]]);
        if crc32fast::hash(&data[0..35]) != stored {
            return Err(RepositoryError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&data[1..33]);

        Ok(Self {
            version,
            model_id,
            dimensions: u16::from_le_bytes([data[33], data[34]]),
        })
    }

    fn validate(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), RepositoryError> {
        if self.model_id != *expected_model_id {
            return Err(RepositoryError::ModelMismatch);
        }

        if self.dimensions as usize != expected_dimensions {
            return Err(RepositoryError::DimensionMismatch {
                expected: expected_dimensions,
                got: self.dimensions as usize,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use std::sync::Arc;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn record(id: u64, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id,
            captured_at: 1_700_000_000 + id as i64,
            vector,
        }
    }

    #[test]
    fn test_create_and_reopen_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::create(&path, test_model_id(), 3).unwrap();
        assert_eq!(repo.len().unwrap(), 0);
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        assert_eq!(repo.len().unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        repo.upsert(record(2, vec![0.0, 1.0, 0.0])).unwrap();
        repo.upsert(record(1, vec![1.0, 0.0, 0.0])).unwrap();
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], record(1, vec![1.0, 0.0, 0.0]));
        assert_eq!(all[1].id, 2);
        assert_eq!(all[1].captured_at, 1_700_000_002);
        assert!(repo.contains(2).unwrap());
        assert!(!repo.contains(3).unwrap());
    }

    #[test]
    fn test_upsert_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        repo.upsert(record(5, vec![1.0, 0.0])).unwrap();
        repo.upsert(EmbeddingRecord {
            id: 5,
            captured_at: 42,
            vector: vec![0.0, 1.0],
        })
        .unwrap();
        assert_eq!(repo.len().unwrap(), 1);
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        let rec = repo.get_by_id(5).unwrap().unwrap();
        assert_eq!(rec.captured_at, 42);
        assert_eq!(rec.vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_compact_keeps_latest_entry_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        for i in 0..5 {
            repo.upsert(record(1, vec![i as f32, 1.0])).unwrap();
        }
        repo.upsert(record(2, vec![1.0, 0.0])).unwrap();
        repo.compact().unwrap();

        let expected = HEADER_SIZE + 2 * entry_size(2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected as u64);

        // appends still land after compaction
        repo.upsert(record(3, vec![0.0, 1.0])).unwrap();
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        assert_eq!(repo.len().unwrap(), 3);
        assert_eq!(repo.get_by_id(1).unwrap().unwrap().vector, vec![4.0, 1.0]);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        repo.upsert(record(1, vec![1.0, 0.0, 0.0])).unwrap();
        drop(repo);

        // half of a second entry, as if the process died mid-write
        let partial = encode_entry(&record(2, vec![0.0, 1.0, 0.0]));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        assert_eq!(repo.len().unwrap(), 1);
        assert!(repo.get_by_id(2).unwrap().is_none());

        repo.upsert(record(3, vec![0.0, 0.0, 1.0])).unwrap();
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        let ids: Vec<u64> = repo.load_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_corrupt_entry_is_skipped_and_later_entries_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        repo.upsert(record(1, vec![1.0, 0.0])).unwrap();
        repo.upsert(record(2, vec![0.0, 1.0])).unwrap();
        repo.upsert(record(3, vec![0.6, 0.8])).unwrap();
        drop(repo);
        let len_before = std::fs::metadata(&path).unwrap().len();

        // flip a byte inside the second entry's vector
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        let offset = HEADER_SIZE + entry_size(2) + 17;
        file.seek(SeekFrom::Start(offset as u64)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        let ids: Vec<u64> = repo.load_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        // appends after a skipped entry still replay
        repo.upsert(record(4, vec![0.0, 1.0])).unwrap();
        drop(repo);
        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        let ids: Vec<u64> = repo.load_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);

        // compaction drops the corrupt entry for good
        repo.compact().unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (HEADER_SIZE + 3 * entry_size(2)) as u64
        );
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        FileRepository::create(&path, test_model_id(), 3).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;

        let result = FileRepository::open(&path, wrong_model_id, 3);
        assert!(matches!(result, Err(RepositoryError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        FileRepository::create(&path, test_model_id(), 3).unwrap();

        let result = FileRepository::open(&path, test_model_id(), 512);
        assert!(matches!(result, Err(RepositoryError::DimensionMismatch { .. })));

        let repo = FileRepository::open(&path, test_model_id(), 3).unwrap();
        let result = repo.upsert(record(1, vec![1.0]));
        assert!(matches!(
            result,
            Err(RepositoryError::DimensionMismatch { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        FileRepository::create(&path, test_model_id(), 3).unwrap();

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let result = FileRepository::open(&path, test_model_id(), 3);
        assert!(matches!(result, Err(RepositoryError::ChecksumMismatch)));
    }

    #[test]
    fn test_clear_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        repo.upsert(record(1, vec![1.0, 0.0])).unwrap();
        repo.clear().unwrap();
        assert_eq!(repo.len().unwrap(), 0);
        repo.upsert(record(2, vec![0.0, 1.0])).unwrap();
        drop(repo);

        let repo = FileRepository::open(&path, test_model_id(), 2).unwrap();
        let ids: Vec<u64> = repo.load_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/vectors.bin");
        let header = Header {
            version: FORMAT_VERSION,
            model_id: test_model_id(),
            dimensions: 3,
        };
        let result = write_atomic(&path, &header, std::iter::empty());

        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_snapshot_is_never_torn_under_concurrent_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let repo = Arc::new(FileRepository::open(&path, test_model_id(), 4).unwrap());

        let writer = {
            let repo = repo.clone();
            std::thread::spawn(move || {
                for i in 0..50u64 {
                    let v = i as f32;
                    repo.upsert(record(i % 5, vec![v, v, v, v])).unwrap();
                }
            })
        };

        for _ in 0..50 {
            for rec in repo.load_all().unwrap() {
                assert!(rec.vector.iter().all(|&x| x == rec.vector[0]));
            }
        }
        writer.join().unwrap();
        assert_eq!(repo.len().unwrap(), 5);
    }

    #[test]
    fn test_memory_repository() {
        let repo = MemoryRepository::new(2);
        repo.upsert(record(9, vec![1.0, 0.0])).unwrap();
        repo.upsert(record(3, vec![0.0, 1.0])).unwrap();
        let ids: Vec<u64> = repo.load_all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 9]);
        assert!(repo.upsert(record(1, vec![1.0])).is_err());
        assert!(repo.contains(9).unwrap());
        assert!(!repo.contains(1).unwrap());
        repo.clear().unwrap();
        assert_eq!(repo.len().unwrap(), 0);
        assert!(!repo.contains(9).unwrap());
    }

    #[test]
    fn test_model_id_hash_consistency() {
        assert_eq!(model_id_hash("clip-vit-b32"), model_id_hash("clip-vit-b32"));
        assert_ne!(model_id_hash("clip-vit-b32"), model_id_hash("clip-vit-l14"));
    }
}
