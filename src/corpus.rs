//! Photo corpus backed by a directory tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::semantic::{ByteSource, Corpus, PhotoEntry};

/// A photo file found while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub id: u64,
    pub path: PathBuf,
    pub captured_at: i64,
    pub category: Option<String>,
}

/// Every photo below a root directory, sorted by id.
///
/// Ids are derived from the path relative to the root, so they stay stable as
/// long as files are not moved.
#[derive(Debug, Clone)]
pub struct DirectoryCorpus {
    photos: Vec<PhotoFile>,
}

struct FileSource(PathBuf);

impl ByteSource for FileSource {
    fn open(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.0)
    }
}

/// Stable id of a photo from its path relative to the corpus root.
pub fn photo_id(relative: &Path) -> u64 {
    let normalized = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let digest = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl DirectoryCorpus {
    /// Walk `root` and collect files whose extension is in `extensions`.
    pub fn scan(root: &Path, extensions: &[String]) -> std::io::Result<Self> {
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }

        let extensions: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
        let mut photos = Vec::new();

        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let matches = path
                .extension()
                .map(|ext| extensions.contains(&ext.to_string_lossy().to_lowercase()))
                .unwrap_or(false);
            if !matches {
                continue;
            }

            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };

            let captured_at = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).timestamp())
                .unwrap_or_default();

            let category = relative
                .parent()
                .and_then(|p| p.file_name())
                .map(|name| name.to_string_lossy().to_string());

            photos.push(PhotoFile {
                id: photo_id(relative),
                path: path.to_path_buf(),
                captured_at,
                category,
            });
        }

        photos.sort_by_key(|p| p.id);
        log::debug!("found {} photos under {}", photos.len(), root.display());

        Ok(Self { photos })
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&PhotoFile> {
        self.photos
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|idx| &self.photos[idx])
    }

    pub fn path_of(&self, id: u64) -> Option<&Path> {
        self.get(id).map(|p| p.path.as_path())
    }
}

impl Corpus for DirectoryCorpus {
    fn entries(&self) -> std::io::Result<Vec<PhotoEntry>> {
        Ok(self
            .photos
            .iter()
            .map(|photo| PhotoEntry {
                id: photo.id,
                captured_at: photo.captured_at,
                category: photo.category.clone(),
                source: Box::new(FileSource(photo.path.clone())),
            })
            .collect())
    }
}
