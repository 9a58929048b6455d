//! Single-slot cache for the most recently uploaded image.
//!
//! Uploads are written to a uniquely named temp file inside a private scratch
//! directory and renamed into place before the slot pointer is swapped, so a
//! reader never sees a partial object. The slot always holds the upload that
//! started last; the file it replaces is deleted once nobody can pick it up
//! any more. The scratch directory is removed when the cache is dropped.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recognized image extensions and the MIME type served for each
const ALLOWED_EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
];

/// Errors from the image slot cache
#[derive(Debug, Error)]
pub enum ImageCacheError {
    #[error("filename is empty")]
    EmptyFilename,

    #[error("unsupported image extension: {0:?}")]
    UnsupportedExtension(String),

    #[error("image content is empty")]
    EmptyContent,

    #[error("scratch storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to publish image: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl ImageCacheError {
    /// Whether the error was caused by the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyFilename | Self::UnsupportedExtension(_) | Self::EmptyContent
        )
    }
}

/// Metadata of a published image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMeta {
    pub filename: String,
    pub mime_type: &'static str,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Image bytes read back from the slot
#[derive(Debug, Clone)]
pub struct LatestImage {
    pub content: Vec<u8>,
    pub meta: ImageMeta,
}

struct SlotEntry {
    /// Order in which uploads started; higher wins the slot
    sequence: u64,
    path: PathBuf,
    meta: ImageMeta,
}

/// Holds at most one servable image, backed by a private temp directory
pub struct ImageSlotCache {
    scratch: TempDir,
    slot: RwLock<Option<Arc<SlotEntry>>>,
    sequence: AtomicU64,
}

impl ImageSlotCache {
    /// Create a fresh scratch area under `root`, or the system temp dir
    pub fn new(root: Option<&Path>) -> Result<Self, ImageCacheError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tally-images-");
        let scratch = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        info!(scratch = %scratch.path().display(), "Image scratch area created");

        Ok(Self {
            scratch,
            slot: RwLock::new(None),
            sequence: AtomicU64::new(0),
        })
    }

    /// Directory holding published images
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// Validate and publish an upload as the latest image.
    ///
    /// `declared_mime` is what the client sent; the served type is always
    /// derived from the extension.
    pub fn put(
        &self,
        filename: &str,
        content: &[u8],
        declared_mime: Option<&str>,
    ) -> Result<ImageMeta, ImageCacheError> {
        let (display_name, extension, mime_type) = validate_filename(filename)?;
        if content.is_empty() {
            return Err(ImageCacheError::EmptyContent);
        }
        if let Some(declared) = declared_mime {
            if !declared.eq_ignore_ascii_case(mime_type) {
                debug!(declared = %declared, inferred = %mime_type, "Declared MIME type differs from extension");
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let object_name = format!("{:020}-{}.{}", sequence, Uuid::new_v4().simple(), extension);
        let path = self.scratch.path().join(object_name);

        let mut tmp = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(self.scratch.path())?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        let entry = Arc::new(SlotEntry {
            sequence,
            path,
            meta: ImageMeta {
                filename: display_name,
                mime_type,
                size_bytes: content.len() as u64,
                uploaded_at: Utc::now(),
            },
        });

        let superseded = {
            let mut slot = self.slot.write();
            // A later upload may already hold the slot
            let lost = slot
                .as_ref()
                .is_some_and(|current| current.sequence > sequence);
            if lost {
                Some(entry.clone())
            } else {
                slot.replace(entry.clone())
            }
        };

        if let Some(old) = superseded {
            remove_object(&old.path);
        }

        metrics::counter!("tally.images.uploaded").increment(1);
        info!(
            filename = %entry.meta.filename,
            mime_type = %entry.meta.mime_type,
            size_bytes = entry.meta.size_bytes,
            "Image published"
        );

        Ok(entry.meta.clone())
    }

    /// Bytes and metadata of the latest image, if any upload happened
    pub fn latest(&self) -> Result<Option<LatestImage>, ImageCacheError> {
        // Open under the read lock: a superseding upload deletes the old
        // file only after taking the write lock.
        let (mut file, meta) = {
            let slot = self.slot.read();
            let Some(entry) = slot.as_ref() else {
                return Ok(None);
            };
            (File::open(&entry.path)?, entry.meta.clone())
        };

        let mut content = Vec::with_capacity(meta.size_bytes as usize);
        file.read_to_end(&mut content)?;

        Ok(Some(LatestImage { content, meta }))
    }

    /// Metadata of the latest image without reading its content
    pub fn latest_meta(&self) -> Option<ImageMeta> {
        self.slot.read().as_ref().map(|entry| entry.meta.clone())
    }
}

fn remove_object(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Superseded image removed"),
        // Left for scratch teardown
        Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove superseded image"),
    }
}

/// Check the upload name and return (display name, extension, MIME type)
fn validate_filename(filename: &str) -> Result<(String, &'static str, &'static str), ImageCacheError> {
    // Only the final component matters; object names are generated
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() {
        return Err(ImageCacheError::EmptyFilename);
    }

    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    ALLOWED_EXTENSIONS
        .iter()
        .find(|(allowed, _)| *allowed == extension)
        .map(|(allowed, mime)| (name.to_string(), *allowed, *mime))
        .ok_or(ImageCacheError::UnsupportedExtension(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ImageSlotCache {
        ImageSlotCache::new(None).unwrap()
    }

    fn stored_objects(cache: &ImageSlotCache) -> Vec<PathBuf> {
        std::fs::read_dir(cache.scratch_path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[test]
    fn test_empty_cache_has_no_latest() {
        let cache = cache();
        assert!(cache.latest().unwrap().is_none());
        assert!(cache.latest_meta().is_none());
    }

    #[test]
    fn test_latest_follows_most_recent_upload() {
        let cache = cache();
        cache.put("a.jpg", b"jpeg-bytes", Some("image/jpeg")).unwrap();
        cache.put("b.png", b"png-bytes", Some("image/png")).unwrap();

        let latest = cache.latest().unwrap().unwrap();
        assert_eq!(latest.content, b"png-bytes");
        assert_eq!(latest.meta.mime_type, "image/png");
        assert_eq!(latest.meta.filename, "b.png");
        assert_eq!(latest.meta.size_bytes, 9);
    }

    #[test]
    fn test_rejected_upload_keeps_latest() {
        let cache = cache();
        cache.put("a.jpg", b"jpeg-bytes", None).unwrap();

        let err = cache.put("virus.exe", b"MZ", None).unwrap_err();
        assert!(matches!(err, ImageCacheError::UnsupportedExtension(ref ext) if ext == "exe"));
        assert!(err.is_validation());

        let latest = cache.latest().unwrap().unwrap();
        assert_eq!(latest.content, b"jpeg-bytes");
        assert_eq!(latest.meta.mime_type, "image/jpeg");
    }

    #[test]
    fn test_filename_validation() {
        let cache = cache();
        assert!(matches!(cache.put("", b"x", None), Err(ImageCacheError::EmptyFilename)));
        assert!(matches!(cache.put("  ", b"x", None), Err(ImageCacheError::EmptyFilename)));
        assert!(matches!(cache.put("photos/", b"x", None), Err(ImageCacheError::EmptyFilename)));
        assert!(matches!(
            cache.put("noextension", b"x", None),
            Err(ImageCacheError::UnsupportedExtension(_))
        ));
        assert!(matches!(cache.put("a.png", b"", None), Err(ImageCacheError::EmptyContent)));
        assert!(cache.latest_meta().is_none());
    }

    #[test]
    fn test_extension_is_case_insensitive_and_path_is_stripped() {
        let cache = cache();
        let meta = cache.put("../../etc/Photo.JPEG", b"bytes", None).unwrap();

        assert_eq!(meta.filename, "Photo.JPEG");
        assert_eq!(meta.mime_type, "image/jpeg");
        assert_eq!(cache.put("scan.TIF", b"bytes", None).unwrap().mime_type, "image/tiff");
        assert!(matches!(
            cache.put("doc.pdf", b"bytes", None),
            Err(ImageCacheError::UnsupportedExtension(ref ext)) if ext == "pdf"
        ));
    }

    #[test]
    fn test_superseded_uploads_are_deleted() {
        let cache = cache();
        for i in 0..5 {
            cache.put(&format!("frame-{i}.jpg"), b"bytes", None).unwrap();
        }

        assert_eq!(stored_objects(&cache).len(), 1);
        assert_eq!(cache.latest_meta().unwrap().filename, "frame-4.jpg");
    }

    #[test]
    fn test_same_filename_uploads_do_not_collide() {
        let cache = cache();
        cache.put("same.png", b"first", None).unwrap();
        cache.put("same.png", b"second", None).unwrap();

        assert_eq!(cache.latest().unwrap().unwrap().content, b"second");
    }

    #[test]
    fn test_scratch_area_removed_on_drop() {
        let cache = cache();
        cache.put("a.jpg", b"bytes", None).unwrap();
        let path = cache.scratch_path().to_path_buf();
        assert!(path.exists());

        drop(cache);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_root_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("nested").join("images");
        let cache = ImageSlotCache::new(Some(&nested)).unwrap();

        assert!(cache.scratch_path().starts_with(&nested));
    }

    #[test]
    fn test_concurrent_puts_and_reads_never_see_partial_objects() {
        let cache = Arc::new(cache());
        cache.put("seed.png", &[7u8; 4096], None).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let byte = (w * 25 + i) as u8;
                        cache.put("frame.png", &vec![byte; 4096], None).unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let latest = cache.latest().unwrap().unwrap();
                        assert_eq!(latest.content.len(), 4096);
                        let first = latest.content[0];
                        assert!(latest.content.iter().all(|b| *b == first));
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }

        assert_eq!(stored_objects(&cache).len(), 1);
    }
}
