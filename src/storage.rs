//! Artifact storage
//!
//! [`ObjectStore`] is the external blob store. [`ResultStore`] decides where
//! each artifact of a finished attempt goes: screenshots and HTML always to
//! the object store, text inline on the job record when it is small enough.

use crate::{
    ArtifactKind, ExtractionToggles, JobId, OutputFormat, PageArtifacts, ScrapeError,
    StoredArtifacts,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ScrapeError>;

    /// `NotFound` when the key was never written or was deleted.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ScrapeError>;

    async fn delete(&self, key: &str) -> Result<(), ScrapeError>;

    async fn exists(&self, key: &str) -> Result<bool, ScrapeError>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Object store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .get(key)
            .map(|object| object.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ScrapeError> {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ScrapeError> {
        self.objects
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| ScrapeError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ScrapeError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ScrapeError> {
        Ok(self.objects.contains_key(key))
    }
}

/// Object store laid out as files under a root directory
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys are relative paths; anything escaping the root is refused.
    fn path_for(&self, key: &str) -> Result<PathBuf, ScrapeError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(ScrapeError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), ScrapeError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScrapeError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ScrapeError::Storage(format!("write {}: {e}", path.display())))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ScrapeError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScrapeError::NotFound(key.to_string()))
            }
            Err(e) => Err(ScrapeError::Storage(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ScrapeError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScrapeError::Storage(format!(
                "delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ScrapeError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ScrapeError::Storage(format!("stat {}: {e}", path.display())))
    }
}

/// Tiering of attempt results between the job record and the object store
pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
    inline_text_limit: usize,
    screenshot_format: OutputFormat,
}

impl ResultStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        inline_text_limit: usize,
        screenshot_format: OutputFormat,
    ) -> Self {
        Self {
            store,
            inline_text_limit,
            screenshot_format,
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn screenshot_format(&self) -> OutputFormat {
        self.screenshot_format
    }

    pub fn artifact_key(&self, job_id: JobId, kind: ArtifactKind) -> String {
        match kind {
            ArtifactKind::Screenshot => {
                format!("{job_id}/screenshot.{}", self.screenshot_format.extension())
            }
            ArtifactKind::Html => format!("{job_id}/page.html"),
            ArtifactKind::Text => format!("{job_id}/text.txt"),
        }
    }

    pub fn content_type(&self, kind: ArtifactKind) -> &'static str {
        match kind {
            ArtifactKind::Screenshot => self.screenshot_format.content_type(),
            ArtifactKind::Html => "text/html",
            ArtifactKind::Text => "text/plain",
        }
    }

    /// Content type of a stored object, taken from its key for screenshots
    /// since the configured format may have changed since it was written.
    pub fn content_type_for_key(&self, kind: ArtifactKind, key: &str) -> &'static str {
        match kind {
            ArtifactKind::Screenshot => {
                match Path::new(key).extension().and_then(|ext| ext.to_str()) {
                    Some("jpg") | Some("jpeg") => OutputFormat::Jpeg.content_type(),
                    Some("webp") => OutputFormat::Webp.content_type(),
                    _ => OutputFormat::Png.content_type(),
                }
            }
            _ => self.content_type(kind),
        }
    }

    /// Whether text of this size stays on the job record.
    pub fn fits_inline(&self, text: &str) -> bool {
        text.len() < self.inline_text_limit
    }

    /// Stores what the attempt produced and returns the references to record.
    ///
    /// A requested text artifact is always placed somewhere, empty if the page
    /// had none. When a write fails, objects already written by this call are
    /// removed on a best-effort basis and the failure is returned as a
    /// storage error.
    pub async fn persist(
        &self,
        job_id: JobId,
        artifacts: &PageArtifacts,
        toggles: ExtractionToggles,
    ) -> Result<StoredArtifacts, ScrapeError> {
        let mut written = Vec::new();
        match self
            .write_all(job_id, artifacts, toggles, &mut written)
            .await
        {
            Ok(stored) => Ok(stored),
            Err(e) => {
                self.rollback(&written).await;
                Err(as_storage_error(e))
            }
        }
    }

    async fn write_all(
        &self,
        job_id: JobId,
        artifacts: &PageArtifacts,
        toggles: ExtractionToggles,
        written: &mut Vec<String>,
    ) -> Result<StoredArtifacts, ScrapeError> {
        let mut stored = StoredArtifacts::default();

        if toggles.screenshot {
            if let Some(png) = &artifacts.screenshot {
                let bytes = convert_image_format(png.clone(), self.screenshot_format)?;
                stored.screenshot_path = Some(
                    self.write(job_id, ArtifactKind::Screenshot, bytes, written)
                        .await?,
                );
            }
        }

        if toggles.html {
            if let Some(html) = &artifacts.html {
                stored.html_path = Some(
                    self.write(
                        job_id,
                        ArtifactKind::Html,
                        html.clone().into_bytes(),
                        written,
                    )
                    .await?,
                );
            }
        }

        if toggles.text {
            let text = artifacts.text.clone().unwrap_or_default();
            if self.fits_inline(&text) {
                stored.text_content = Some(text);
            } else {
                debug!(
                    "Text for job {} is {} bytes, storing externally",
                    job_id,
                    text.len()
                );
                stored.text_path = Some(
                    self.write(job_id, ArtifactKind::Text, text.into_bytes(), written)
                        .await?,
                );
            }
        }

        Ok(stored)
    }

    async fn write(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
        bytes: Vec<u8>,
        written: &mut Vec<String>,
    ) -> Result<String, ScrapeError> {
        let key = self.artifact_key(job_id, kind);
        let size = bytes.len();
        self.store.put(&key, bytes, self.content_type(kind)).await?;
        debug!("Stored {} ({} bytes)", key, size);
        written.push(key.clone());
        Ok(key)
    }

    async fn rollback(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.store.delete(key).await {
                warn!("Failed to remove partial artifact {}: {}", key, e);
            }
        }
    }

    pub async fn fetch(&self, key: &str) -> Result<Vec<u8>, ScrapeError> {
        self.store.get(key).await
    }

    /// Deletes every object a job could have produced.
    pub async fn purge(&self, job_id: JobId) -> Result<(), ScrapeError> {
        for kind in [
            ArtifactKind::Screenshot,
            ArtifactKind::Html,
            ArtifactKind::Text,
        ] {
            self.store.delete(&self.artifact_key(job_id, kind)).await?;
        }
        Ok(())
    }
}

/// Re-encodes a PNG capture into the configured format.
pub fn convert_image_format(
    png_data: Vec<u8>,
    format: OutputFormat,
) -> Result<Vec<u8>, ScrapeError> {
    let target = match format {
        OutputFormat::Png => return Ok(png_data),
        OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        OutputFormat::Webp => image::ImageFormat::WebP,
    };

    let img = image::load_from_memory(&png_data)
        .map_err(|e| ScrapeError::Storage(format!("decode screenshot: {e}")))?;
    // JPEG has no alpha channel
    let img = image::DynamicImage::ImageRgb8(img.to_rgb8());

    let mut encoded = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut encoded), target)
        .map_err(|e| ScrapeError::Storage(format!("encode screenshot: {e}")))?;
    Ok(encoded)
}

fn as_storage_error(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::Storage(_) => err,
        other => ScrapeError::Storage(other.to_string()),
    }
}
