//! Image records.
//!
//! Images are looked up by any of their identifiers (ID or a substring of it,
//! name, tag, digest or the reference as originally requested), not by one key.

use std::path::{Path, PathBuf};

use multicri_core::api::{Image, ImageFilter};
use multicri_core::error::{CriError, Result};
use multicri_core::ImageMetadata;

use super::{Collection, Persist};

/// Directory under the resources cache where pulled images land.
pub const IMAGES_DIR: &str = ".images";

/// Store for image records.
pub struct ImageStore {
    images: Collection<ImageMetadata>,
    base_path: PathBuf,
}

fn image_file_exists(image: &ImageMetadata) -> bool {
    !image.local_path.is_empty() && Path::new(&image.local_path).exists()
}

impl ImageStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            images: Collection::in_memory(),
            base_path: base_path.into(),
        }
    }

    /// Load persisted images, dropping those whose file is gone.
    pub fn load(
        base_path: impl Into<PathBuf>,
        persist: Box<dyn Persist<ImageMetadata>>,
    ) -> Result<Self> {
        Ok(Self {
            images: Collection::load(persist, image_file_exists)?,
            base_path: base_path.into(),
        })
    }

    /// Where freshly pulled images are placed before the adapter moves them.
    pub fn images_dir(&self) -> PathBuf {
        self.base_path.join(IMAGES_DIR)
    }

    /// New, unresolved record for a pull of `reference`.
    pub fn create_metadata(
        &self,
        reference: &str,
        auth: Option<&multicri_core::api::AuthConfig>,
    ) -> ImageMetadata {
        ImageMetadata::new(
            uuid::Uuid::new_v4().simple().to_string(),
            reference.to_string(),
            self.images_dir().to_string_lossy().into_owned(),
            auth.map(Into::into).unwrap_or_default(),
        )
    }

    pub fn add(&self, image: ImageMetadata) {
        self.images.add(image);
    }

    pub fn update(&self, image: ImageMetadata) {
        self.images.update(image);
    }

    pub fn remove(&self, id: &str) -> Option<ImageMetadata> {
        self.images.remove(id)
    }

    /// Find an image by any of its identifiers.
    pub fn get(&self, query: &str) -> Result<ImageMetadata> {
        self.images
            .find(|image| image.matches(query))
            .ok_or_else(|| CriError::image_not_found(query))
    }

    /// All records, without touching the filesystem.
    pub fn all(&self) -> Vec<ImageMetadata> {
        self.images.list(|_| true)
    }

    /// Images matching a CRI filter. Records whose file has disappeared are
    /// removed instead of listed.
    pub fn list(&self, filter: Option<&ImageFilter>) -> Vec<ImageMetadata> {
        let query = filter
            .and_then(|f| f.image.as_ref())
            .map(|spec| spec.image.as_str())
            .unwrap_or("");
        self.images.list_pruning(
            |image| {
                query.is_empty()
                    || image.remote_path == query
                    || image.repo_digests.iter().any(|d| d == query)
                    || image.reference == query
            },
            image_file_exists,
        )
    }

    pub fn list_k8s(&self, filter: Option<&ImageFilter>) -> Vec<Image> {
        self.list(filter).iter().map(ImageMetadata::to_image).collect()
    }
}
