//! Photo evidence collaborator
//!
//! The engine never keeps photo bytes in its documents, only the reference
//! an uploader hands back.
use super::ledger::{PhotoRefs, PhotoRole};
use super::utils::digest_blob;

pub const PHOTO_SCHEME: &str = "photo://";

pub trait PhotoUploader: Send + Sync {
    /// Store a blob durably and return a reference to it.
    fn upload(&self, role: PhotoRole, blob: &[u8]) -> anyhow::Result<String>;
}

/// A captured photo waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub role: PhotoRole,
    pub blob: Vec<u8>,
}

/// Content-addressed photo storage inside the engine's own database.
#[derive(Clone)]
pub struct SledPhotoStore {
    photos: sled::Tree,
}

impl SledPhotoStore {
    pub fn new(photos: sled::Tree) -> Self {
        Self { photos }
    }
    /// Fetch a blob by the reference `upload` returned.
    pub fn fetch(&self, reference: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(digest) = reference.strip_prefix(PHOTO_SCHEME) else {
            anyhow::bail!("'{reference}' is not a photo reference");
        };
        Ok(self.photos.get(digest.as_bytes())?.map(|raw| raw.to_vec()))
    }
}

impl PhotoUploader for SledPhotoStore {
    fn upload(&self, _role: PhotoRole, blob: &[u8]) -> anyhow::Result<String> {
        if blob.is_empty() {
            anyhow::bail!("refusing to store an empty photo");
        }
        let digest = digest_blob(blob);
        self.photos.insert(digest.as_bytes(), blob)?;
        Ok(format!("{PHOTO_SCHEME}{digest}"))
    }
}

/// Upload every piece of evidence, keyed by role. A later photo for the same
/// role replaces an earlier one.
pub fn upload_all(uploader: &dyn PhotoUploader, evidence: &[Evidence]) -> anyhow::Result<PhotoRefs> {
    let mut refs = PhotoRefs::new();
    for item in evidence {
        let reference = uploader.upload(item.role, &item.blob)?;
        refs.insert(item.role, reference);
    }
    Ok(refs)
}
