use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::storage::StorageClient;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
const MAX_FILENAME_LENGTH: usize = 100;
const KEY_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NothingToDelete,
}

/// Puts plate images into object storage and takes them out again.
pub struct AssetManager {
    storage: Arc<dyn StorageClient>,
    public_base_url: String,
}

impl AssetManager {
    pub fn new(storage: Arc<dyn StorageClient>, public_base_url: &str) -> Self {
        Self {
            storage,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Inverse of [`Self::url_for`]; `None` for locators outside our bucket.
    pub fn key_for<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|key| !key.is_empty())
    }

    /// Uploads under a fresh key and confirms the object is visible before
    /// handing back its locator.
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn upload(
        &self,
        body: Bytes,
        extension: &str,
        analysis_id: Option<u64>,
        original_filename: Option<&str>,
        folder: &str,
    ) -> anyhow::Result<UploadedAsset> {
        anyhow::ensure!(!body.is_empty(), "refusing to upload an empty file");

        // The client's name wins when it carries an allowed extension.
        let ext = original_filename
            .and_then(allowed_extension)
            .or_else(|| allowed_extension(&format!(".{}", extension)))
            .unwrap_or("jpg");
        let filename = original_filename
            .map(str::to_string)
            .unwrap_or_else(|| format!("image.{}", ext));
        let key = storage_key(folder, analysis_id, &filename, ext, OffsetDateTime::now_utc())?;

        self.storage
            .put_object(&key, body, mime_from_ext(ext))
            .await
            .with_context(|| format!("put_object {}", key))?;

        let visible = self
            .storage
            .head_object(&key)
            .await
            .with_context(|| format!("verify upload {}", key))?;
        anyhow::ensure!(visible, "upload of {} could not be verified", key);

        let url = self.url_for(&key);
        info!(%key, %url, "asset uploaded");
        Ok(UploadedAsset { key, url })
    }

    /// Removes one object. Deleting something that is already gone succeeds.
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str) -> anyhow::Result<DeleteOutcome> {
        let key = self
            .key_for(url)
            .with_context(|| format!("{} is not a locator of this bucket", url))?;

        if !self.storage.head_object(key).await? {
            info!(%key, "nothing to delete");
            return Ok(DeleteOutcome::NothingToDelete);
        }

        self.storage
            .delete_object(key)
            .await
            .with_context(|| format!("delete_object {}", key))?;

        anyhow::ensure!(
            !self.storage.head_object(key).await?,
            "{} still exists after delete",
            key
        );
        info!(%key, "asset deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Removes every object below `prefix`, returning how many went away.
    #[instrument(skip(self))]
    pub async fn delete_folder(&self, prefix: &str) -> anyhow::Result<usize> {
        // "platos_ia/1" must not sweep "platos_ia/12/..."
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let keys = self
            .storage
            .list_keys(&prefix)
            .await
            .with_context(|| format!("list {}", prefix))?;

        if keys.is_empty() {
            info!(%prefix, "nothing to delete");
            return Ok(0);
        }

        for key in &keys {
            self.storage
                .delete_object(key)
                .await
                .with_context(|| format!("delete_object {}", key))?;
        }
        info!(%prefix, count = keys.len(), "folder deleted");
        Ok(keys.len())
    }

    /// Best-effort removal used when a later stage failed. Never errors.
    pub async fn rollback(&self, urls: &[String]) {
        for url in urls {
            match self.delete(url).await {
                Ok(outcome) => info!(%url, ?outcome, "rolled back asset"),
                Err(e) => warn!(%url, error = %e, "rollback of asset failed"),
            }
        }
    }
}

/// `<folder>/[<analysis_id>/]<timestamp>_<shortId>_<sanitizedFilename>`
fn storage_key(
    folder: &str,
    analysis_id: Option<u64>,
    filename: &str,
    ext: &str,
    now: OffsetDateTime,
) -> anyhow::Result<String> {
    let timestamp = now.format(KEY_TIMESTAMP).context("format key timestamp")?;
    let short_id = &Uuid::new_v4().simple().to_string()[..8];
    let mut safe = sanitize_filename(filename);
    if safe.is_empty() || safe.starts_with('.') {
        safe = format!("image.{}", ext);
    }
    Ok(match analysis_id {
        Some(id) => format!("{}/{}/{}_{}_{}", folder, id, timestamp, short_id, safe),
        None => format!("{}/{}_{}_{}", folder, timestamp, short_id, safe),
    })
}

pub fn sanitize_filename(name: &str) -> String {
    lazy_static! {
        static ref UNSAFE: Regex = Regex::new(r"[^a-zA-Z0-9._-]").unwrap();
    }
    let cleaned = UNSAFE.replace_all(name, "").to_lowercase();
    if cleaned.len() <= MAX_FILENAME_LENGTH {
        return cleaned;
    }
    match cleaned.rfind('.') {
        Some(dot) if dot > 0 && cleaned.len() - dot < MAX_FILENAME_LENGTH => {
            let ext = &cleaned[dot..];
            format!("{}{}", &cleaned[..MAX_FILENAME_LENGTH - ext.len()], ext)
        }
        _ => cleaned[..MAX_FILENAME_LENGTH].to_string(),
    }
}

/// Extension of `filename` if it is an allowed image type.
pub fn allowed_extension(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1.to_lowercase();
    ALLOWED_EXTENSIONS
        .iter()
        .find(|allowed| **allowed == ext)
        .copied()
}

pub fn mime_from_ext(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod image_tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    const BASE: &str = "https://healthia.s3.us-east-1.amazonaws.com";

    fn manager() -> (Arc<MemoryStorage>, AssetManager) {
        let storage = Arc::new(MemoryStorage::default());
        let assets = AssetManager::new(storage.clone(), BASE);
        (storage, assets)
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Plate (1).JPG"), "myplate1.jpg");
        assert_eq!(sanitize_filename("ñandú_día.png"), "and_da.png");
        let long = format!("{}.jpeg", "a".repeat(150));
        let out = sanitize_filename(&long);
        assert_eq!(out.len(), MAX_FILENAME_LENGTH);
        assert!(out.ends_with(".jpeg"));
    }

    #[test]
    fn test_allowed_extension() {
        assert_eq!(allowed_extension("plate.PNG"), Some("png"));
        assert_eq!(allowed_extension("plate.gif"), Some("gif"));
        assert_eq!(allowed_extension(".jpeg"), Some("jpeg"));
        assert_eq!(allowed_extension("plate.webp"), None);
        assert_eq!(allowed_extension("no_extension"), None);
        assert_eq!(mime_from_ext("jpeg"), "image/jpeg");
        assert_eq!(mime_from_ext("png"), "image/png");
    }

    #[test]
    fn test_storage_key_layout() {
        let now = time::macros::datetime!(2024-03-05 14:07:09 UTC);
        let key = storage_key("platos_ia", Some(7), "Lunch.jpg", "jpg", now).unwrap();
        let re = Regex::new(r"^platos_ia/7/20240305_140709_[0-9a-f]{8}_lunch\.jpg$").unwrap();
        assert!(re.is_match(&key), "{}", key);

        let key = storage_key("platos_ia", None, "x.png", "png", now).unwrap();
        assert!(key.starts_with("platos_ia/20240305_140709_"));
    }

    #[test]
    fn test_storage_keys_do_not_collide() {
        let now = OffsetDateTime::now_utc();
        let a = storage_key("f", Some(1), "a.jpg", "jpg", now).unwrap();
        let b = storage_key("f", Some(1), "a.jpg", "jpg", now).unwrap();
        assert_ne!(a, b);

        let key = storage_key("f", None, "¿¿¿", "gif", now).unwrap();
        assert!(key.ends_with("_image.gif"), "{}", key);
    }

    #[test]
    fn test_url_key_mapping() {
        let (_, assets) = manager();
        let url = assets.url_for("platos_ia/1/x.jpg");
        assert_eq!(url, format!("{}/platos_ia/1/x.jpg", BASE));
        assert_eq!(assets.key_for(&url), Some("platos_ia/1/x.jpg"));
        assert_eq!(assets.key_for("https://elsewhere.example/x.jpg"), None);
        assert_eq!(assets.key_for(BASE), None);
    }

    #[tokio::test]
    async fn test_upload_and_delete() {
        let (storage, assets) = manager();
        let up = assets
            .upload(Bytes::from_static(b"img"), "png", Some(3), Some("Dinner.png"), "platos_ia")
            .await
            .unwrap();
        assert!(up.key.starts_with("platos_ia/3/"));
        assert_eq!(storage.content_type(&up.key).as_deref(), Some("image/png"));

        assert_eq!(assets.delete(&up.url).await.unwrap(), DeleteOutcome::Deleted);
        assert!(storage.keys().is_empty());
        assert_eq!(
            assets.delete(&up.url).await.unwrap(),
            DeleteOutcome::NothingToDelete
        );
    }

    #[tokio::test]
    async fn test_upload_extension_falls_back_to_detected() {
        let (storage, assets) = manager();
        let up = assets
            .upload(Bytes::from_static(b"img"), "png", Some(2), Some("shot.webp"), "platos_ia")
            .await
            .unwrap();
        assert_eq!(storage.content_type(&up.key).as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_upload_defaults_filename() {
        let (_, assets) = manager();
        let up = assets
            .upload(Bytes::from_static(b"img"), "gif", None, None, "platos_ia")
            .await
            .unwrap();
        assert!(up.key.ends_with("_image.gif"), "{}", up.key);
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_and_unverified() {
        let (storage, assets) = manager();
        assert!(assets
            .upload(Bytes::new(), "jpg", None, None, "f")
            .await
            .is_err());

        storage.drop_writes();
        let err = assets
            .upload(Bytes::from_static(b"img"), "jpg", Some(1), None, "f")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not be verified"));
    }

    #[tokio::test]
    async fn test_delete_folder() {
        let (storage, assets) = manager();
        for id in [1, 1, 12] {
            assets
                .upload(Bytes::from_static(b"img"), "jpg", Some(id), None, "platos_ia")
                .await
                .unwrap();
        }
        assert_eq!(assets.delete_folder("platos_ia/1").await.unwrap(), 2);
        assert_eq!(storage.keys().len(), 1);
        assert!(storage.keys()[0].starts_with("platos_ia/12/"));
        assert_eq!(assets.delete_folder("platos_ia/1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_swallows_failures() {
        let (storage, assets) = manager();
        let up = assets
            .upload(Bytes::from_static(b"img"), "jpg", Some(1), None, "f")
            .await
            .unwrap();
        storage.fail_deletes();
        assets
            .rollback(&[up.url.clone(), "not-a-locator".to_string()])
            .await;
        assert_eq!(storage.keys(), vec![up.key]);
    }
}
