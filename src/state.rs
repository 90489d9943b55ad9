use std::sync::Arc;

use crate::analysis::repo::AnalysisStore;
use crate::config::AppConfig;
use crate::images::services::AssetManager;
use crate::storage::{Storage, StorageClient};
use crate::vision::{OpenAiVisionClient, VisionClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub assets: Arc<AssetManager>,
    pub vision: Arc<dyn VisionClient>,
    pub store: Arc<AnalysisStore>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        // Real S3 or any S3-compatible endpoint
        let storage = Arc::new(Storage::new(&config.storage).await?) as Arc<dyn StorageClient>;
        let vision = Arc::new(OpenAiVisionClient::new(config.vision.clone())?) as Arc<dyn VisionClient>;
        let store = AnalysisStore::open(&config.analyses_path).await?;

        let report = store.integrity_check().await?;
        if !report.is_clean() {
            tracing::warn!(?report, "analysis document has integrity issues");
        }

        Ok(Self::from_parts(config, storage, vision, store))
    }

    pub fn from_parts(
        config: AppConfig,
        storage: Arc<dyn StorageClient>,
        vision: Arc<dyn VisionClient>,
        store: AnalysisStore,
    ) -> Self {
        let assets = AssetManager::new(storage, &config.storage.public_base_url);
        Self {
            config: Arc::new(config),
            assets: Arc::new(assets),
            vision,
            store: Arc::new(store),
        }
    }

    /// State backed by an in-memory bucket and a document under `dir`.
    #[cfg(test)]
    pub async fn for_tests(
        dir: &std::path::Path,
        storage: Arc<dyn StorageClient>,
        vision: Arc<dyn VisionClient>,
    ) -> Self {
        use crate::config::{StorageConfig, VisionConfig, DEFAULT_MAX_IMAGE_BYTES};

        let config = AppConfig {
            analyses_path: dir.join("analyses.json"),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            storage: StorageConfig {
                bucket: "healthia".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: "test".into(),
                secret_key: "test".into(),
                public_base_url: "https://healthia.s3.us-east-1.amazonaws.com".into(),
                plates_folder: "platos_ia".into(),
            },
            vision: VisionConfig {
                base_url: "http://vision.test/v1".into(),
                api_key: "test".into(),
                model: "test-model".into(),
                timeout_secs: 1,
                max_tokens: 100,
            },
        };
        let store = AnalysisStore::open(&config.analyses_path)
            .await
            .expect("open test store");
        Self::from_parts(config, storage, vision, store)
    }
}
