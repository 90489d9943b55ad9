use std::path::PathBuf;

use serde::Deserialize;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint (MinIO). Path-style addressing when set.
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    /// Base of the public object locators handed back to clients.
    pub public_base_url: String,
    pub plates_folder: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub analyses_path: PathBuf,
    pub max_image_bytes: usize,
    pub storage: StorageConfig,
    pub vision: VisionConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "healthia".into());
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let endpoint = std::env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty());
        let public_base_url = std::env::var("S3_PUBLIC_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_public_base(endpoint.as_deref(), &bucket, &region));

        let storage = StorageConfig {
            access_key: std::env::var("S3_ACCESS_KEY")?,
            secret_key: std::env::var("S3_SECRET_KEY")?,
            plates_folder: std::env::var("S3_PLATES_FOLDER").unwrap_or_else(|_| "platos_ia".into()),
            bucket,
            region,
            endpoint,
            public_base_url,
        };

        let vision = VisionConfig {
            api_key: std::env::var("VISION_API_KEY")?,
            base_url: std::env::var("VISION_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            timeout_secs: std::env::var("VISION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60),
            max_tokens: std::env::var("VISION_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1000),
        };

        Ok(Self {
            analyses_path: std::env::var("ANALYSES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/analyses.json")),
            max_image_bytes: std::env::var("MAX_IMAGE_BYTES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
            storage,
            vision,
        })
    }
}

fn default_public_base(endpoint: Option<&str>, bucket: &str, region: &str) -> String {
    match endpoint {
        Some(ep) => format!("{}/{}", ep.trim_end_matches('/'), bucket),
        None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
    }
}
