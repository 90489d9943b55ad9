use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use super::{build_instruction, VisionClient};
use crate::analysis::model::ImageDimensions;
use crate::config::VisionConfig;
use crate::errors::AnalysisError;

const SERVICE: &str = "vision model";
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible vision endpoints.
pub struct OpenAiVisionClient {
    client: Client,
    config: VisionConfig,
}

impl OpenAiVisionClient {
    pub fn new(config: VisionConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        info!(base_url = %config.base_url, model = %config.model, "vision client ready");
        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    #[instrument(skip(self, image), fields(model = %self.config.model, size = image.len()))]
    async fn describe_plate(
        &self,
        image: &[u8],
        mime: &str,
        dims: ImageDimensions,
    ) -> Result<String, AnalysisError> {
        let instruction = build_instruction(dims);
        let request = CompletionRequest {
            model: &self.config.model,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text { text: &instruction },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{};base64,{}", mime, STANDARD.encode(image)),
                        },
                    },
                ],
            }],
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "vision request failed");
                AnalysisError::external(SERVICE, format!("request failed: {}", e))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AnalysisError::external(SERVICE, format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            error!(%status, "vision endpoint returned an error");
            return Err(AnalysisError::external(
                SERVICE,
                format!("status {}: {}", status, body.chars().take(300).collect::<String>()),
            ));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            AnalysisError::external(SERVICE, format!("unexpected completion payload: {}", e))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalysisError::external(SERVICE, "completion had no content"))?;

        debug!(chars = content.len(), "vision answer received");
        Ok(content)
    }
}
