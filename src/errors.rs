use axum::http::StatusCode;
use thiserror::Error;

/// Failure of a plate analysis or of one of the record operations behind the API.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Bad image format/size or malformed request. Nothing was uploaded yet.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The vision model or the object storage failed.
    #[error("{service} failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// The model answered with something that is not the expected JSON.
    #[error("malformed model response: {0}")]
    Parse(String),

    /// Local persistence (record store) failed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// Drawing or re-encoding the annotated image failed.
    #[error("annotation failed: {0:#}")]
    Annotation(anyhow::Error),

    #[error("analysis {0} not found")]
    NotFound(u64),
}

impl AnalysisError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn external(service: &'static str, msg: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: msg.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ExternalService { .. } | Self::Parse(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Annotation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AnalysisError> for (StatusCode, String) {
    fn from(e: AnalysisError) -> Self {
        (e.status(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AnalysisError::validation("too big").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AnalysisError::NotFound(3).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AnalysisError::external("vision model", "timeout").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AnalysisError::Storage(anyhow::anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn converts_into_handler_rejection() {
        let (status, body): (StatusCode, String) = AnalysisError::parse("not json").into();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("not json"));
    }
}
