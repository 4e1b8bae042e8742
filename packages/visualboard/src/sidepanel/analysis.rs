//! Client for the remote analysis service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{Result, VisualboardError};
use crate::model::{AnalysisBotContext, CastHint, StoryState};

pub const ANALYZE_PATH: &str = "/api/analyze-chat";

/// Typed failure reported by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisErrorCode {
    ParseError,
    ModelRefusal,
    SchemaError,
    EmptyResponse,
    OpenaiApiError,
    #[serde(other)]
    UnknownError,
}

impl AnalysisErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisErrorCode::ParseError => "PARSE_ERROR",
            AnalysisErrorCode::ModelRefusal => "MODEL_REFUSAL",
            AnalysisErrorCode::SchemaError => "SCHEMA_ERROR",
            AnalysisErrorCode::EmptyResponse => "EMPTY_RESPONSE",
            AnalysisErrorCode::OpenaiApiError => "OPENAI_API_ERROR",
            AnalysisErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Panel-facing text for each code.
    pub fn user_message(&self) -> &'static str {
        match self {
            AnalysisErrorCode::ParseError => {
                "분석 결과를 해석하지 못했습니다. 다시 시도해주세요."
            }
            AnalysisErrorCode::ModelRefusal => {
                "이 장면은 분석할 수 없습니다. 다른 턴에서 다시 시도해주세요."
            }
            AnalysisErrorCode::SchemaError => {
                "분석 결과 형식이 올바르지 않습니다. 다시 시도해주세요."
            }
            AnalysisErrorCode::EmptyResponse => {
                "분석 서버가 빈 응답을 보냈습니다. 잠시 후 다시 시도해주세요."
            }
            AnalysisErrorCode::OpenaiApiError => {
                "AI 서비스가 응답하지 않습니다. 잠시 후 다시 시도해주세요."
            }
            AnalysisErrorCode::UnknownError => crate::error::GENERIC_ANALYSIS_FAILURE,
        }
    }
}

impl std::fmt::Display for AnalysisErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `POST /api/analyze-chat` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub chat_text: String,
    pub previous_state: Option<StoryState>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cast_hints: Vec<CastHint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_context: Option<AnalysisBotContext>,
}

impl AnalysisRequest {
    pub fn new(chat_text: &str, previous_state: Option<StoryState>) -> Self {
        Self {
            chat_text: chat_text.trim().to_string(),
            previous_state,
            cast_hints: Vec::new(),
            bot_context: None,
        }
    }

    pub fn with_cast_hints(mut self, hints: Vec<CastHint>) -> Self {
        self.cast_hints = hints;
        self
    }

    pub fn with_bot_context(mut self, context: Option<AnalysisBotContext>) -> Self {
        self.bot_context = context.filter(|c| !c.is_empty());
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: AnalysisErrorCode,
    #[serde(default)]
    message: String,
    #[serde(default)]
    raw_preview: Option<String>,
}

fn analysis_error(code: AnalysisErrorCode, message: impl Into<String>) -> VisualboardError {
    VisualboardError::Analysis {
        code,
        message: message.into(),
    }
}

/// Pull the raw state out of a response body.
///
/// Accepts `{ ok: true, data: { state } }`, the older `{ state }` and
/// `{ data }` shapes, and turns `{ ok: false, error }` into a typed error.
pub fn parse_analysis_body(status: u16, body: &Value) -> Result<Value> {
    if body.get("ok").and_then(Value::as_bool) == Some(false) {
        let error = body
            .get("error")
            .cloned()
            .and_then(|e| serde_json::from_value::<ErrorBody>(e).ok());
        return Err(match error {
            Some(e) => {
                if let Some(preview) = &e.raw_preview {
                    tracing::debug!(code = %e.code, preview_len = preview.len(), "Analysis raw preview");
                }
                analysis_error(e.code, e.message)
            }
            None => analysis_error(AnalysisErrorCode::UnknownError, format!("API error: {}", status)),
        });
    }

    if !(200..300).contains(&status) {
        return Err(analysis_error(
            AnalysisErrorCode::UnknownError,
            format!("API error: {}", status),
        ));
    }

    let state = body
        .get("data")
        .and_then(|d| d.get("state"))
        .or_else(|| body.get("state"))
        .or_else(|| {
            body.get("data")
                .filter(|d| d.get("scenes").is_some() || d.get("scene").is_some())
        })
        .filter(|s| s.is_object());

    state
        .cloned()
        .ok_or_else(|| analysis_error(AnalysisErrorCode::SchemaError, "API response missing state"))
}

/// The remote analyzer, addressed by base URL so environment switches need
/// no new client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Returns the raw (not yet upgraded) state.
    async fn analyze(&self, base_url: &str, request: &AnalysisRequest) -> Result<Value>;
}

pub struct HttpAnalysisClient {
    client: Client,
}

impl HttpAnalysisClient {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            VisualboardError::Other(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.server.request_timeout_secs.map(Duration::from_secs))
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisClient {
    async fn analyze(&self, base_url: &str, request: &AnalysisRequest) -> Result<Value> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), ANALYZE_PATH);
        tracing::debug!(
            text_len = request.chat_text.len(),
            has_previous = request.previous_state.is_some(),
            hints = request.cast_hints.len(),
            has_bot_context = request.bot_context.is_some(),
            "POST {}",
            url
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if body.is_null() && (200..300).contains(&status) {
            return Err(analysis_error(
                AnalysisErrorCode::ParseError,
                "API response is not JSON",
            ));
        }
        parse_analysis_body(status, &body)
    }
}
