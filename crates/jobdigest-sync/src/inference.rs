//! Per-batch match selection through an external text-generation service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobdigest_core::{truncate_chars, MatchRecord, Posting};
use jobdigest_storage::{AttemptDiagnostic, DiagnosticsSink, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::sanitize::{parse_match_list, SanitizeError};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-lite";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Characters of the prompt kept in a failed-attempt artifact.
pub const PROMPT_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// `generateContent` response. Every link of
/// `candidates[0].content.parts[*].text` may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl GenerateResponse {
    /// Single-candidate, single-part response carrying `text`.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: Some(vec![Candidate {
                content: Some(Content {
                    parts: Some(vec![Part {
                        text: Some(text.into()),
                    }]),
                    role: Some("model".to_string()),
                }),
                extra: Map::new(),
            }]),
            extra: Map::new(),
        }
    }

    /// Concatenated non-empty text parts of the first candidate.
    pub fn extract_text(&self) -> Option<String> {
        let parts = self
            .candidates
            .as_ref()?
            .first()?
            .content
            .as_ref()?
            .parts
            .as_ref()?;
        let text: String = parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .filter(|text| !text.is_empty())
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

/// Submit a text prompt, receive a response object.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<GenerateResponse, InferenceError>;
}

#[derive(Clone)]
pub struct GeminiBackend {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiBackend {
    /// `timeout` bounds each `generateContent` call, connect through body.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, InferenceError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| InferenceError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl InferenceBackend for GeminiBackend {
    async fn generate(&self, prompt: &str) -> Result<GenerateResponse, InferenceError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .http_client
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api(format!("{status}: {text}")));
        }

        response
            .json::<GenerateResponse>()
            .await
            .map_err(|e| InferenceError::Parse(e.to_string()))
    }
}

/// Why a single inference attempt produced no usable list.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Service(#[from] InferenceError),
    #[error("inference response carried no text")]
    Empty,
    #[error(transparent)]
    Malformed(#[from] SanitizeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Matched(Vec<MatchRecord>),
    /// Every attempt failed; the batch contributes nothing.
    Degraded { attempts: u32 },
}

impl BatchOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn into_matches(self) -> Vec<MatchRecord> {
        match self {
            Self::Matched(records) => records,
            Self::Degraded { .. } => Vec::new(),
        }
    }
}

pub struct MatchAnalyzer {
    backend: Arc<dyn InferenceBackend>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    profile: JsonValue,
    retry: RetryPolicy,
}

impl MatchAnalyzer {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        profile: JsonValue,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            diagnostics,
            profile,
            retry,
        }
    }

    pub fn build_prompt(&self, batch: &[Posting], batch_index: usize, total_batches: usize) -> String {
        let profile = serde_json::to_string(&self.profile).unwrap_or_default();
        let previews = batch.iter().map(Posting::projection).collect::<Vec<_>>();
        let offers = serde_json::to_string(&previews).unwrap_or_default();

        format!(
            "You filter job postings against a professional profile. \
             Do not consider assistant or junior positions. \
             Work out which employers are the most important in the region and give them priority.\n\n\
             Profile:\n{profile}\n\n\
             Batch {batch_index}/{total_batches} - Postings (fields: _id, titleJob, employer, location, descriptionOffer, linkOffer):\n\
             {offers}\n\n\
             Task: return ONLY JSON whose root is a LIST. Each element must have exactly these fields:\n\
             - \"id\": the posting's \"_id\" value (if it has none, use linkOffer),\n\
             - \"title\": titleJob,\n\
             - \"employer\": employer,\n\
             - \"linkOffer\": linkOffer,\n\
             - \"reason\": a short explanation (1-2 sentences) of why the posting fits the profile.\n\n\
             In reason, state the salary range when the posting mentions one. \
             The answer must be strict JSON with no extra commentary. \
             If nothing matches, return [] (an empty list is a valid answer).\n"
        )
    }

    /// Matches for one batch. Never fails: exhausted retries yield an empty list.
    pub async fn analyze_batch(
        &self,
        batch: &[Posting],
        batch_index: usize,
        total_batches: usize,
    ) -> Vec<MatchRecord> {
        self.run_batch(batch, batch_index, total_batches)
            .await
            .into_matches()
    }

    pub async fn run_batch(
        &self,
        batch: &[Posting],
        batch_index: usize,
        total_batches: usize,
    ) -> BatchOutcome {
        let prompt = self.build_prompt(batch, batch_index, total_batches);
        let span = info_span!(
            "analyze_batch",
            batch = batch_index,
            total = total_batches,
            postings = batch.len()
        );

        let result = self
            .retry
            .run(
                |attempt| self.attempt(&prompt, batch_index, attempt),
                |_: &AttemptError| true,
            )
            .instrument(span)
            .await;

        match result {
            Ok(records) => {
                info!(
                    batch = batch_index,
                    total = total_batches,
                    matches = records.len(),
                    "batch analyzed"
                );
                BatchOutcome::Matched(records)
            }
            Err(failure) => {
                error!(
                    batch = batch_index,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "batch failed on every attempt; skipping"
                );
                BatchOutcome::Degraded {
                    attempts: failure.attempts,
                }
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        batch_index: usize,
        attempt: u32,
    ) -> Result<Vec<MatchRecord>, AttemptError> {
        let (outcome, response_str) = match self.backend.generate(prompt).await {
            Err(err) => (Err(AttemptError::Service(err)), None),
            Ok(response) => {
                let response_str = serde_json::to_string(&response).ok();
                let outcome = match response.extract_text() {
                    None => Err(AttemptError::Empty),
                    Some(text) => parse_match_list(&text).map_err(AttemptError::from),
                };
                (outcome, response_str)
            }
        };

        if let Err(err) = &outcome {
            self.record_failure(prompt, batch_index, attempt, err, response_str)
                .await;
        }
        outcome
    }

    async fn record_failure(
        &self,
        prompt: &str,
        batch_index: usize,
        attempt: u32,
        err: &AttemptError,
        response_str: Option<String>,
    ) {
        let diagnostic = AttemptDiagnostic {
            batch_index,
            attempt,
            timestamp: Utc::now(),
            error: format!("{err:?}"),
            prompt_preview: truncate_chars(prompt, PROMPT_PREVIEW_CHARS).to_string(),
            response_str,
        };
        match self.diagnostics.record(&diagnostic).await {
            Ok(location) => error!(
                batch = batch_index,
                attempt,
                error = %err,
                artifact = %location,
                "inference attempt failed"
            ),
            Err(sink_err) => warn!(
                batch = batch_index,
                attempt,
                error = %err,
                sink_error = %sink_err,
                "inference attempt failed; diagnostic not persisted"
            ),
        }
    }
}
