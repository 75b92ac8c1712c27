//! Fetch, batch, analyze and consolidate: one digest run end to end.

pub mod inference;
pub mod sanitize;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jobdigest_core::{MatchRecord, RunMetadata};
use jobdigest_listing::{FetchedOffers, OfferFetcher, DEFAULT_BASE_URL};
use jobdigest_storage::{
    FsDiagnosticsSink, HttpClientConfig, HttpTransport, RetryPolicy, SnapshotStore,
    DEFAULT_USER_AGENT,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use inference::{
    AttemptError, BatchOutcome, GeminiBackend, GenerateResponse, InferenceBackend,
    InferenceError, MatchAnalyzer, DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL,
};
pub use sanitize::{parse_match_list, sanitize, SanitizeError};

pub const CRATE_NAME: &str = "jobdigest-sync";

pub const MATCHES_FILE: &str = "matches.json";
pub const RAW_OFFERS_FILE: &str = "raw_offers.json";
pub const DEFAULT_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing_base_url: String,
    pub http_timeout_secs: u64,
    pub listing_max_attempts: u32,
    pub listing_backoff: Duration,
    pub sleep_between_pages: Duration,
    pub user_agent: String,
    pub data_dir: PathBuf,
    pub profile_path: PathBuf,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub inference_max_attempts: u32,
    pub inference_backoff: Duration,
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listing_base_url: DEFAULT_BASE_URL.to_string(),
            http_timeout_secs: 60,
            listing_max_attempts: 3,
            listing_backoff: Duration::from_secs(1),
            sleep_between_pages: jobdigest_listing::DEFAULT_SLEEP_BETWEEN_PAGES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            data_dir: PathBuf::from("data"),
            profile_path: PathBuf::from("profile.json"),
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            inference_max_attempts: 3,
            inference_backoff: Duration::from_secs(1),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let batch_size: i64 = env_or("GEMINI_BATCH_SIZE", defaults.batch_size as i64);
        if batch_size <= 0 {
            bail!("GEMINI_BATCH_SIZE must be a positive integer, got {batch_size}");
        }

        Ok(Self {
            listing_base_url: std::env::var("JOBDIGEST_API_BASE_URL")
                .unwrap_or(defaults.listing_base_url),
            http_timeout_secs: env_or("JOBDIGEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            listing_max_attempts: env_or("JOBDIGEST_MAX_RETRIES", defaults.listing_max_attempts),
            listing_backoff: env_secs("JOBDIGEST_BACKOFF_SECONDS", defaults.listing_backoff),
            sleep_between_pages: env_secs(
                "JOBDIGEST_SLEEP_BETWEEN_PAGES",
                defaults.sleep_between_pages,
            ),
            user_agent: std::env::var("JOBDIGEST_USER_AGENT").unwrap_or(defaults.user_agent),
            data_dir: std::env::var("JOBDIGEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            profile_path: std::env::var("JOBDIGEST_PROFILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.profile_path),
            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            gemini_model: std::env::var("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            gemini_base_url: std::env::var("GEMINI_BASE_URL").unwrap_or(defaults.gemini_base_url),
            inference_max_attempts: env_or("GEMINI_MAX_ATTEMPTS", defaults.inference_max_attempts),
            inference_backoff: env_secs("GEMINI_BACKOFF_SECONDS", defaults.inference_backoff),
            batch_size: batch_size as usize,
        })
    }

    pub fn listing_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.listing_max_attempts, self.listing_backoff)
    }

    pub fn inference_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.inference_max_attempts, self.inference_backoff)
    }

    pub fn offer_fetcher(&self) -> Result<OfferFetcher> {
        let transport = HttpTransport::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.listing_retry(),
        })?;
        Ok(OfferFetcher::new(Arc::new(transport), self.listing_base_url.clone())
            .with_page_pacing(self.sleep_between_pages, true))
    }

    pub fn gemini_backend(&self) -> Result<GeminiBackend, InferenceError> {
        let api_key = self
            .gemini_api_key
            .clone()
            .ok_or_else(|| InferenceError::Config("GEMINI_API_KEY not set".into()))?;
        let backend = GeminiBackend::new(
            api_key,
            self.gemini_model.clone(),
            Duration::from_secs(self.http_timeout_secs),
            &self.user_agent,
        )?;
        Ok(backend.with_base_url(self.gemini_base_url.clone()))
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

pub fn load_profile(path: &Path) -> Result<JsonValue> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading profile {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing profile {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
}

/// Contiguous, order-preserving batches; the last one may be shorter.
pub fn split_batches<T>(items: &[T], batch_size: usize) -> Result<Vec<&[T]>, SplitError> {
    if batch_size == 0 {
        return Err(SplitError::ZeroBatchSize);
    }
    Ok(items.chunks(batch_size).collect())
}

/// Run-scoped merge of per-batch matches; first occurrence of a key wins.
#[derive(Debug, Default)]
pub struct MatchConsolidator {
    seen: HashSet<String>,
    matches: Vec<MatchRecord>,
}

impl MatchConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many of `records` were new.
    pub fn absorb(
        &mut self,
        batch_index: usize,
        total_batches: usize,
        records: Vec<MatchRecord>,
    ) -> usize {
        if records.is_empty() {
            warn!(batch = batch_index, total = total_batches, "batch returned 0 matches");
            return 0;
        }
        let before = self.matches.len();
        for record in records {
            if self.seen.insert(record.dedup_key()) {
                self.matches.push(record);
            }
        }
        self.matches.len() - before
    }

    pub fn finish(self) -> Vec<MatchRecord> {
        self.matches
    }
}

pub fn consolidate(per_batch: Vec<Vec<MatchRecord>>) -> Vec<MatchRecord> {
    let total = per_batch.len();
    let mut consolidator = MatchConsolidator::new();
    for (idx, records) in per_batch.into_iter().enumerate() {
        consolidator.absorb(idx + 1, total, records);
    }
    consolidator.finish()
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub meta: RunMetadata,
    pub batches: usize,
    pub degraded_batches: usize,
    pub matches: Vec<MatchRecord>,
    pub matches_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: OfferFetcher,
    analyzer: MatchAnalyzer,
    snapshots: SnapshotStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = config.offer_fetcher()?;
        let backend = config.gemini_backend()?;
        let profile = load_profile(&config.profile_path)?;
        let analyzer = MatchAnalyzer::new(
            Arc::new(backend),
            Arc::new(FsDiagnosticsSink::new(config.data_dir.clone())),
            profile,
            config.inference_retry(),
        );
        Ok(Self::from_parts(config, fetcher, analyzer))
    }

    pub fn from_parts(config: SyncConfig, fetcher: OfferFetcher, analyzer: MatchAnalyzer) -> Self {
        let snapshots = SnapshotStore::new(config.data_dir.clone());
        Self {
            config,
            fetcher,
            analyzer,
            snapshots,
        }
    }

    pub async fn run_once(&self, days: u32, max_pages: Option<u32>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, days, ?max_pages, "digest run started");

        let (postings, meta) = self
            .fetcher
            .get_all_offers(days, max_pages)
            .await
            .context("fetching job postings")?;

        let batches = split_batches(&postings, self.config.batch_size)?;
        let total_batches = batches.len();
        let mut consolidator = MatchConsolidator::new();
        let mut degraded_batches = 0usize;

        for (idx, batch) in batches.iter().enumerate() {
            let batch_index = idx + 1;
            let outcome = self
                .analyzer
                .run_batch(batch, batch_index, total_batches)
                .await;
            if outcome.is_degraded() {
                degraded_batches += 1;
            }
            consolidator.absorb(batch_index, total_batches, outcome.into_matches());
        }

        let matches = consolidator.finish();
        let matches_path = self
            .snapshots
            .write_json(MATCHES_FILE, &matches)
            .await
            .context("writing consolidated matches")?;

        let finished_at = Utc::now();
        info!(
            %run_id,
            postings = postings.len(),
            batches = total_batches,
            degraded_batches,
            matches = matches.len(),
            path = %matches_path.display(),
            "digest run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            meta,
            batches: total_batches,
            degraded_batches,
            matches,
            matches_path: matches_path.display().to_string(),
        })
    }
}

/// Fetch-only run: the consolidated postings and their metadata.
pub async fn fetch_offers(config: &SyncConfig, days: u32, max_pages: Option<u32>) -> Result<FetchedOffers> {
    let fetcher = config.offer_fetcher()?;
    let (results, meta) = fetcher
        .get_all_offers(days, max_pages)
        .await
        .context("fetching job postings")?;
    Ok(FetchedOffers { meta, results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> MatchRecord {
        serde_json::from_value(value).expect("record")
    }

    #[test]
    fn split_preserves_order_and_short_tail() {
        let items: Vec<u32> = (1..=7).collect();
        let batches: Vec<Vec<u32>> = split_batches(&items, 3)
            .expect("split")
            .into_iter()
            .map(|b| b.to_vec())
            .collect();
        assert_eq!(batches, vec![vec![1u32, 2, 3], vec![4, 5, 6], vec![7]]);

        let empty: Vec<u32> = Vec::new();
        assert!(split_batches(&empty, 25).expect("split").is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert_eq!(split_batches(&[1, 2], 0), Err(SplitError::ZeroBatchSize));
    }

    #[test]
    fn consolidation_keeps_first_occurrence_across_batches() {
        let merged = consolidate(vec![
            vec![
                record(json!({"id": "a", "reason": "first"})),
                record(json!({"linkOffer": "https://x/1", "reason": "link"})),
            ],
            vec![],
            vec![
                record(json!({"id": "a", "reason": "second"})),
                record(json!({"id": "", "linkOffer": "https://x/1"})),
                record(json!({"id": "b"})),
            ],
        ]);

        let reasons: Vec<_> = merged.iter().map(MatchRecord::reason).collect();
        assert_eq!(
            reasons,
            vec![Some("first".to_string()), Some("link".to_string()), None]
        );
        assert_eq!(merged[2].id().as_deref(), Some("b"));
    }

    #[test]
    fn records_without_identity_collapse_when_identical() {
        let merged = consolidate(vec![
            vec![record(json!({"title": "Dev", "reason": "x"}))],
            vec![
                record(json!({"reason": "x", "title": "Dev"})),
                record(json!({"title": "Dev", "reason": "y"})),
            ],
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn records_differing_in_null_fields_or_id_type_stay_separate() {
        let parsed = parse_match_list(
            r#"[{"title":"Dev","reason":"x"},{"title":"Dev","reason":"x","id":null},{"id":1,"reason":"num"},{"id":"1","reason":"str"}]"#,
        )
        .expect("list");
        let merged = consolidate(vec![parsed]);

        assert_eq!(merged.len(), 4);
        let persisted = serde_json::to_value(&merged).expect("ser");
        assert_eq!(persisted[1], json!({"title": "Dev", "reason": "x", "id": null}));
        assert_eq!(persisted[2]["id"], json!(1));
        assert_eq!(persisted[3]["id"], json!("1"));
    }

    #[test]
    fn absorb_reports_new_records() {
        let mut consolidator = MatchConsolidator::new();
        assert_eq!(consolidator.absorb(1, 2, vec![record(json!({"id": "a"}))]), 1);
        assert_eq!(
            consolidator.absorb(2, 2, vec![record(json!({"id": "a"})), record(json!({"id": "c"}))]),
            1
        );
        assert_eq!(consolidator.finish().len(), 2);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.listing_max_attempts, 3);
        assert_eq!(config.inference_max_attempts, 3);
        assert_eq!(config.listing_backoff, Duration::from_secs(1));
        assert_eq!(config.sleep_between_pages, Duration::from_millis(300));
        assert!(matches!(
            config.gemini_backend(),
            Err(InferenceError::Config(_))
        ));
    }
}
