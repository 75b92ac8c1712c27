//! Paginated client for the job listing service.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jobdigest_core::{PageEnvelope, Posting, RunMetadata};
use jobdigest_storage::{JsonTransport, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobdigest-listing";

pub const DEFAULT_BASE_URL: &str = "https://job-offers-api-ujjz.onrender.com/job-offers";
pub const DEFAULT_DAYS: u32 = 7;
pub const DEFAULT_SLEEP_BETWEEN_PAGES: Duration = Duration::from_millis(300);

const REQUIRED_KEYS: [&str; 4] = ["results", "total", "totalPages", "page"];

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("fetching page {page} failed after {attempts} attempt(s): {source}")]
    Transport {
        page: u32,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("invalid response for page {page}: {reason}")]
    Shape { page: u32, reason: String },
}

/// Consolidated fetch output, as written by the standalone fetch command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedOffers {
    pub meta: RunMetadata,
    pub results: Vec<Posting>,
}

/// Run-scoped dedup state: postings in first-seen order plus their keys.
#[derive(Debug, Default)]
pub struct PostingAccumulator {
    seen: HashSet<String>,
    postings: Vec<Posting>,
}

impl PostingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends unseen postings and returns how many were kept.
    pub fn extend(&mut self, items: impl IntoIterator<Item = Posting>) -> usize {
        let before = self.postings.len();
        for item in items {
            if self.seen.insert(item.dedup_key()) {
                self.postings.push(item);
            }
        }
        self.postings.len() - before
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    pub fn into_postings(self) -> Vec<Posting> {
        self.postings
    }
}

/// Checks the envelope keys before decoding so the error names what is missing.
pub fn validate_envelope(value: JsonValue, page: u32) -> Result<PageEnvelope, ListingError> {
    let shape = |reason: String| ListingError::Shape { page, reason };

    let object = value
        .as_object()
        .ok_or_else(|| shape("response is not a JSON object".to_string()))?;
    for key in REQUIRED_KEYS {
        if !object.contains_key(key) {
            return Err(shape(format!("missing key '{key}'")));
        }
    }
    if !object["results"].is_array() {
        return Err(shape("expected 'results' to be a list".to_string()));
    }

    serde_json::from_value(value).map_err(|err| shape(err.to_string()))
}

pub struct OfferFetcher {
    transport: Arc<dyn JsonTransport>,
    base_url: String,
    sleep_between_pages: Duration,
    respect_rate_limit: bool,
}

impl OfferFetcher {
    pub fn new(transport: Arc<dyn JsonTransport>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
            sleep_between_pages: DEFAULT_SLEEP_BETWEEN_PAGES,
            respect_rate_limit: true,
        }
    }

    pub fn with_page_pacing(mut self, sleep_between_pages: Duration, respect_rate_limit: bool) -> Self {
        self.sleep_between_pages = sleep_between_pages;
        self.respect_rate_limit = respect_rate_limit;
        self
    }

    pub async fn fetch_page(&self, days: u32, page: u32) -> Result<PageEnvelope, ListingError> {
        let query = [("days", days.to_string()), ("page", page.to_string())];
        let value = self
            .transport
            .get_json(&self.base_url, &query)
            .await
            .map_err(|source| ListingError::Transport {
                page,
                attempts: source.attempts(),
                source,
            })?;
        validate_envelope(value, page)
    }

    /// Walks pages `1..=min(totalPages, max_pages)` in order and returns the
    /// deduplicated postings. Any page failure aborts the whole walk.
    pub async fn get_all_offers(
        &self,
        days: u32,
        max_pages: Option<u32>,
    ) -> Result<(Vec<Posting>, RunMetadata), ListingError> {
        let first = self.fetch_page(days, 1).await?;
        let total_pages_api = first.total_pages;
        let reported_pages = u32::try_from(total_pages_api.max(1)).unwrap_or(u32::MAX);
        let total_pages = match max_pages {
            Some(cap) => reported_pages.min(cap.max(1)),
            None => reported_pages,
        };
        info!(days, total_pages_api, total_pages, total_reported = %first.total, "listing walk started");

        let total_reported = first.total;
        let mut accumulator = PostingAccumulator::new();
        let kept = accumulator.extend(first.results);
        debug!(page = 1, kept, "page consolidated");

        for page in 2..=total_pages {
            if self.respect_rate_limit && !self.sleep_between_pages.is_zero() {
                tokio::time::sleep(self.sleep_between_pages).await;
            }
            let envelope = self.fetch_page(days, page).await?;
            let kept = accumulator.extend(envelope.results);
            debug!(page, kept, "page consolidated");
        }

        let meta = RunMetadata {
            total_reported,
            pages_traversed: total_pages,
            total_pages_api,
            items_consolidated: accumulator.len(),
            days_param: days,
        };
        info!(
            pages = meta.pages_traversed,
            items = meta.items_consolidated,
            "listing walk finished"
        );
        Ok((accumulator.into_postings(), meta))
    }
}
