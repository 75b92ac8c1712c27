//! Core domain records and identity keys for the job digest pipeline.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "jobdigest-core";

/// Characters of `descriptionOffer` kept in the inference projection.
pub const DESCRIPTION_PREVIEW_CHARS: usize = 400;

/// A job posting as returned by the listing service.
///
/// Postings are opaque: the raw object is kept as-is and the fields the
/// pipeline cares about are read through accessors, so a descriptive field
/// of an unexpected type never rejects a page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Posting(Map<String, JsonValue>);

impl Posting {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    /// `_id` as text, when present and non-empty.
    pub fn id(&self) -> Option<String> {
        identity_text(self.get(POSTING_ID))
    }

    pub fn link(&self) -> Option<String> {
        identity_text(self.get(POSTING_LINK))
    }

    pub fn title(&self) -> Option<&str> {
        self.get(POSTING_TITLE).and_then(JsonValue::as_str)
    }

    /// Identity used for cross-page deduplication: `_id`, then `linkOffer`,
    /// then a sha256 of the canonical record serialization.
    pub fn dedup_key(&self) -> String {
        if let Some(id) = self.id() {
            return id;
        }
        if let Some(link) = self.link() {
            return link;
        }
        sha256_hex(canonical_json(&self.0).as_bytes())
    }

    pub fn projection(&self) -> PostingProjection<'_> {
        let description = match self.get(POSTING_DESCRIPTION) {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(text)) => {
                truncate_chars(text, DESCRIPTION_PREVIEW_CHARS).to_string()
            }
            Some(other) => truncate_chars(&other.to_string(), DESCRIPTION_PREVIEW_CHARS).to_string(),
        };
        PostingProjection {
            id: self.get(POSTING_ID),
            title: self.get(POSTING_TITLE),
            employer: self.get("employer"),
            location: self.get("location"),
            description,
            link: self.get(POSTING_LINK),
        }
    }
}

const POSTING_ID: &str = "_id";
const POSTING_TITLE: &str = "titleJob";
const POSTING_DESCRIPTION: &str = "descriptionOffer";
const POSTING_LINK: &str = "linkOffer";

/// Reduced view of a posting embedded in inference prompts. Values are
/// passed through untouched except the description, which is cut short.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostingProjection<'a> {
    #[serde(rename = "_id")]
    pub id: Option<&'a JsonValue>,
    #[serde(rename = "titleJob")]
    pub title: Option<&'a JsonValue>,
    pub employer: Option<&'a JsonValue>,
    pub location: Option<&'a JsonValue>,
    #[serde(rename = "descriptionOffer")]
    pub description: String,
    #[serde(rename = "linkOffer")]
    pub link: Option<&'a JsonValue>,
}

/// One page of the listing service response.
///
/// Only `totalPages` steers the walk; `total` and `page` are carried as
/// reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEnvelope {
    pub results: Vec<Posting>,
    #[serde(default)]
    pub total: JsonValue,
    #[serde(default)]
    pub page: JsonValue,
    #[serde(rename = "totalPages", deserialize_with = "de_page_count")]
    pub total_pages: i64,
}

/// A posting accepted by the inference service.
///
/// Model output is untrusted, so the object is stored exactly as returned
/// and persisted unchanged. Accessors render values as text for display.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchRecord(Map<String, JsonValue>);

impl MatchRecord {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn id(&self) -> Option<String> {
        display_text(self.get("id"))
    }

    pub fn title(&self) -> Option<String> {
        display_text(self.get("title"))
    }

    pub fn employer(&self) -> Option<String> {
        display_text(self.get("employer"))
    }

    pub fn link_offer(&self) -> Option<String> {
        display_text(self.get("linkOffer"))
    }

    pub fn reason(&self) -> Option<String> {
        display_text(self.get("reason"))
    }

    /// `id`, then `linkOffer`, then the canonical serialization of the raw
    /// object. Keys are JSON-encoded, so `1` and `"1"` stay distinct.
    ///
    /// Two distinct records that serialize identically share a key.
    pub fn dedup_key(&self) -> String {
        let identity = [self.get("id"), self.get("linkOffer")]
            .into_iter()
            .flatten()
            .find(|value| is_present(value));
        match identity {
            Some(value) => value.to_string(),
            None => JsonValue::String(canonical_json(&self.0)).to_string(),
        }
    }
}

impl From<Map<String, JsonValue>> for MatchRecord {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }
}

/// Aggregate counters describing one listing fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// `total` from the first page, as the service reported it.
    pub total_reported: JsonValue,
    pub pages_traversed: u32,
    pub total_pages_api: i64,
    pub items_consolidated: usize,
    pub days_param: u32,
}

/// Sorted-key JSON serialization. `serde_json::Map` is a `BTreeMap` unless
/// `preserve_order` is enabled, so converting through `Value` sorts keys.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .map(|v| v.to_string())
        .unwrap_or_default()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Prefix of `input` holding at most `max_chars` characters.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn identity_text(value: Option<&JsonValue>) -> Option<String> {
    value.filter(|v| is_present(v)).map(|v| match v {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn display_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Page counts arrive as integers, floats or numeric strings.
fn de_page_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let count = match &value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    count.ok_or_else(|| {
        <D::Error as serde::de::Error>::custom(format!("expected a page count, found {value}"))
    })
}
