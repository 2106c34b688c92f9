//! Work item and result record types persisted in the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Processing status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting in the backlog to be claimed.
    Pending,
    /// Claimed by a batch run.
    Processing,
    /// All requested inference stages completed.
    Inferred,
    /// A claimed item whose generation failed. Terminal.
    Error,
    /// Curated item eligible for backfill stages.
    Liked,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Inferred,
        ItemStatus::Error,
        ItemStatus::Liked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Inferred => "inferred",
            ItemStatus::Error => "error",
            ItemStatus::Liked => "liked",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidStatus(s.to_string()))
    }
}

/// Named result slot on a work item. Each slot maps model key to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Captions,
    Moderations,
    AgeEstimations,
    Tags,
}

impl Slot {
    /// Field name in the serialized document.
    pub fn field(&self) -> &'static str {
        match self {
            Slot::Captions => "captions",
            Slot::Moderations => "moderations",
            Slot::AgeEstimations => "ageEstimations",
            Slot::Tags => "tags",
        }
    }

    /// Column holding the slot in the SQLite table.
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Slot::Captions => "captions",
            Slot::Moderations => "moderations",
            Slot::AgeEstimations => "age_estimations",
            Slot::Tags => "tags",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Provenance of a result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Human-readable model name.
    pub model: String,
    /// Inference backend, e.g. `llama.cpp`.
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_file: Option<String>,
    /// Prompt that produced the output.
    pub prompt: String,
    /// Model key of the upstream result this record was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_source: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One model's output for one stage of one item.
///
/// `raw_output` is always kept verbatim; `parsed_result` is `None` when the
/// output could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub metadata: RecordMetadata,
    pub raw_output: String,
    pub parsed_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_character_age: Option<Value>,
}

impl ResultRecord {
    pub fn new(metadata: RecordMetadata, raw_output: impl Into<String>) -> Self {
        Self {
            metadata,
            raw_output: raw_output.into(),
            parsed_result: None,
            explanation: None,
            main_character_age: None,
        }
    }

    pub fn with_parsed(mut self, parsed: Option<Value>) -> Self {
        self.parsed_result = parsed;
        self
    }

    pub fn with_explanation(mut self, explanation: Option<String>) -> Self {
        self.explanation = explanation;
        self
    }

    pub fn with_main_character_age(mut self, age: Option<Value>) -> Self {
        self.main_character_age = age;
        self
    }
}

/// A slot map: model key to result record.
pub type SlotMap = BTreeMap<String, ResultRecord>;

/// A unit of backlog work: one source image and everything inferred about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    /// Storage key of the source asset, e.g. `twitter/abc.png`.
    pub key: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub captions: SlotMap,
    #[serde(default)]
    pub moderations: SlotMap,
    #[serde(default)]
    pub age_estimations: SlotMap,
    #[serde(default)]
    pub tags: SlotMap,
}

impl WorkItem {
    /// Creates a pending item for a freshly ingested asset key.
    ///
    /// `type` is the first path segment and `postId` the file stem of the
    /// last segment up to its first dot.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let mut segments = key.split('/');
        let item_type = segments
            .next()
            .filter(|s| !s.is_empty() && key.contains('/'))
            .map(str::to_string);
        let post_id = key
            .rsplit('/')
            .next()
            .and_then(|name| name.split('.').next())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Self {
            id: Self::id_for_key(&key),
            key,
            item_type,
            post_id,
            status: ItemStatus::Pending,
            captions: SlotMap::new(),
            moderations: SlotMap::new(),
            age_estimations: SlotMap::new(),
            tags: SlotMap::new(),
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    /// Derives the document id by percent-encoding every byte of the key
    /// outside the unreserved set, `/` included.
    pub fn id_for_key(key: &str) -> String {
        urlencoding::encode(key).into_owned()
    }

    pub fn slot(&self, slot: Slot) -> &SlotMap {
        match slot {
            Slot::Captions => &self.captions,
            Slot::Moderations => &self.moderations,
            Slot::AgeEstimations => &self.age_estimations,
            Slot::Tags => &self.tags,
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_mut(&mut self, slot: Slot) -> &mut SlotMap {
        match slot {
            Slot::Captions => &mut self.captions,
            Slot::Moderations => &mut self.moderations,
            Slot::AgeEstimations => &mut self.age_estimations,
            Slot::Tags => &mut self.tags,
        }
    }

    /// Whether the stage represented by `slot` has run under `model_key`.
    pub fn has_result(&self, slot: Slot, model_key: &str) -> bool {
        self.slot(slot).contains_key(model_key)
    }

    pub fn result(&self, slot: Slot, model_key: &str) -> Option<&ResultRecord> {
        self.slot(slot).get(model_key)
    }
}

/// Model keys become JSON path segments, so they are restricted to a safe
/// alphabet.
pub fn validate_model_key(model_key: &str) -> Result<(), StoreError> {
    let valid = !model_key.is_empty()
        && model_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidModelKey(model_key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> RecordMetadata {
        RecordMetadata {
            model: "Qwen3-32B (Q6_K)".to_string(),
            backend: "llama.cpp".to_string(),
            language_repository: Some("Qwen/Qwen3-32B-GGUF".to_string()),
            vision_repository: None,
            language_file: Some("Qwen3-32B-Q6_K.gguf".to_string()),
            vision_file: None,
            prompt: "Estimate ages.".to_string(),
            caption_source: Some("minicpm".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_id_for_key_encodes_slashes() {
        assert_eq!(WorkItem::id_for_key("twitter/abc.png"), "twitter%2Fabc.png");
        assert_eq!(WorkItem::id_for_key("a b/c~d_e-f.jpg"), "a%20b%2Fc~d_e-f.jpg");
    }

    #[test]
    fn test_new_item_derives_type_and_post_id() {
        let item = WorkItem::new("twitter/1712345678_0.jpg");
        assert_eq!(item.id, "twitter%2F1712345678_0.jpg");
        assert_eq!(item.item_type.as_deref(), Some("twitter"));
        assert_eq!(item.post_id.as_deref(), Some("1712345678_0"));
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.captions.is_empty());
    }

    #[test]
    fn test_new_item_without_directory() {
        let item = WorkItem::new("loose.png");
        assert_eq!(item.item_type, None);
        assert_eq!(item.post_id.as_deref(), Some("loose"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("done".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_record_serialization_shape() {
        let record = ResultRecord::new(metadata(), "{\"characters\": []}")
            .with_parsed(Some(json!({"characters": []})));
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["raw_output"], "{\"characters\": []}");
        assert_eq!(value["metadata"]["caption_source"], "minicpm");
        assert_eq!(value["metadata"]["language_repository"], "Qwen/Qwen3-32B-GGUF");
        assert!(value["metadata"]["createdAt"].is_string());
        assert!(value.get("explanation").is_none());
    }

    #[test]
    fn test_unparsed_record_keeps_null_slot() {
        let record = ResultRecord::new(metadata(), "not json at all");
        let value = serde_json::to_value(&record).unwrap();
        assert!(value["parsed_result"].is_null());
        assert_eq!(value["raw_output"], "not json at all");
    }

    #[test]
    fn test_has_result() {
        let mut item = WorkItem::new("twitter/x.png");
        assert!(!item.has_result(Slot::Captions, "minicpm"));
        item.slot_mut(Slot::Captions)
            .insert("minicpm".to_string(), ResultRecord::new(metadata(), "a cat"));
        assert!(item.has_result(Slot::Captions, "minicpm"));
        assert!(!item.has_result(Slot::Moderations, "minicpm"));
    }

    #[test]
    fn test_validate_model_key() {
        assert!(validate_model_key("minicpm").is_ok());
        assert!(validate_model_key("qwen3_32b-q6").is_ok());
        assert!(validate_model_key("").is_err());
        assert!(validate_model_key("a\".b").is_err());
        assert!(validate_model_key("a.b").is_err());
    }
}
