//! Core domain model for the data.json harvester: remote entries, local records,
//! tracking links and the persisted plan of a harvest job.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "djh-core";

/// Annotation holding the URL of the document a record was harvested from.
pub const SOURCE_URL_KEY: &str = "source_datajson_url";

/// Annotation holding the remote `identifier` a record was harvested from.
pub const SOURCE_IDENTIFIER_KEY: &str = "source_datajson_identifier";

/// One dataset description from a remote data.json document.
///
/// Keys the harvester does not interpret are kept in `metadata` so the entry
/// serializes back to what was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distribution: Vec<Distribution>,
    #[serde(flatten)]
    pub metadata: Map<String, JsonValue>,
}

impl RemoteEntry {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: Some(title.into()),
            description: None,
            distribution: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_distribution(mut self, url: impl Into<String>) -> Self {
        self.distribution.push(Distribution::with_download_url(url));
        self
    }

    /// Trimmed, non-empty title.
    pub fn title_text(&self) -> Option<&str> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
    }

    /// Verbatim JSON copy of the entry, stored on tracking links.
    pub fn snapshot(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A distribution (downloadable resource) of a remote entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(rename = "downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(rename = "accessURL", default, skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(flatten)]
    pub metadata: Map<String, JsonValue>,
}

impl Distribution {
    pub fn with_download_url(url: impl Into<String>) -> Self {
        Self {
            download_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// `downloadURL`, then `accessURL`, then `url`; blanks are skipped.
    pub fn effective_url(&self) -> Option<&str> {
        [&self.download_url, &self.access_url, &self.url]
            .into_iter()
            .filter_map(|candidate| candidate.as_deref())
            .map(str::trim)
            .find(|candidate| !candidate.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Active,
    Unpublished,
}

/// A sub-resource of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    pub url: String,
    pub name: Option<String>,
    pub format: Option<String>,
}

/// A sub-resource about to be written. Without a `resource_id` the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDraft {
    pub resource_id: Option<String>,
    pub url: String,
    pub name: Option<String>,
    pub format: Option<String>,
}

/// A dataset record as stored by the host catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub record_id: String,
    pub name: String,
    pub title: String,
    pub notes: Option<String>,
    pub state: RecordState,
    pub extras: BTreeMap<String, String>,
    pub resources: Vec<Resource>,
    /// Host fields outside the harvester's model (tags, license, ...).
    pub attributes: Map<String, JsonValue>,
}

impl LocalRecord {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn source_identifier(&self) -> Option<&str> {
        self.annotation(SOURCE_IDENTIFIER_KEY)
    }
}

/// Fields produced by mapping a remote entry onto the local record schema.
///
/// `notes: None` and attribute keys absent from `attributes` mean "not set":
/// an update keeps whatever the stored record has there.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFields {
    pub title: String,
    pub notes: Option<String>,
    pub extras: BTreeMap<String, String>,
    pub resources: Vec<ResourceDraft>,
    pub attributes: Map<String, JsonValue>,
}

/// Full record payload handed to the store on create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub record_id: String,
    pub name: String,
    pub title: String,
    pub notes: Option<String>,
    pub state: RecordState,
    pub extras: BTreeMap<String, String>,
    pub resources: Vec<ResourceDraft>,
    pub attributes: Map<String, JsonValue>,
}

impl RecordDraft {
    pub fn from_fields(record_id: impl Into<String>, name: impl Into<String>, fields: RecordFields) -> Self {
        Self {
            record_id: record_id.into(),
            name: name.into(),
            title: fields.title,
            notes: fields.notes,
            state: RecordState::Active,
            extras: fields.extras,
            resources: fields.resources,
            attributes: fields.attributes,
        }
    }
}

impl From<&LocalRecord> for RecordDraft {
    fn from(record: &LocalRecord) -> Self {
        Self {
            record_id: record.record_id.clone(),
            name: record.name.clone(),
            title: record.title.clone(),
            notes: record.notes.clone(),
            state: record.state,
            extras: record.extras.clone(),
            resources: record
                .resources
                .iter()
                .map(|res| ResourceDraft {
                    resource_id: Some(res.resource_id.clone()),
                    url: res.url.clone(),
                    name: res.name.clone(),
                    format: res.format.clone(),
                })
                .collect(),
            attributes: record.attributes.clone(),
        }
    }
}

/// Durable association between a source's remote identifier and the record it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingLink {
    /// Same value as the id of the work item that produced the link.
    pub link_id: Uuid,
    pub job_id: Uuid,
    pub source_id: String,
    pub identifier: String,
    pub record_id: String,
    pub current: bool,
    pub content_snapshot: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Imported,
    Skipped,
    Failed,
}

/// One entry of a persisted reconciliation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: Uuid,
    pub job_id: Uuid,
    pub record_id: String,
    pub entry: RemoteEntry,
    pub state: WorkItemState,
    pub error: Option<String>,
}

impl WorkItem {
    pub fn pending(job_id: Uuid, record_id: impl Into<String>, entry: RemoteEntry) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            job_id,
            record_id: record_id.into(),
            entry,
            state: WorkItemState::Pending,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Planned,
    Completed,
    NothingToDo,
    Failed,
}

/// One harvest run of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestJob {
    pub job_id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub retirements: Vec<String>,
    pub error: Option<String>,
}

impl HarvestJob {
    pub fn start(source_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_id: source_id.into(),
            source_url: source_url.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Planned,
            retirements: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

text_enum!(WorkItemState {
    Pending => "pending",
    Imported => "imported",
    Skipped => "skipped",
    Failed => "failed",
});

text_enum!(JobStatus {
    Planned => "planned",
    Completed => "completed",
    NothingToDo => "nothing_to_do",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_entry_keeps_uninterpreted_keys_in_snapshot() {
        let raw = json!({
            "identifier": "abc-1",
            "title": "Water Quality",
            "keyword": ["water", "quality"],
            "distribution": [{"accessURL": "https://example.org/api", "conformsTo": "x"}]
        });
        let entry: RemoteEntry = serde_json::from_value(raw.clone()).expect("entry");

        assert_eq!(entry.metadata.get("keyword"), raw.get("keyword"));
        assert_eq!(entry.snapshot().expect("snapshot"), raw);
    }

    #[test]
    fn effective_url_prefers_download_then_access_then_url() {
        let dist = Distribution {
            download_url: Some("  ".into()),
            access_url: Some("https://example.org/access".into()),
            url: Some("https://example.org/plain".into()),
            ..Default::default()
        };
        assert_eq!(dist.effective_url(), Some("https://example.org/access"));
        assert_eq!(Distribution::default().effective_url(), None);
    }

    #[test]
    fn status_text_is_parseable() {
        for status in [
            JobStatus::Planned,
            JobStatus::Completed,
            JobStatus::NothingToDo,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("bogus".parse::<WorkItemState>().is_err());
    }
}
