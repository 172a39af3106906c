//! Source adapter contract plus the data.json document parser and field mapper.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use djh_core::{RecordFields, RemoteEntry, ResourceDraft};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "djh-adapters";

/// Longest generated record name, leaving room for a disambiguating suffix.
pub const MAX_NAME_LEN: usize = 94;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub source_id: String,
    pub source_url: String,
}

/// The fetched document could not be read as a catalog. Fatal for the run.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("document is neither a list of datasets nor an object with a `dataset` list")]
    NotAList,
    #[error("dataset #{index} is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },
}

/// A single entry could not be translated. The entry is skipped, the run goes on.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("dataset {identifier} has no title")]
    MissingTitle { identifier: String },
    #[error("dataset {identifier}: distribution #{index} has no downloadURL, accessURL or url")]
    DistributionWithoutUrl { identifier: String, index: usize },
}

pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    fn parse_document(&self, bytes: &[u8]) -> Result<Vec<RemoteEntry>, ParseError>;

    fn map_entry(&self, ctx: &AdapterContext, entry: &RemoteEntry) -> Result<RecordFields, MappingError>;
}

/// Parses a data.json document: a top-level list of datasets, or the v1.1
/// `{"dataset": [...]}` envelope. Document order is preserved.
pub fn parse_catalog_document(bytes: &[u8]) -> Result<Vec<RemoteEntry>, ParseError> {
    let document: JsonValue = serde_json::from_slice(bytes)?;
    let datasets = match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut envelope) => match envelope.remove("dataset") {
            Some(JsonValue::Array(items)) => items,
            _ => return Err(ParseError::NotAList),
        },
        _ => return Err(ParseError::NotAList),
    };

    datasets
        .into_iter()
        .enumerate()
        .map(|(index, item)| parse_entry(index, item))
        .collect()
}

fn parse_entry(index: usize, item: JsonValue) -> Result<RemoteEntry, ParseError> {
    let invalid = |reason: String| ParseError::InvalidEntry { index, reason };
    if !item.is_object() {
        return Err(invalid("not an object".into()));
    }
    match item.get("identifier") {
        Some(JsonValue::String(identifier)) if !identifier.trim().is_empty() => {}
        Some(JsonValue::String(_)) => return Err(invalid("empty identifier".into())),
        Some(_) => return Err(invalid("identifier is not a string".into())),
        None => return Err(invalid("missing identifier".into())),
    }
    serde_json::from_value(item).map_err(|err| invalid(err.to_string()))
}

pub fn load_fixture_document(path: impl AsRef<Path>) -> Result<Vec<RemoteEntry>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_catalog_document(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// URL-safe record name from a title: lowercase ASCII letters, digits and single hyphens.
/// Non-ASCII letters are transliterated first, so "Café" keeps its `e`.
pub fn munge_title_to_name(title: &str) -> String {
    let ascii = deunicode::deunicode(title);
    let mut name = String::with_capacity(ascii.len());
    for c in ascii.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if matches!(c, ' ' | '.' | ':' | '/' | '_' | '-') && !name.ends_with('-') {
            name.push('-');
        }
    }
    let mut name = name.trim_matches('-').to_string();
    if name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN);
        name = name.trim_end_matches('-').to_string();
    }
    if name.len() < 2 {
        name = if name.is_empty() {
            "dataset".to_string()
        } else {
            format!("dataset-{name}")
        };
    }
    name
}

/// Appends a short random suffix to a name that is already taken.
pub fn disambiguate_name(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{name}-{}", &suffix[..5])
}

fn strip_markup(text: &str) -> String {
    let plain = if text.contains('<') {
        Html::parse_fragment(text)
            .root_element()
            .text()
            .collect::<String>()
    } else {
        text.to_string()
    };
    plain.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Array(items) => {
            let parts = items.iter().filter_map(json_text).collect::<Vec<_>>();
            (!parts.is_empty()).then(|| parts.join(","))
        }
        other => Some(other.to_string()),
    }
}

fn named_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    match value {
        JsonValue::Object(object) => keys
            .iter()
            .find_map(|key| object.get(*key).and_then(json_text)),
        other => json_text(other),
    }
}

/// Maps data.json (Project Open Data schema) entries onto catalog records.
///
/// Only the commonly consumed attributes are translated; uninterpreted keys
/// survive in the tracking link's content snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataJsonAdapter;

impl DataJsonAdapter {
    const EXTRA_KEYS: [(&'static str, &'static str); 8] = [
        ("accessLevel", "access_level"),
        ("modified", "modified"),
        ("issued", "issued"),
        ("temporal", "temporal"),
        ("spatial", "spatial"),
        ("bureauCode", "bureau_code"),
        ("programCode", "program_code"),
        ("license", "license"),
    ];
}

impl SourceAdapter for DataJsonAdapter {
    fn kind(&self) -> &'static str {
        "datajson"
    }

    fn parse_document(&self, bytes: &[u8]) -> Result<Vec<RemoteEntry>, ParseError> {
        parse_catalog_document(bytes)
    }

    fn map_entry(&self, _ctx: &AdapterContext, entry: &RemoteEntry) -> Result<RecordFields, MappingError> {
        let title = entry
            .title_text()
            .ok_or_else(|| MappingError::MissingTitle {
                identifier: entry.identifier.clone(),
            })?
            .to_string();

        let mut fields = RecordFields {
            title,
            notes: entry
                .description
                .as_deref()
                .map(strip_markup)
                .filter(|notes| !notes.is_empty()),
            ..Default::default()
        };

        for (remote_key, extra_key) in Self::EXTRA_KEYS {
            if let Some(value) = entry.metadata.get(remote_key).and_then(json_text) {
                fields.extras.insert(extra_key.to_string(), value);
            }
        }
        if let Some(publisher) = entry
            .metadata
            .get("publisher")
            .and_then(|value| named_text(value, &["name"]))
        {
            fields.extras.insert("publisher".into(), publisher);
        }

        if let Some(keywords) = entry.metadata.get("keyword").and_then(JsonValue::as_array) {
            let tags = keywords
                .iter()
                .filter_map(json_text)
                .map(|keyword| json!({ "name": keyword }))
                .collect::<Vec<_>>();
            if !tags.is_empty() {
                fields.attributes.insert("tags".into(), JsonValue::Array(tags));
            }
        }
        if let Some(landing_page) = entry.metadata.get("landingPage").and_then(json_text) {
            fields.attributes.insert("url".into(), json!(landing_page));
        }
        if let Some(contact) = entry
            .metadata
            .get("contactPoint")
            .and_then(|value| named_text(value, &["fn", "name"]))
        {
            fields.attributes.insert("maintainer".into(), json!(contact));
        }
        let mbox = entry.metadata.get("mbox").and_then(json_text).or_else(|| {
            entry
                .metadata
                .get("contactPoint")
                .and_then(|value| value.get("hasEmail"))
                .and_then(json_text)
        });
        if let Some(mbox) = mbox {
            let email = mbox.trim_start_matches("mailto:").to_string();
            fields.attributes.insert("maintainer_email".into(), json!(email));
        }

        for (index, dist) in entry.distribution.iter().enumerate() {
            let url = dist
                .effective_url()
                .ok_or_else(|| MappingError::DistributionWithoutUrl {
                    identifier: entry.identifier.clone(),
                    index,
                })?;
            fields.resources.push(ResourceDraft {
                resource_id: None,
                url: url.to_string(),
                name: dist.title.clone(),
                format: dist.format.clone().or_else(|| dist.media_type.clone()),
            });
        }

        Ok(fields)
    }
}

pub fn adapter_for_kind(kind: &str) -> Option<Box<dyn SourceAdapter>> {
    match kind {
        "datajson" => Some(Box::new(DataJsonAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext {
            source_id: "agency".into(),
            source_url: "https://agency.example.gov/data.json".into(),
        }
    }

    #[test]
    fn parses_plain_list_in_document_order() {
        let entries = parse_catalog_document(
            br#"[{"identifier":"b","title":"B"},{"identifier":"a","title":"A"}]"#,
        )
        .expect("parse");
        let ids = entries.iter().map(|e| e.identifier.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn parses_v11_envelope() {
        let entries = parse_catalog_document(
            br#"{"conformsTo":"https://project-open-data.cio.gov/v1.1/schema","dataset":[{"identifier":"x","title":"X"}]}"#,
        )
        .expect("parse");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn empty_list_is_not_an_error() {
        assert!(parse_catalog_document(b"[]").expect("parse").is_empty());
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(matches!(
            parse_catalog_document(b"<html>oops</html>"),
            Err(ParseError::NotJson(_))
        ));
        assert!(matches!(
            parse_catalog_document(br#"{"datasets": []}"#),
            Err(ParseError::NotAList)
        ));
        assert!(matches!(
            parse_catalog_document(br#"[{"identifier":"a"},{"title":"no id"}]"#),
            Err(ParseError::InvalidEntry { index: 1, .. })
        ));
        assert!(matches!(
            parse_catalog_document(br#"[{"identifier":42}]"#),
            Err(ParseError::InvalidEntry { index: 0, .. })
        ));
    }

    #[test]
    fn duplicate_identifiers_are_left_for_reconciliation() {
        let entries = parse_catalog_document(
            br#"[{"identifier":"a","title":"One"},{"identifier":"a","title":"Two"}]"#,
        )
        .expect("parse");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn maps_core_fields_resources_and_tags() {
        let entry: RemoteEntry = serde_json::from_value(json!({
            "identifier": "wq-1",
            "title": "  Water Quality  ",
            "description": "<p>Monthly <b>samples</b></p>",
            "keyword": ["water", ""],
            "publisher": {"name": "Dept. of Water"},
            "contactPoint": {"fn": "Jordan Doe", "hasEmail": "mailto:jdoe@example.gov"},
            "modified": "2026-09-01",
            "distribution": [
                {"downloadURL": "https://example.gov/wq.csv", "mediaType": "text/csv"},
                {"accessURL": "https://example.gov/api", "title": "API", "format": "API"}
            ]
        }))
        .expect("entry");

        let fields = DataJsonAdapter.map_entry(&ctx(), &entry).expect("map");
        assert_eq!(fields.title, "Water Quality");
        assert_eq!(fields.notes.as_deref(), Some("Monthly samples"));
        assert_eq!(fields.extras.get("publisher").map(String::as_str), Some("Dept. of Water"));
        assert_eq!(fields.extras.get("modified").map(String::as_str), Some("2026-09-01"));
        assert_eq!(fields.attributes["tags"], json!([{"name": "water"}]));
        assert_eq!(fields.attributes["maintainer_email"], json!("jdoe@example.gov"));
        assert_eq!(fields.resources.len(), 2);
        assert_eq!(fields.resources[0].format.as_deref(), Some("text/csv"));
        assert_eq!(fields.resources[1].url, "https://example.gov/api");
        assert!(fields.resources.iter().all(|r| r.resource_id.is_none()));
    }

    #[test]
    fn untitled_entries_and_url_less_distributions_fail_mapping() {
        let untitled = RemoteEntry {
            title: Some("   ".into()),
            ..RemoteEntry::new("u-1", "")
        };
        assert!(matches!(
            DataJsonAdapter.map_entry(&ctx(), &untitled),
            Err(MappingError::MissingTitle { .. })
        ));

        let mut broken = RemoteEntry::new("b-1", "Broken");
        broken.distribution.push(Default::default());
        assert!(matches!(
            DataJsonAdapter.map_entry(&ctx(), &broken),
            Err(MappingError::DistributionWithoutUrl { index: 0, .. })
        ));
    }

    #[test]
    fn names_are_url_safe_and_bounded() {
        assert_eq!(munge_title_to_name("Foo"), "foo");
        assert_eq!(munge_title_to_name("Foo  Updated"), "foo-updated");
        assert_eq!(munge_title_to_name("FY2020: Budget / Spending (Final)"), "fy2020-budget-spending-final");
        assert_eq!(munge_title_to_name("__x__"), "dataset-x");
        assert_eq!(munge_title_to_name("¿?"), "dataset");
        assert_eq!(munge_title_to_name("Café Data"), "cafe-data");
        assert_eq!(munge_title_to_name("Índice de Señales Über"), "indice-de-senales-uber");
        assert!(munge_title_to_name(&"long title ".repeat(30)).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn disambiguated_names_keep_the_base() {
        let name = disambiguate_name("foo");
        assert!(name.starts_with("foo-"));
        assert_eq!(name.len(), "foo-".len() + 5);
        assert_ne!(name, disambiguate_name("foo"));
    }

    #[test]
    fn adapter_lookup_by_kind() {
        assert_eq!(adapter_for_kind("datajson").map(|a| a.kind()), Some("datajson"));
        assert!(adapter_for_kind("csw").is_none());
    }
}
