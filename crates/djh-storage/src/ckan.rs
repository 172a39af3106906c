//! `CatalogStore` backed by a CKAN instance's action API.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use djh_core::{LocalRecord, RecordDraft, RecordState, Resource};
use reqwest::StatusCode;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::catalog::{CatalogStore, StoreError};

const SEARCH_PAGE_SIZE: usize = 500;

/// Package keys the harvester models explicitly; everything else is carried
/// through `LocalRecord::attributes`.
const MODELED_KEYS: [&str; 7] = ["id", "name", "title", "notes", "private", "extras", "resources"];

#[derive(Debug, Clone)]
pub struct CkanCatalogStore {
    client: reqwest::Client,
    base_url: String,
}

impl CkanCatalogStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building CKAN client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{action}", self.base_url)
    }

    async fn get_action(&self, action: &str, query: &[(&str, String)]) -> Result<JsonValue, StoreError> {
        let resp = self
            .client
            .get(self.action_url(action))
            .query(query)
            .send()
            .await
            .with_context(|| format!("calling CKAN {action}"))?;
        Self::unwrap_result(action, resp).await
    }

    async fn post_action(&self, action: &str, payload: &JsonValue) -> Result<JsonValue, StoreError> {
        let resp = self
            .client
            .post(self.action_url(action))
            .json(payload)
            .send()
            .await
            .with_context(|| format!("calling CKAN {action}"))?;
        Self::unwrap_result(action, resp).await
    }

    async fn unwrap_result(action: &str, resp: reqwest::Response) -> Result<JsonValue, StoreError> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("reading CKAN {action} response ({status})"))?;
        // Proxies answer errors with HTML; those still classify by status.
        let body: JsonValue = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);

        if status.is_success() && body.get("success") == Some(&JsonValue::Bool(true)) {
            return Ok(body.get("result").cloned().unwrap_or(JsonValue::Null));
        }

        let message = body
            .get("error")
            .map(JsonValue::to_string)
            .unwrap_or_else(|| status.to_string());
        debug!(action, %status, %message, "CKAN action failed");
        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(message),
            StatusCode::CONFLICT => StoreError::Conflict(message),
            _ => StoreError::Backend(anyhow!("CKAN {action} failed with {status}: {message}")),
        })
    }
}

/// Decodes a CKAN package dictionary.
pub fn package_to_record(package: &JsonValue) -> Result<LocalRecord, StoreError> {
    let object = package
        .as_object()
        .ok_or_else(|| StoreError::Backend(anyhow!("CKAN package is not an object")))?;
    let text = |key: &str| object.get(key).and_then(JsonValue::as_str).map(str::to_string);

    let record_id = text("id").ok_or_else(|| StoreError::Backend(anyhow!("CKAN package without id")))?;
    let extras = object
        .get("extras")
        .and_then(JsonValue::as_array)
        .map(|extras| {
            extras
                .iter()
                .filter_map(|extra| {
                    let key = extra.get("key")?.as_str()?;
                    let value = match extra.get("value")? {
                        JsonValue::String(value) => value.clone(),
                        other => other.to_string(),
                    };
                    Some((key.to_string(), value))
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    let resources: Vec<Resource> = object
        .get("resources")
        .and_then(JsonValue::as_array)
        .map(|resources| {
            resources
                .iter()
                .filter_map(|res| {
                    Some(Resource {
                        resource_id: res.get("id")?.as_str()?.to_string(),
                        url: res.get("url").and_then(JsonValue::as_str).unwrap_or_default().to_string(),
                        name: res.get("name").and_then(JsonValue::as_str).map(str::to_string),
                        format: res.get("format").and_then(JsonValue::as_str).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let state = if object.get("private").and_then(JsonValue::as_bool) == Some(true) {
        RecordState::Unpublished
    } else {
        RecordState::Active
    };
    let attributes: Map<String, JsonValue> = object
        .iter()
        .filter(|(key, _)| !MODELED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(LocalRecord {
        name: text("name").unwrap_or_default(),
        title: text("title").unwrap_or_default(),
        notes: text("notes"),
        record_id,
        state,
        extras,
        resources,
        attributes,
    })
}

/// Encodes a draft as a CKAN package dictionary for `package_create`/`package_update`.
pub fn draft_to_package(draft: &RecordDraft) -> JsonValue {
    let mut package: Map<String, JsonValue> = draft.attributes.clone();
    package.insert("id".into(), json!(draft.record_id));
    package.insert("name".into(), json!(draft.name));
    package.insert("title".into(), json!(draft.title));
    package.insert("notes".into(), json!(draft.notes));
    package.insert(
        "private".into(),
        json!(draft.state == RecordState::Unpublished),
    );
    package.insert(
        "extras".into(),
        JsonValue::Array(
            draft
                .extras
                .iter()
                .map(|(key, value)| json!({"key": key, "value": value}))
                .collect(),
        ),
    );
    package.insert(
        "resources".into(),
        JsonValue::Array(
            draft
                .resources
                .iter()
                .map(|res| {
                    let mut resource = Map::new();
                    if let Some(resource_id) = &res.resource_id {
                        resource.insert("id".into(), json!(resource_id));
                    }
                    resource.insert("url".into(), json!(res.url));
                    if let Some(name) = &res.name {
                        resource.insert("name".into(), json!(name));
                    }
                    if let Some(format) = &res.format {
                        resource.insert("format".into(), json!(format));
                    }
                    JsonValue::Object(resource)
                })
                .collect(),
        ),
    );
    JsonValue::Object(package)
}

/// Start of the next `package_search` page, counted in rows the index
/// returned rather than rows kept. `None` once the result set is exhausted.
fn next_search_offset(offset: usize, fetched: usize, total: usize) -> Option<usize> {
    let next = offset + fetched;
    (fetched > 0 && next < total).then_some(next)
}

fn solr_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl CatalogStore for CkanCatalogStore {
    async fn find_record(&self, record_id: &str) -> Result<LocalRecord, StoreError> {
        let package = self
            .get_action("package_show", &[("id", record_id.to_string())])
            .await?;
        package_to_record(&package)
    }

    async fn find_record_by_name(&self, name: &str) -> Result<Option<LocalRecord>, StoreError> {
        // package_show resolves both ids and names.
        match self.get_action("package_show", &[("id", name.to_string())]).await {
            Ok(package) => {
                let record = package_to_record(&package)?;
                Ok((record.name == name).then_some(record))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
        let package = self
            .post_action("package_create", &draft_to_package(&draft))
            .await?;
        package_to_record(&package)
    }

    async fn update_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
        let package = self
            .post_action("package_update", &draft_to_package(&draft))
            .await?;
        package_to_record(&package)
    }

    async fn query_records_by_annotation(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        let fq = format!("extras_{key}:{}", solr_quote(value));
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .get_action(
                    "package_search",
                    &[
                        ("fq", fq.clone()),
                        ("rows", SEARCH_PAGE_SIZE.to_string()),
                        ("start", offset.to_string()),
                        ("include_private", "true".to_string()),
                    ],
                )
                .await?;
            let results = page
                .get("results")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            let fetched = results.len();
            for package in &results {
                let record = package_to_record(package)?;
                if record.annotation(key) == Some(value) {
                    records.push(record);
                }
            }
            let total = page.get("count").and_then(JsonValue::as_u64).unwrap_or(0) as usize;
            match next_search_offset(offset, fetched, total) {
                Some(next) => offset = next,
                None => return Ok(records),
            }
        }
    }

    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
        self.post_action("package_delete", &json!({"id": record_id}))
            .await
            .map(|_| ())
    }
}
