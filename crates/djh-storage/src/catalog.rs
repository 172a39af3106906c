//! The host catalog's record store, as consumed by the harvester.

use std::collections::BTreeMap;

use async_trait::async_trait;
use djh_core::{LocalRecord, RecordDraft, Resource};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("catalog backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Record storage and search offered by the host catalog.
///
/// Every write is atomic per record: a failed create or update leaves nothing
/// behind and the previous state intact.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_record(&self, record_id: &str) -> Result<LocalRecord, StoreError>;

    async fn find_record_by_name(&self, name: &str) -> Result<Option<LocalRecord>, StoreError>;

    /// Fails with `Conflict` when the id or the name is already taken.
    async fn create_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError>;

    /// Replaces the stored record wholesale. Resources without an id get a fresh one.
    async fn update_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError>;

    async fn query_records_by_annotation(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<LocalRecord>, StoreError>;

    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError>;
}

/// Process-local catalog, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    records: RwLock<BTreeMap<String, LocalRecord>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all_records(&self) -> Vec<LocalRecord> {
        self.records.read().await.values().cloned().collect()
    }

    fn materialize(draft: RecordDraft) -> LocalRecord {
        LocalRecord {
            record_id: draft.record_id,
            name: draft.name,
            title: draft.title,
            notes: draft.notes,
            state: draft.state,
            extras: draft.extras,
            resources: draft
                .resources
                .into_iter()
                .map(|res| Resource {
                    resource_id: res
                        .resource_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    url: res.url,
                    name: res.name,
                    format: res.format,
                })
                .collect(),
            attributes: draft.attributes,
        }
    }

    fn name_taken(
        records: &BTreeMap<String, LocalRecord>,
        name: &str,
        record_id: &str,
    ) -> bool {
        records
            .values()
            .any(|rec| rec.name == name && rec.record_id != record_id)
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn find_record(&self, record_id: &str) -> Result<LocalRecord, StoreError> {
        self.records
            .read()
            .await
            .get(record_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))
    }

    async fn find_record_by_name(&self, name: &str) -> Result<Option<LocalRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|rec| rec.name == name)
            .cloned())
    }

    async fn create_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&draft.record_id) {
            return Err(StoreError::Conflict(format!(
                "record id {} already exists",
                draft.record_id
            )));
        }
        if Self::name_taken(&records, &draft.name, &draft.record_id) {
            return Err(StoreError::Conflict(format!(
                "record name {} already exists",
                draft.name
            )));
        }
        let record = Self::materialize(draft);
        records.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
        let mut records = self.records.write().await;
        if !records.contains_key(&draft.record_id) {
            return Err(StoreError::NotFound(draft.record_id));
        }
        if Self::name_taken(&records, &draft.name, &draft.record_id) {
            return Err(StoreError::Conflict(format!(
                "record name {} already exists",
                draft.name
            )));
        }
        let record = Self::materialize(draft);
        records.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    async fn query_records_by_annotation(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|rec| rec.annotation(key) == Some(value))
            .cloned()
            .collect())
    }

    async fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(record_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use djh_core::{RecordFields, ResourceDraft, SOURCE_URL_KEY};

    fn draft(record_id: &str, name: &str) -> RecordDraft {
        let mut fields = RecordFields {
            title: name.to_uppercase(),
            ..Default::default()
        };
        fields
            .extras
            .insert(SOURCE_URL_KEY.to_string(), "https://example.org/data.json".into());
        fields.resources.push(ResourceDraft {
            resource_id: None,
            url: "https://example.org/a.csv".into(),
            name: None,
            format: Some("CSV".into()),
        });
        RecordDraft::from_fields(record_id, name, fields)
    }

    #[tokio::test]
    async fn create_assigns_resource_ids_and_rejects_taken_names() {
        let store = InMemoryCatalogStore::new();
        let created = store.create_record(draft("r1", "water")).await.expect("create");
        assert_eq!(created.resources.len(), 1);
        assert!(!created.resources[0].resource_id.is_empty());

        let err = store
            .create_record(draft("r2", "water"))
            .await
            .expect_err("name conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn update_requires_existing_record_and_keeps_given_resource_ids() {
        let store = InMemoryCatalogStore::new();
        let err = store.update_record(draft("missing", "x")).await.expect_err("missing");
        assert!(err.is_not_found());

        let created = store.create_record(draft("r1", "water")).await.expect("create");
        let mut next = RecordDraft::from(&created);
        next.title = "Water v2".into();
        let updated = store.update_record(next).await.expect("update");
        assert_eq!(updated.resources, created.resources);
        assert_eq!(updated.title, "Water v2");
    }

    #[tokio::test]
    async fn annotation_query_and_delete() {
        let store = InMemoryCatalogStore::new();
        store.create_record(draft("r1", "water")).await.expect("create");
        store.create_record(draft("r2", "air")).await.expect("create");

        let hits = store
            .query_records_by_annotation(SOURCE_URL_KEY, "https://example.org/data.json")
            .await
            .expect("query");
        assert_eq!(hits.len(), 2);

        store.delete_record("r1").await.expect("delete");
        assert!(store.find_record("r1").await.expect_err("gone").is_not_found());
        assert!(store.delete_record("r1").await.is_err());
    }
}
