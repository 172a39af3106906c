//! Matches the entries of a fetched document against what earlier jobs
//! imported from the same source.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use djh_core::{RemoteEntry, WorkItem, SOURCE_URL_KEY};
use djh_storage::{CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ledger::{HarvestLedger, LedgerError};

/// How record ids are minted for identifiers seen for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordIdStrategy {
    #[default]
    Random,
    /// uuid v5 of `<source_url>#<identifier>`.
    Derived,
}

impl RecordIdStrategy {
    pub fn mint(&self, source_url: &str, identifier: &str) -> String {
        match self {
            Self::Random => Uuid::new_v4().simple().to_string(),
            Self::Derived => Uuid::new_v5(
                &Uuid::NAMESPACE_URL,
                format!("{source_url}#{identifier}").as_bytes(),
            )
            .simple()
            .to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("looking up record {record_id} (identifier {identifier}): {source}")]
    RecordLookup {
        record_id: String,
        identifier: String,
        #[source]
        source: StoreError,
    },
    #[error("scanning catalog for records of {source_url}: {source}")]
    CatalogScan {
        source_url: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Remote identifier to the record id it was imported as.
pub type PriorImports = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// One item per distinct identifier, in document order.
    pub items: Vec<WorkItem>,
    /// Record ids whose identifier is gone from the document, each once.
    pub retirements: Vec<String>,
}

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    ledger: Arc<dyn HarvestLedger>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>, ledger: Arc<dyn HarvestLedger>) -> Self {
        Self { store, ledger }
    }

    /// Builds the identifier to record id mapping from the source's current
    /// tracking links. Links pointing at records that no longer exist are
    /// dropped. With `rescan`, records annotated with `source_url` fill in
    /// identifiers the links do not cover.
    #[tracing::instrument(skip(self))]
    pub async fn prior_imports(
        &self,
        source_id: &str,
        source_url: &str,
        rescan: bool,
    ) -> Result<PriorImports, ReconcileError> {
        let mut prior = PriorImports::new();
        let mut mapped = BTreeSet::new();

        for link in self.ledger.current_links(source_id).await? {
            match self.store.find_record(&link.record_id).await {
                Ok(record) => {
                    if record.source_identifier().is_none() {
                        warn!(
                            record_id = %record.record_id,
                            identifier = %link.identifier,
                            "tracked record has no source identifier annotation; ignoring"
                        );
                        continue;
                    }
                    if mapped.contains(&record.record_id) || prior.contains_key(&link.identifier) {
                        continue;
                    }
                    mapped.insert(record.record_id.clone());
                    prior.insert(link.identifier, record.record_id);
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(
                        record_id = %link.record_id,
                        identifier = %link.identifier,
                        "tracked record is gone; dropping association"
                    );
                }
                Err(source) => {
                    return Err(ReconcileError::RecordLookup {
                        record_id: link.record_id,
                        identifier: link.identifier,
                        source,
                    })
                }
            }
        }

        if rescan {
            let records = self
                .store
                .query_records_by_annotation(SOURCE_URL_KEY, source_url)
                .await
                .map_err(|source| ReconcileError::CatalogScan {
                    source_url: source_url.to_string(),
                    source,
                })?;
            for record in records {
                let Some(identifier) = record.source_identifier() else {
                    warn!(record_id = %record.record_id, "catalog record has no source identifier annotation; ignoring");
                    continue;
                };
                if mapped.contains(&record.record_id) || prior.contains_key(identifier) {
                    continue;
                }
                debug!(record_id = %record.record_id, identifier, "recovered association from catalog");
                mapped.insert(record.record_id.clone());
                prior.insert(identifier.to_string(), record.record_id.clone());
            }
        }

        Ok(prior)
    }
}

/// Pairs every entry with a record id and lists the prior imports that
/// disappeared. Pure: no catalog or network access.
pub fn plan(
    job_id: Uuid,
    source_url: &str,
    entries: Vec<RemoteEntry>,
    prior: &PriorImports,
    ids: RecordIdStrategy,
) -> Plan {
    let mut items: Vec<WorkItem> = Vec::with_capacity(entries.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut seen = BTreeSet::new();

    for entry in entries {
        if let Some(&position) = positions.get(&entry.identifier) {
            warn!(identifier = %entry.identifier, "identifier repeated in document; later entry wins");
            items[position].entry = entry;
            continue;
        }
        let record_id = prior
            .get(&entry.identifier)
            .cloned()
            .unwrap_or_else(|| ids.mint(source_url, &entry.identifier));
        seen.insert(record_id.clone());
        positions.insert(entry.identifier.clone(), items.len());
        items.push(WorkItem::pending(job_id, record_id, entry));
    }

    let retirements = prior
        .values()
        .filter(|record_id| !seen.contains(*record_id))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Plan { items, retirements }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use djh_core::{LocalRecord, RecordDraft, RecordFields, TrackingLink, SOURCE_IDENTIFIER_KEY};
    use djh_storage::InMemoryCatalogStore;
    use serde_json::json;

    use crate::ledger::MemoryLedger;

    const URL: &str = "https://agency.example.gov/data.json";

    fn entries(ids: &[(&str, &str)]) -> Vec<RemoteEntry> {
        ids.iter().map(|(id, title)| RemoteEntry::new(*id, *title)).collect()
    }

    fn prior(pairs: &[(&str, &str)]) -> PriorImports {
        pairs
            .iter()
            .map(|(id, record)| (id.to_string(), record.to_string()))
            .collect()
    }

    #[test]
    fn fresh_source_plans_every_entry_and_retires_nothing() {
        let plan = plan(
            Uuid::new_v4(),
            URL,
            entries(&[("a", "A"), ("b", "B"), ("c", "C")]),
            &PriorImports::new(),
            RecordIdStrategy::Random,
        );
        assert_eq!(plan.items.len(), 3);
        assert!(plan.retirements.is_empty());
        let distinct = plan.items.iter().map(|i| &i.record_id).collect::<BTreeSet<_>>();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn known_identifiers_keep_their_record_ids() {
        let known = prior(&[("a", "rec-a"), ("b", "rec-b")]);
        let plan = plan(Uuid::new_v4(), URL, entries(&[("b", "B"), ("a", "A")]), &known, RecordIdStrategy::Random);
        let ids = plan.items.iter().map(|i| i.record_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["rec-b", "rec-a"]);
    }

    #[test]
    fn vanished_identifier_is_retired_once() {
        let known = prior(&[("a", "rec-a"), ("gone", "rec-gone")]);
        let plan = plan(Uuid::new_v4(), URL, entries(&[("a", "A")]), &known, RecordIdStrategy::Random);
        assert_eq!(plan.retirements, vec!["rec-gone".to_string()]);
    }

    #[test]
    fn repeated_identifier_keeps_first_slot_with_last_content() {
        let plan = plan(
            Uuid::new_v4(),
            URL,
            entries(&[("a", "First"), ("b", "B"), ("a", "Second")]),
            &PriorImports::new(),
            RecordIdStrategy::Random,
        );
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.items[0].entry.identifier, "a");
        assert_eq!(plan.items[0].entry.title.as_deref(), Some("Second"));
    }

    #[test]
    fn derived_ids_are_deterministic_per_source() {
        let first = RecordIdStrategy::Derived.mint(URL, "a");
        assert_eq!(first, RecordIdStrategy::Derived.mint(URL, "a"));
        assert_ne!(first, RecordIdStrategy::Derived.mint("https://other.example.gov/data.json", "a"));
        assert_ne!(RecordIdStrategy::Random.mint(URL, "a"), RecordIdStrategy::Random.mint(URL, "a"));
    }

    fn tracked_record(record_id: &str, identifier: Option<&str>) -> RecordDraft {
        let mut fields = RecordFields {
            title: record_id.to_uppercase(),
            ..Default::default()
        };
        fields.extras.insert(SOURCE_URL_KEY.into(), URL.into());
        if let Some(identifier) = identifier {
            fields.extras.insert(SOURCE_IDENTIFIER_KEY.into(), identifier.into());
        }
        RecordDraft::from_fields(record_id, record_id, fields)
    }

    fn link(identifier: &str, record_id: &str) -> TrackingLink {
        TrackingLink {
            link_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            source_id: "agency".into(),
            identifier: identifier.into(),
            record_id: record_id.into(),
            current: true,
            content_snapshot: json!({"identifier": identifier}),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn broken_and_unannotated_links_are_dropped() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        store.create_record(tracked_record("rec-a", Some("a"))).await.expect("a");
        store.create_record(tracked_record("rec-b", None)).await.expect("b");
        for (identifier, record_id) in [("a", "rec-a"), ("b", "rec-b"), ("c", "rec-missing")] {
            ledger.record_link(&link(identifier, record_id)).await.expect("link");
        }

        let reconciler = Reconciler::new(store, ledger);
        let prior = reconciler.prior_imports("agency", URL, false).await.expect("prior");
        assert_eq!(prior, super::tests::prior(&[("a", "rec-a")]));
    }

    #[tokio::test]
    async fn rescan_recovers_untracked_records_without_overriding_links() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        store.create_record(tracked_record("rec-a", Some("a"))).await.expect("a");
        store.create_record(tracked_record("rec-a2", Some("a"))).await.expect("a2");
        store.create_record(tracked_record("rec-b", Some("b"))).await.expect("b");
        ledger.record_link(&link("a", "rec-a")).await.expect("link");

        let reconciler = Reconciler::new(store, ledger);
        let without = reconciler.prior_imports("agency", URL, false).await.expect("prior");
        assert_eq!(without.len(), 1);

        let with = reconciler.prior_imports("agency", URL, true).await.expect("prior");
        assert_eq!(with, super::tests::prior(&[("a", "rec-a"), ("b", "rec-b")]));
    }

    struct BrokenStore;

    #[async_trait]
    impl CatalogStore for BrokenStore {
        async fn find_record(&self, _record_id: &str) -> Result<LocalRecord, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("catalog unavailable")))
        }

        async fn find_record_by_name(&self, _name: &str) -> Result<Option<LocalRecord>, StoreError> {
            Ok(None)
        }

        async fn create_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
            Err(StoreError::Conflict(draft.record_id))
        }

        async fn update_record(&self, draft: RecordDraft) -> Result<LocalRecord, StoreError> {
            Err(StoreError::NotFound(draft.record_id))
        }

        async fn query_records_by_annotation(
            &self,
            _key: &str,
            _value: &str,
        ) -> Result<Vec<LocalRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn delete_record(&self, record_id: &str) -> Result<(), StoreError> {
            Err(StoreError::NotFound(record_id.to_string()))
        }
    }

    #[tokio::test]
    async fn store_failures_other_than_not_found_are_fatal() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.record_link(&link("a", "rec-a")).await.expect("link");
        let reconciler = Reconciler::new(Arc::new(BrokenStore), ledger);

        let err = reconciler
            .prior_imports("agency", URL, false)
            .await
            .expect_err("fatal");
        assert!(matches!(err, ReconcileError::RecordLookup { .. }));
    }
}
