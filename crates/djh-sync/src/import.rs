//! Writes one planned work item into the catalog and records its tracking link.

use std::sync::Arc;

use chrono::Utc;
use djh_adapters::{disambiguate_name, munge_title_to_name, AdapterContext, MappingError, SourceAdapter};
use djh_core::{
    LocalRecord, RecordDraft, RecordFields, RecordState, Resource, ResourceDraft, TrackingLink,
    WorkItem, SOURCE_IDENTIFIER_KEY, SOURCE_URL_KEY,
};
use djh_storage::{CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{HarvestLedger, LedgerError};

/// Attempts at finding a free record name before giving up on an entry.
const NAME_ATTEMPTS: usize = 5;

/// What happens to a record whose identifier left the remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetirementPolicy {
    /// Record kept but unpublished; its link stays current.
    #[default]
    Unpublish,
    /// Record deleted; its links are released.
    Delete,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ImportContext {
    pub job_id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub retirement: RetirementPolicy,
}

impl ImportContext {
    fn adapter_context(&self) -> AdapterContext {
        AdapterContext {
            source_id: self.source_id.clone(),
            source_url: self.source_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Created,
    Updated,
}

/// The record an item landed in. Differs from the planned record id when an
/// untracked record for the same entry was adopted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Imported {
    pub record_id: String,
    pub outcome: ImportOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    Unpublished,
    /// Unpublished by an earlier job; not reported again.
    AlreadyRetired,
    Deleted,
    Ignored,
    AlreadyGone,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("catalog write for record {record_id} failed: {source}")]
    Store {
        record_id: String,
        #[source]
        source: StoreError,
    },
    #[error("no free record name derived from {name}")]
    NameUnavailable { name: String },
    #[error("serializing content snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ImportError {
    /// Skips are reported apart from failures: the entry itself cannot be
    /// imported as it stands.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::Mapping(_)
                | Self::NameUnavailable { .. }
                | Self::Store {
                    source: StoreError::Conflict(_),
                    ..
                }
        )
    }

    fn store(record_id: &str, source: StoreError) -> Self {
        Self::Store {
            record_id: record_id.to_string(),
            source,
        }
    }
}

pub struct Importer {
    store: Arc<dyn CatalogStore>,
    ledger: Arc<dyn HarvestLedger>,
    adapter: Arc<dyn SourceAdapter>,
}

impl Importer {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        ledger: Arc<dyn HarvestLedger>,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Self {
        Self {
            store,
            ledger,
            adapter,
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %ctx.job_id, record_id = %item.record_id, identifier = %item.entry.identifier)
    )]
    pub async fn import(&self, ctx: &ImportContext, item: &WorkItem) -> Result<Imported, ImportError> {
        let mut fields = self.adapter.map_entry(&ctx.adapter_context(), &item.entry)?;
        let content_snapshot = item.entry.snapshot()?;
        fields
            .extras
            .insert(SOURCE_URL_KEY.to_string(), ctx.source_url.clone());
        fields
            .extras
            .insert(SOURCE_IDENTIFIER_KEY.to_string(), item.entry.identifier.clone());

        let (record, outcome) = match self.store.find_record(&item.record_id).await {
            Ok(existing) => {
                let draft = merge_onto(&existing, fields);
                let record = self.store.update_record(draft).await.map_err(|err| {
                    warn!(error = %err, "updating record failed");
                    ImportError::store(&item.record_id, err)
                })?;
                (record, ImportOutcome::Updated)
            }
            Err(StoreError::NotFound(_)) => match self.find_untracked(ctx, item).await? {
                Some(orphan) => {
                    info!(adopted = %orphan.record_id, "adopting untracked record for this entry");
                    let draft = merge_onto(&orphan, fields);
                    let record = self
                        .store
                        .update_record(draft)
                        .await
                        .map_err(|err| ImportError::store(&orphan.record_id, err))?;
                    (record, ImportOutcome::Updated)
                }
                None => {
                    let record = self.create(&item.record_id, fields).await.map_err(|err| {
                        warn!(error = %err, "creating record failed");
                        err
                    })?;
                    (record, ImportOutcome::Created)
                }
            },
            Err(err) => return Err(ImportError::store(&item.record_id, err)),
        };

        self.ledger
            .record_link(&TrackingLink {
                link_id: item.item_id,
                job_id: item.job_id,
                source_id: ctx.source_id.clone(),
                identifier: item.entry.identifier.clone(),
                record_id: record.record_id.clone(),
                current: true,
                content_snapshot,
                recorded_at: Utc::now(),
            })
            .await?;

        info!(name = %record.name, resources = record.resources.len(), ?outcome, "imported");
        Ok(Imported {
            record_id: record.record_id,
            outcome,
        })
    }

    /// A record already annotated with this source and identifier but absent
    /// from the ledger, left behind when a job stopped between the catalog
    /// write and the link write.
    async fn find_untracked(
        &self,
        ctx: &ImportContext,
        item: &WorkItem,
    ) -> Result<Option<LocalRecord>, ImportError> {
        let candidates = self
            .store
            .query_records_by_annotation(SOURCE_IDENTIFIER_KEY, &item.entry.identifier)
            .await
            .map_err(|err| ImportError::store(&item.record_id, err))?;
        Ok(candidates
            .into_iter()
            .find(|record| record.annotation(SOURCE_URL_KEY) == Some(ctx.source_url.as_str())))
    }

    async fn create(&self, record_id: &str, fields: RecordFields) -> Result<LocalRecord, ImportError> {
        let base = munge_title_to_name(&fields.title);
        let mut candidate = base.clone();
        for _ in 0..NAME_ATTEMPTS {
            if self.name_taken(&candidate, record_id).await? {
                candidate = disambiguate_name(&base);
                continue;
            }
            let draft = RecordDraft::from_fields(record_id, candidate.clone(), fields.clone());
            let err = match self.store.create_record(draft).await {
                Ok(record) => return Ok(record),
                Err(err) => err,
            };
            // A concurrent create may have claimed the name in between.
            if matches!(err, StoreError::Conflict(_)) && self.name_taken(&candidate, record_id).await? {
                debug!(name = %candidate, "record name claimed concurrently; retrying");
                candidate = disambiguate_name(&base);
                continue;
            }
            return Err(ImportError::store(record_id, err));
        }
        Err(ImportError::NameUnavailable { name: base })
    }

    async fn name_taken(&self, name: &str, record_id: &str) -> Result<bool, ImportError> {
        let holder = self
            .store
            .find_record_by_name(name)
            .await
            .map_err(|err| ImportError::store(record_id, err))?;
        Ok(holder.is_some_and(|holder| holder.record_id != record_id))
    }

    #[tracing::instrument(skip(self, ctx), fields(job_id = %ctx.job_id, policy = ?ctx.retirement))]
    pub async fn retire(&self, ctx: &ImportContext, record_id: &str) -> Result<RetireOutcome, ImportError> {
        let outcome = match ctx.retirement {
            RetirementPolicy::Ignore => RetireOutcome::Ignored,
            RetirementPolicy::Unpublish => match self.store.find_record(record_id).await {
                Ok(record) if record.state == RecordState::Unpublished => RetireOutcome::AlreadyRetired,
                Ok(record) => {
                    let mut draft = RecordDraft::from(&record);
                    draft.state = RecordState::Unpublished;
                    self.store
                        .update_record(draft)
                        .await
                        .map_err(|err| ImportError::store(record_id, err))?;
                    RetireOutcome::Unpublished
                }
                Err(StoreError::NotFound(_)) => {
                    self.ledger.release_record(record_id).await?;
                    RetireOutcome::AlreadyGone
                }
                Err(err) => return Err(ImportError::store(record_id, err)),
            },
            RetirementPolicy::Delete => match self.store.delete_record(record_id).await {
                Ok(()) => {
                    self.ledger.release_record(record_id).await?;
                    RetireOutcome::Deleted
                }
                Err(StoreError::NotFound(_)) => {
                    self.ledger.release_record(record_id).await?;
                    RetireOutcome::AlreadyGone
                }
                Err(err) => return Err(ImportError::store(record_id, err)),
            },
        };
        info!(?outcome, "retired");
        Ok(outcome)
    }
}

/// Applies freshly mapped fields to a stored record. Mapped fields and the
/// annotation set are replaced; the name, unmapped attributes and notes the
/// mapping left unset are kept.
pub fn merge_onto(existing: &LocalRecord, fields: RecordFields) -> RecordDraft {
    let mut attributes = existing.attributes.clone();
    attributes.extend(fields.attributes);
    RecordDraft {
        record_id: existing.record_id.clone(),
        name: existing.name.clone(),
        title: fields.title,
        notes: fields.notes.or_else(|| existing.notes.clone()),
        state: RecordState::Active,
        extras: fields.extras,
        resources: carry_resource_ids(&existing.resources, fields.resources),
        attributes,
    }
}

/// Gives each new resource the id of an existing resource with the same URL.
/// An existing id is handed out at most once.
pub fn carry_resource_ids(existing: &[Resource], drafts: Vec<ResourceDraft>) -> Vec<ResourceDraft> {
    let mut unclaimed: Vec<Option<&Resource>> = existing.iter().map(Some).collect();
    drafts
        .into_iter()
        .map(|mut draft| {
            if draft.resource_id.is_none() {
                draft.resource_id = unclaimed
                    .iter_mut()
                    .find(|slot| slot.is_some_and(|res| res.url == draft.url))
                    .and_then(Option::take)
                    .map(|res| res.resource_id.clone());
            }
            draft
        })
        .collect()
}
