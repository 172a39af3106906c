//! Durable harvest state: jobs, their persisted plans and the tracking links
//! that tie remote identifiers to catalog records.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use djh_core::{HarvestJob, JobStatus, RemoteEntry, TrackingLink, WorkItem, WorkItemState};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("harvest job {0} not found")]
    JobNotFound(Uuid),
    #[error("work item {0} not found")]
    ItemNotFound(Uuid),
    #[error("ledger backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait HarvestLedger: Send + Sync {
    async fn current_links(&self, source_id: &str) -> Result<Vec<TrackingLink>, LedgerError>;

    /// Persists a job together with its full plan, before any import runs.
    async fn save_plan(&self, job: &HarvestJob, items: &[WorkItem]) -> Result<(), LedgerError>;

    async fn load_job(&self, job_id: Uuid) -> Result<HarvestJob, LedgerError>;

    /// Items of a job still in `Pending`, in document order.
    async fn pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, LedgerError>;

    async fn complete_item(
        &self,
        item_id: Uuid,
        state: WorkItemState,
        error: Option<String>,
    ) -> Result<(), LedgerError>;

    /// Marks every other link of `link.record_id` not current, then stores
    /// `link` as the current one. Storing the same `link_id` again only
    /// refreshes it.
    async fn record_link(&self, link: &TrackingLink) -> Result<(), LedgerError>;

    /// Marks every link of a record not current.
    async fn release_record(&self, record_id: &str) -> Result<(), LedgerError>;

    async fn links_for_record(&self, record_id: &str) -> Result<Vec<TrackingLink>, LedgerError>;

    /// Inserts or updates the job row (status, finish time, error).
    async fn finish_job(&self, job: &HarvestJob) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, HarvestJob>,
    items: Vec<WorkItem>,
    links: Vec<TrackingLink>,
}

/// Process-local ledger, used by tests and one-off runs without a database.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_items(&self, job_id: Uuid) -> Vec<WorkItem> {
        let state = self.state.lock().await;
        state
            .items
            .iter()
            .filter(|item| item.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HarvestLedger for MemoryLedger {
    async fn current_links(&self, source_id: &str) -> Result<Vec<TrackingLink>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|link| link.current && link.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn save_plan(&self, job: &HarvestJob, items: &[WorkItem]) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.job_id, job.clone());
        state.items.extend(items.iter().cloned());
        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<HarvestJob, LedgerError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(LedgerError::JobNotFound(job_id))
    }

    async fn pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, LedgerError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(LedgerError::JobNotFound(job_id));
        }
        Ok(state
            .items
            .iter()
            .filter(|item| item.job_id == job_id && item.state == WorkItemState::Pending)
            .cloned()
            .collect())
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        state: WorkItemState,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let mut guard = self.state.lock().await;
        let item = guard
            .items
            .iter_mut()
            .find(|item| item.item_id == item_id)
            .ok_or(LedgerError::ItemNotFound(item_id))?;
        item.state = state;
        item.error = error;
        Ok(())
    }

    async fn record_link(&self, link: &TrackingLink) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        for other in state
            .links
            .iter_mut()
            .filter(|other| other.record_id == link.record_id && other.link_id != link.link_id)
        {
            other.current = false;
        }
        let mut current = link.clone();
        current.current = true;
        match state.links.iter_mut().find(|other| other.link_id == link.link_id) {
            Some(existing) => *existing = current,
            None => state.links.push(current),
        }
        Ok(())
    }

    async fn release_record(&self, record_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        for link in state.links.iter_mut().filter(|link| link.record_id == record_id) {
            link.current = false;
        }
        Ok(())
    }

    async fn links_for_record(&self, record_id: &str) -> Result<Vec<TrackingLink>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|link| link.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn finish_job(&self, job: &HarvestJob) -> Result<(), LedgerError> {
        self.state.lock().await.jobs.insert(job.job_id, job.clone());
        Ok(())
    }
}

/// PostgreSQL ledger. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to harvest ledger database")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying harvest ledger migrations")
    }

    fn link_from_row(row: &PgRow) -> anyhow::Result<TrackingLink> {
        Ok(TrackingLink {
            link_id: row.try_get("link_id").context("link_id")?,
            job_id: row.try_get("job_id").context("job_id")?,
            source_id: row.try_get("source_id").context("source_id")?,
            identifier: row.try_get("identifier").context("identifier")?,
            record_id: row.try_get("record_id").context("record_id")?,
            current: row.try_get("current").context("current")?,
            content_snapshot: row.try_get("content_snapshot").context("content_snapshot")?,
            recorded_at: row.try_get("recorded_at").context("recorded_at")?,
        })
    }

    fn item_from_row(row: &PgRow) -> anyhow::Result<WorkItem> {
        let state: String = row.try_get("state").context("state")?;
        let entry: Json<RemoteEntry> = row.try_get("entry").context("entry")?;
        Ok(WorkItem {
            item_id: row.try_get("item_id").context("item_id")?,
            job_id: row.try_get("job_id").context("job_id")?,
            record_id: row.try_get("record_id").context("record_id")?,
            entry: entry.0,
            state: state.parse().context("work item state")?,
            error: row.try_get("error").context("error")?,
        })
    }

    fn job_from_row(row: &PgRow) -> anyhow::Result<HarvestJob> {
        let status: String = row.try_get("status").context("status")?;
        let retirements: Json<Vec<String>> = row.try_get("retirements").context("retirements")?;
        Ok(HarvestJob {
            job_id: row.try_get("job_id").context("job_id")?,
            source_id: row.try_get("source_id").context("source_id")?,
            source_url: row.try_get("source_url").context("source_url")?,
            started_at: row.try_get("started_at").context("started_at")?,
            finished_at: row.try_get("finished_at").context("finished_at")?,
            status: status.parse::<JobStatus>().context("job status")?,
            retirements: retirements.0,
            error: row.try_get("error").context("error")?,
        })
    }
}

const UPSERT_JOB: &str = r#"
INSERT INTO harvest_jobs
  (job_id, source_id, source_url, started_at, finished_at, status, retirements, error)
VALUES
  ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (job_id) DO UPDATE
  SET finished_at = EXCLUDED.finished_at,
      status = EXCLUDED.status,
      retirements = EXCLUDED.retirements,
      error = EXCLUDED.error
"#;

#[async_trait]
impl HarvestLedger for PgLedger {
    async fn current_links(&self, source_id: &str) -> Result<Vec<TrackingLink>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM tracking_links WHERE source_id = $1 AND current ORDER BY recorded_at",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .context("selecting current tracking links")?;
        Ok(rows
            .iter()
            .map(Self::link_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn save_plan(&self, job: &HarvestJob, items: &[WorkItem]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.context("opening plan transaction")?;
        sqlx::query(UPSERT_JOB)
            .bind(job.job_id)
            .bind(&job.source_id)
            .bind(&job.source_url)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.status.as_str())
            .bind(Json(&job.retirements))
            .bind(&job.error)
            .execute(&mut *tx)
            .await
            .context("inserting harvest job")?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
INSERT INTO harvest_work_items
  (item_id, job_id, position, record_id, identifier, entry, state, error)
VALUES
  ($1, $2, $3, $4, $5, $6, $7, $8)
"#,
            )
            .bind(item.item_id)
            .bind(item.job_id)
            .bind(position as i32)
            .bind(&item.record_id)
            .bind(&item.entry.identifier)
            .bind(Json(&item.entry))
            .bind(item.state.as_str())
            .bind(&item.error)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting work item for {}", item.entry.identifier))?;
        }

        tx.commit().await.context("committing plan")?;
        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<HarvestJob, LedgerError> {
        let row = sqlx::query("SELECT * FROM harvest_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("selecting harvest job")?
            .ok_or(LedgerError::JobNotFound(job_id))?;
        Ok(Self::job_from_row(&row)?)
    }

    async fn pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, LedgerError> {
        self.load_job(job_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM harvest_work_items WHERE job_id = $1 AND state = $2 ORDER BY position",
        )
        .bind(job_id)
        .bind(WorkItemState::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .context("selecting pending work items")?;
        Ok(rows
            .iter()
            .map(Self::item_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        state: WorkItemState,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE harvest_work_items SET state = $2, error = $3 WHERE item_id = $1")
            .bind(item_id)
            .bind(state.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .context("updating work item")?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn record_link(&self, link: &TrackingLink) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.context("opening link transaction")?;
        sqlx::query("UPDATE tracking_links SET current = FALSE WHERE record_id = $1 AND link_id <> $2 AND current")
            .bind(&link.record_id)
            .bind(link.link_id)
            .execute(&mut *tx)
            .await
            .context("superseding tracking links")?;
        sqlx::query(
            r#"
INSERT INTO tracking_links
  (link_id, job_id, source_id, identifier, record_id, current, content_snapshot, recorded_at)
VALUES
  ($1, $2, $3, $4, $5, TRUE, $6, $7)
ON CONFLICT (link_id) DO UPDATE
  SET current = TRUE,
      content_snapshot = EXCLUDED.content_snapshot,
      recorded_at = EXCLUDED.recorded_at
"#,
        )
        .bind(link.link_id)
        .bind(link.job_id)
        .bind(&link.source_id)
        .bind(&link.identifier)
        .bind(&link.record_id)
        .bind(&link.content_snapshot)
        .bind(link.recorded_at)
        .execute(&mut *tx)
        .await
        .context("recording tracking link")?;
        tx.commit().await.context("committing tracking link")?;
        Ok(())
    }

    async fn release_record(&self, record_id: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE tracking_links SET current = FALSE WHERE record_id = $1 AND current")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .context("releasing tracking links")?;
        Ok(())
    }

    async fn links_for_record(&self, record_id: &str) -> Result<Vec<TrackingLink>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM tracking_links WHERE record_id = $1 ORDER BY recorded_at")
            .bind(record_id)
            .fetch_all(&self.pool)
            .await
            .context("selecting tracking links for record")?;
        Ok(rows
            .iter()
            .map(Self::link_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn finish_job(&self, job: &HarvestJob) -> Result<(), LedgerError> {
        let finished_at = job.finished_at.unwrap_or_else(Utc::now);
        sqlx::query(UPSERT_JOB)
            .bind(job.job_id)
            .bind(&job.source_id)
            .bind(&job.source_url)
            .bind(job.started_at)
            .bind(finished_at)
            .bind(job.status.as_str())
            .bind(Json(&job.retirements))
            .bind(&job.error)
            .execute(&self.pool)
            .await
            .context("finishing harvest job")?;
        Ok(())
    }
}
