//! Postgres-backed record store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | any | `Database` |
//! | PoolClosed / network / other | N/A | `Database` |
//! | Column decode / unknown enum value | N/A | `Decode` |
//!
//! ## Claims
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED` inside a single
//! `UPDATE ... RETURNING`, so two dispatchers polling the same table never
//! lease the same row. `RETURNING` does not preserve the subquery order; rows
//! are re-sorted in Rust.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use rentaldesk_core::TenantId;
use rentaldesk_events::{BusinessEvent, EventId, EventMetadata, EventType, Priority};

use super::query::{EventPage, EventQuery, EventStatus, Pagination};
use super::r#trait::{
    ClaimRequest, EventRecordStore, EventUpdate, StoreCounts, StoreError, dispatch_order,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS business_events (
        id                 UUID PRIMARY KEY,
        tenant_id          UUID NOT NULL,
        event_type         TEXT NOT NULL,
        source             TEXT NOT NULL,
        source_id          TEXT,
        aggregate_id       TEXT,
        aggregate_type     TEXT,
        data               JSONB NOT NULL,
        metadata           JSONB,
        priority           SMALLINT NOT NULL,
        retry_count        INTEGER NOT NULL DEFAULT 0,
        max_retries        INTEGER NOT NULL,
        created_at         TIMESTAMPTZ NOT NULL,
        scheduled_at       TIMESTAMPTZ NOT NULL,
        processed          BOOLEAN NOT NULL DEFAULT FALSE,
        processed_at       TIMESTAMPTZ,
        error              TEXT,
        processing_time_ms BIGINT,
        claimed_by         TEXT,
        lease_expires_at   TIMESTAMPTZ,
        CONSTRAINT business_events_retry_bounds
            CHECK (retry_count >= 0 AND retry_count <= max_retries)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS business_events_due_idx
        ON business_events (tenant_id, priority DESC, created_at ASC)
        WHERE processed = FALSE AND error IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS business_events_created_idx
        ON business_events (tenant_id, created_at DESC)
    "#,
];

const COLUMNS: &str = r#"
    id, tenant_id, event_type, source, source_id, aggregate_id, aggregate_type,
    data, metadata, priority, retry_count, max_retries, created_at, scheduled_at,
    processed, processed_at, error, processing_time_ms, claimed_by, lease_expires_at
"#;

/// Postgres-backed record store.
///
/// Every query includes `tenant_id` in the WHERE clause, so one tenant can
/// never read or modify another tenant's events.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `business_events` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<BusinessEvent>, StoreError> {
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl EventRecordStore for PostgresEventStore {
    #[instrument(
        skip(self, event),
        fields(tenant_id = %tenant_id, event_id = %event.id, event_type = event.event_type.as_str()),
        err
    )]
    async fn insert(&self, tenant_id: TenantId, event: &BusinessEvent) -> Result<(), StoreError> {
        if event.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "event tenant_id mismatch: expected {tenant_id}, got {}",
                event.tenant_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO business_events (
                id, tenant_id, event_type, source, source_id, aggregate_id, aggregate_type,
                data, metadata, priority, retry_count, max_retries, created_at, scheduled_at,
                processed, processed_at, error, processing_time_ms, claimed_by, lease_expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.source)
        .bind(&event.source_id)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.data)
        .bind(event.metadata.as_ref().map(Json))
        .bind(event.priority.rank())
        .bind(to_i32(event.retry_count))
        .bind(to_i32(event.max_retries))
        .bind(event.created_at)
        .bind(event.scheduled_at)
        .bind(event.processed)
        .bind(event.processed_at)
        .bind(&event.error)
        .bind(event.processing_time_ms.map(to_i64))
        .bind(&event.claimed_by)
        .bind(event.lease_expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(event.id)
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: EventId) -> Result<Option<BusinessEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM business_events WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(
        skip(self, request),
        fields(tenant_id = %tenant_id, owner = %request.owner, limit = request.limit, claimed = tracing::field::Empty),
        err
    )]
    async fn claim_due(
        &self,
        tenant_id: TenantId,
        request: &ClaimRequest,
    ) -> Result<Vec<BusinessEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE business_events
            SET claimed_by = $2, lease_expires_at = $3
            WHERE id IN (
                SELECT id FROM business_events
                WHERE tenant_id = $1
                    AND processed = FALSE
                    AND error IS NULL
                    AND scheduled_at <= $4
                    AND (lease_expires_at IS NULL OR lease_expires_at <= $4)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(&request.owner)
        .bind(request.lease_until)
        .bind(request.now)
        .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut events = Self::decode_rows(rows)?;
        events.sort_by(dispatch_order);
        Span::current().record("claimed", events.len());
        Ok(events)
    }

    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, event_id = %id), err)]
    async fn claim_one(
        &self,
        tenant_id: TenantId,
        id: EventId,
        request: &ClaimRequest,
    ) -> Result<Option<BusinessEvent>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE business_events
            SET claimed_by = $3, lease_expires_at = $4
            WHERE tenant_id = $1
                AND id = $2
                AND processed = FALSE
                AND error IS NULL
                AND scheduled_at <= $5
                AND (lease_expires_at IS NULL OR lease_expires_at <= $5)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(&request.owner)
        .bind(request.lease_until)
        .bind(request.now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_one", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, update), fields(tenant_id = %tenant_id, event_id = %id), err)]
    async fn update(
        &self,
        tenant_id: TenantId,
        id: EventId,
        owner: &str,
        update: &EventUpdate,
    ) -> Result<bool, StoreError> {
        // Every outcome also drops the lease; the guard keeps a stale owner out.
        let result = match update {
            EventUpdate::MarkProcessed {
                processed_at,
                processing_time_ms,
            } => {
                sqlx::query(
                    r#"
                    UPDATE business_events
                    SET processed = TRUE, processed_at = $4, processing_time_ms = $5, error = NULL,
                        claimed_by = NULL, lease_expires_at = NULL
                    WHERE tenant_id = $1 AND id = $2 AND claimed_by = $3 AND processed = FALSE
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(id.as_uuid())
                .bind(owner)
                .bind(processed_at)
                .bind(to_i64(*processing_time_ms))
                .execute(&*self.pool)
                .await
            }
            EventUpdate::ScheduleRetry {
                retry_count,
                scheduled_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE business_events
                    SET retry_count = LEAST($4, max_retries), scheduled_at = $5, error = NULL,
                        claimed_by = NULL, lease_expires_at = NULL
                    WHERE tenant_id = $1 AND id = $2 AND claimed_by = $3 AND processed = FALSE
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(id.as_uuid())
                .bind(owner)
                .bind(to_i32(*retry_count))
                .bind(scheduled_at)
                .execute(&*self.pool)
                .await
            }
            EventUpdate::MarkFailed { retry_count, error } => {
                sqlx::query(
                    r#"
                    UPDATE business_events
                    SET retry_count = LEAST($4, max_retries), error = $5,
                        claimed_by = NULL, lease_expires_at = NULL
                    WHERE tenant_id = $1 AND id = $2 AND claimed_by = $3 AND processed = FALSE
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(id.as_uuid())
                .bind(owner)
                .bind(to_i32(*retry_count))
                .bind(error)
                .execute(&*self.pool)
                .await
            }
            EventUpdate::Release => {
                sqlx::query(
                    r#"
                    UPDATE business_events
                    SET claimed_by = NULL, lease_expires_at = NULL
                    WHERE tenant_id = $1 AND id = $2 AND claimed_by = $3 AND processed = FALSE
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(id.as_uuid())
                .bind(owner)
                .execute(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("update_event", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, ids), fields(tenant_id = %tenant_id, events = ids.len()), err)]
    async fn extend_leases(
        &self,
        tenant_id: TenantId,
        ids: &[EventId],
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE business_events
            SET lease_expires_at = $4
            WHERE tenant_id = $1 AND id = ANY($2) AND claimed_by = $3 AND processed = FALSE
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&ids)
        .bind(owner)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_leases", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn rearm_failed(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE business_events
            SET error = NULL, scheduled_at = $2, claimed_by = NULL, lease_expires_at = NULL
            WHERE id IN (
                SELECT id FROM business_events
                WHERE tenant_id = $1 AND processed = FALSE AND error IS NOT NULL
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("rearm_failed", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(EventId::from_uuid)
                    .map_err(|e| StoreError::Decode(format!("failed to read id: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn purge_processed(
        &self,
        tenant_id: TenantId,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM business_events
            WHERE tenant_id = $1 AND processed = TRUE AND created_at < $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_processed", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn counts(
        &self,
        tenant_id: TenantId,
        today_start: DateTime<Utc>,
        sample: usize,
    ) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE created_at >= $2) AS today,
                COUNT(*) FILTER (WHERE processed = FALSE AND error IS NULL) AS pending,
                COUNT(*) FILTER (WHERE processed = FALSE AND error IS NOT NULL) AS failed,
                COUNT(*) FILTER (WHERE processed = TRUE) AS processed,
                COUNT(DISTINCT event_type) AS event_types
            FROM business_events
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(today_start)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_events", e))?;

        let avg = sqlx::query(
            r#"
            SELECT AVG(processing_time_ms)::float8 AS avg_ms
            FROM (
                SELECT processing_time_ms FROM business_events
                WHERE tenant_id = $1 AND processed = TRUE AND processing_time_ms IS NOT NULL
                ORDER BY processed_at DESC
                LIMIT $2
            ) recent
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(i64::try_from(sample).unwrap_or(i64::MAX))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("average_processing_time", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            row.try_get::<i64, _>(column)
                .map(|n| n.max(0) as u64)
                .map_err(|e| StoreError::Decode(format!("failed to read {column}: {e}")))
        };

        Ok(StoreCounts {
            total: count("total")?,
            today: count("today")?,
            pending: count("pending")?,
            failed: count("failed")?,
            processed: count("processed")?,
            event_types: count("event_types")?,
            avg_processing_time_ms: avg
                .try_get::<Option<f64>, _>("avg_ms")
                .map_err(|e| StoreError::Decode(format!("failed to read avg_ms: {e}")))?,
        })
    }

    #[instrument(skip(self, query), fields(tenant_id = %tenant_id), err)]
    async fn list(
        &self,
        tenant_id: TenantId,
        query: &EventQuery,
        pagination: Pagination,
    ) -> Result<EventPage, StoreError> {
        const FILTER: &str = r#"
            WHERE tenant_id = $1
                AND ($2::text IS NULL OR event_type = $2)
                AND ($3::text IS NULL
                    OR ($3 = 'pending' AND processed = FALSE AND error IS NULL)
                    OR ($3 = 'processed' AND processed = TRUE)
                    OR ($3 = 'failed' AND processed = FALSE AND error IS NOT NULL))
                AND ($4::text IS NULL OR source = $4)
                AND ($5::text IS NULL OR aggregate_id = $5)
                AND ($6::timestamptz IS NULL OR created_at >= $6)
                AND ($7::timestamptz IS NULL OR created_at <= $7)
        "#;

        let event_type = query.event_type.map(|t| t.as_str());
        let status = query.status.map(status_str);

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM business_events {FILTER}"))
            .bind(tenant_id.as_uuid())
            .bind(event_type)
            .bind(status)
            .bind(query.source.as_deref())
            .bind(query.aggregate_id.as_deref())
            .bind(query.created_after)
            .bind(query.created_before)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_list", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Decode(format!("failed to read count: {e}")))?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM business_events {FILTER} ORDER BY created_at DESC, id ASC LIMIT $8 OFFSET $9"
        ))
        .bind(tenant_id.as_uuid())
        .bind(event_type)
        .bind(status)
        .bind(query.source.as_deref())
        .bind(query.aggregate_id.as_deref())
        .bind(query.created_after)
        .bind(query.created_before)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_events", e))?;

        let events = Self::decode_rows(rows)?;
        let has_more = total > i64::from(pagination.offset) + i64::from(pagination.limit);

        Ok(EventPage {
            events,
            total: total.max(0) as u64,
            pagination,
            has_more,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<BusinessEvent, StoreError> {
    BusinessEventRow::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to read event row: {e}")))?
        .try_into()
}

fn status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Pending => "pending",
        EventStatus::Processed => "processed",
        EventStatus::Failed => "failed",
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Database(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Database(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct BusinessEventRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    event_type: String,
    source: String,
    source_id: Option<String>,
    aggregate_id: Option<String>,
    aggregate_type: Option<String>,
    data: serde_json::Value,
    metadata: Option<Json<EventMetadata>>,
    priority: i16,
    retry_count: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    processing_time_ms: Option<i64>,
    claimed_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for BusinessEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BusinessEventRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            source: row.try_get("source")?,
            source_id: row.try_get("source_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            data: row.try_get("data")?,
            metadata: row.try_get("metadata")?,
            priority: row.try_get("priority")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            error: row.try_get("error")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            claimed_by: row.try_get("claimed_by")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
        })
    }
}

impl TryFrom<BusinessEventRow> for BusinessEvent {
    type Error = StoreError;

    fn try_from(row: BusinessEventRow) -> Result<Self, Self::Error> {
        let event_type: EventType = row
            .event_type
            .parse()
            .map_err(|e| StoreError::Decode(format!("event {}: {e}", row.id)))?;
        let priority = Priority::from_rank(row.priority)
            .ok_or_else(|| StoreError::Decode(format!("event {}: priority rank {}", row.id, row.priority)))?;

        Ok(BusinessEvent {
            id: EventId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            event_type,
            source: row.source,
            source_id: row.source_id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            data: row.data,
            metadata: row.metadata.map(|Json(m)| m),
            priority,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            processed: row.processed,
            processed_at: row.processed_at,
            error: row.error,
            processing_time_ms: row.processing_time_ms.map(|ms| ms.max(0) as u64),
            claimed_by: row.claimed_by,
            lease_expires_at: row.lease_expires_at,
        })
    }
}
