//! SQLite implementation of [`DispatchStore`]

use super::DispatchStore;
use crate::error::{DispatchError, Result};
use crate::model::{
    DispatchStatus, DispatchedService, NewRequest, NewServiceResponse, Request, ServiceResponse,
};
use crate::service::FailureKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use citeflow_common::time::{from_millis, to_millis};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

/// Store backed by a SQLite pool
///
/// Cloning is cheap; each clone shares the pool and every operation
/// acquires its own connection, so a clone may be moved into a detached
/// worker that outlives the call that created it.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| DispatchError::Corrupt(format!("bad uuid '{}': {}", value, e)))
}

fn request_from_row(row: &SqliteRow) -> Result<Request> {
    let id: String = row.try_get("id")?;
    let client_ip: Option<String> = row.try_get("client_ip")?;
    let client_ip = client_ip
        .map(|ip| {
            ip.parse()
                .map_err(|_| DispatchError::Corrupt(format!("bad client address '{}'", ip)))
        })
        .transpose()?;

    Ok(Request {
        id: parse_uuid(&id)?,
        referrer: row.try_get("referrer")?,
        client_ip,
        institution: row.try_get("institution")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn dispatched_from_row(row: &SqliteRow) -> Result<DispatchedService> {
    let request_id: String = row.try_get("request_id")?;
    let status: String = row.try_get("status")?;

    Ok(DispatchedService {
        request_id: parse_uuid(&request_id)?,
        service_id: row.try_get("service_id")?,
        status: status.parse().map_err(DispatchError::Corrupt)?,
        failure_detail: row.try_get("failure_detail")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn response_from_row(row: &SqliteRow) -> Result<ServiceResponse> {
    let id: String = row.try_get("id")?;
    let request_id: String = row.try_get("request_id")?;
    let payload: String = row.try_get("payload")?;

    Ok(ServiceResponse {
        id: parse_uuid(&id)?,
        request_id: parse_uuid(&request_id)?,
        service_id: row.try_get("service_id")?,
        service_type_value: row.try_get("service_type_value")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| DispatchError::Corrupt(format!("bad payload for response {}: {}", id, e)))?,
        embeddable: row.try_get("embeddable")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

#[async_trait]
impl DispatchStore for SqliteStore {
    async fn create_request(&self, new: NewRequest, now: DateTime<Utc>) -> Result<Request> {
        let request = Request {
            id: Uuid::new_v4(),
            referrer: new.referrer,
            client_ip: new.client_ip,
            institution: new.institution,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO requests (id, referrer, client_ip, institution, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(&request.referrer)
        .bind(request.client_ip.map(|ip| ip.to_string()))
        .bind(&request.institution)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        // Round-trip through millisecond storage precision
        Ok(Request {
            created_at: from_millis(to_millis(now)),
            updated_at: from_millis(to_millis(now)),
            ..request
        })
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<Request>> {
        let row = sqlx::query(
            "SELECT id, referrer, client_ip, institution, created_at, updated_at FROM requests WHERE id = ?",
        )
        .bind(request_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn touch_request(&self, request_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE requests SET updated_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(request_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn dispatched_services(&self, request_id: Uuid) -> Result<Vec<DispatchedService>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, service_id, status, failure_detail, created_at, updated_at
            FROM dispatched_services
            WHERE request_id = ?
            ORDER BY created_at, service_id
            "#,
        )
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dispatched_from_row).collect()
    }

    async fn claim(
        &self,
        request_id: Uuid,
        service_ids: &[String],
        requeue_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut claimed = Vec::new();

        // The upsert's WHERE clause turns an existing row into a no-op unless
        // it is an aged temporary failure; RETURNING yields only rows written.
        for service_id in service_ids {
            let row: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO dispatched_services
                    (request_id, service_id, status, failure_detail, created_at, updated_at)
                VALUES (?1, ?2, 'queued', NULL, ?3, ?3)
                ON CONFLICT (request_id, service_id) DO UPDATE SET
                    status = 'queued',
                    failure_detail = NULL,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at
                WHERE dispatched_services.status = 'failed_temporary'
                  AND dispatched_services.created_at <= ?4
                RETURNING service_id
                "#,
            )
            .bind(request_id.to_string())
            .bind(service_id)
            .bind(to_millis(now))
            .bind(to_millis(requeue_before))
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(id) = row {
                claimed.push(id);
            }
        }

        tx.commit().await?;

        debug!(
            request_id = %request_id,
            claimed = claimed.len(),
            candidates = service_ids.len(),
            "Claim transaction committed"
        );

        Ok(claimed)
    }

    async fn start(&self, request_id: Uuid, service_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatched_services
            SET status = 'in_progress', updated_at = ?
            WHERE request_id = ? AND service_id = ? AND status = 'queued'
            "#,
        )
        .bind(to_millis(now))
        .bind(request_id.to_string())
        .bind(service_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        request_id: Uuid,
        service_id: &str,
        responses: Vec<NewServiceResponse>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE dispatched_services
            SET status = 'completed', failure_detail = NULL, updated_at = ?
            WHERE request_id = ? AND service_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(to_millis(now))
        .bind(request_id.to_string())
        .bind(service_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for response in responses {
            sqlx::query(
                r#"
                INSERT INTO service_responses
                    (id, request_id, service_id, service_type_value, payload, embeddable, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(request_id.to_string())
            .bind(service_id)
            .bind(&response.service_type_value)
            .bind(response.payload.to_string())
            .bind(response.embeddable)
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fail(
        &self,
        request_id: Uuid,
        service_id: &str,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let status = match kind {
            FailureKind::Temporary => DispatchStatus::FailedTemporary,
            FailureKind::Fatal => DispatchStatus::FailedFatal,
        };

        let result = sqlx::query(
            r#"
            UPDATE dispatched_services
            SET status = ?, failure_detail = ?, updated_at = ?
            WHERE request_id = ? AND service_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(to_millis(now))
        .bind(request_id.to_string())
        .bind(service_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn demote_stale(
        &self,
        request_id: Uuid,
        status: DispatchStatus,
        stale_before: DateTime<Utc>,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let demoted: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE dispatched_services
            SET status = 'failed_temporary',
                failure_detail = COALESCE(failure_detail, ?),
                updated_at = ?
            WHERE request_id = ? AND status = ? AND updated_at < ?
            RETURNING service_id
            "#,
        )
        .bind(detail)
        .bind(to_millis(now))
        .bind(request_id.to_string())
        .bind(status.as_str())
        .bind(to_millis(stale_before))
        .fetch_all(&self.pool)
        .await?;

        Ok(demoted)
    }

    async fn expire(&self, request_id: Uuid, service_id: &str) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query(
            r#"
            DELETE FROM dispatched_services
            WHERE request_id = ? AND service_id = ? AND status = 'completed'
            "#,
        )
        .bind(request_id.to_string())
        .bind(service_id)
        .execute(&mut *tx)
        .await?;

        if record.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let responses =
            sqlx::query("DELETE FROM service_responses WHERE request_id = ? AND service_id = ?")
                .bind(request_id.to_string())
                .bind(service_id)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(Some(responses.rows_affected()))
    }

    async fn responses(&self, request_id: Uuid) -> Result<Vec<ServiceResponse>> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, service_id, service_type_value, payload, embeddable, created_at
            FROM service_responses
            WHERE request_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(response_from_row).collect()
    }

    async fn count_in_flight(&self, request_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM dispatched_services
            WHERE request_id = ? AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(request_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
