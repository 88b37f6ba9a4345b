//! Dispatch record store
//!
//! Every state transition is a single guarded statement (or one
//! transaction), never a read followed by a separate write, so concurrent
//! orchestrator calls and lingering background workers cannot both own the
//! same (request, service) pair.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    DispatchStatus, DispatchedService, NewRequest, NewServiceResponse, Request, ServiceResponse,
};
use crate::service::FailureKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence contract consumed by the engine
#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn create_request(&self, new: NewRequest, now: DateTime<Utc>) -> Result<Request>;

    async fn get_request(&self, request_id: Uuid) -> Result<Option<Request>>;

    /// Bump `updated_at`; returns false if the request does not exist
    async fn touch_request(&self, request_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn dispatched_services(&self, request_id: Uuid) -> Result<Vec<DispatchedService>>;

    /// Claim every listed service that has no record, or whose record is
    /// FailedTemporary and was claimed at or before `requeue_before`.
    ///
    /// All claims happen in one transaction. Returns the ids actually
    /// claimed, which are now Queued.
    async fn claim(
        &self,
        request_id: Uuid,
        service_ids: &[String],
        requeue_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Queued -> InProgress; false if the record was not Queued
    async fn start(&self, request_id: Uuid, service_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// InProgress -> Completed, persisting the responses atomically.
    /// False (and nothing written) if the record was no longer InProgress.
    async fn complete(
        &self,
        request_id: Uuid,
        service_id: &str,
        responses: Vec<NewServiceResponse>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// InProgress -> FailedTemporary/FailedFatal; false if not InProgress
    async fn fail(
        &self,
        request_id: Uuid,
        service_id: &str,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Demote records in `status` not updated since `stale_before` to
    /// FailedTemporary, keeping any existing detail and otherwise setting
    /// `detail`. Returns the demoted service ids.
    async fn demote_stale(
        &self,
        request_id: Uuid,
        status: DispatchStatus,
        stale_before: DateTime<Utc>,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Delete a Completed record together with its responses.
    /// Returns the number of responses deleted, `None` if the record was
    /// not Completed.
    async fn expire(&self, request_id: Uuid, service_id: &str) -> Result<Option<u64>>;

    async fn responses(&self, request_id: Uuid) -> Result<Vec<ServiceResponse>>;

    /// Number of Queued or InProgress records
    async fn count_in_flight(&self, request_id: Uuid) -> Result<i64>;
}
