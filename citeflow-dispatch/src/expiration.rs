//! Expiration of completed results
//!
//! A Completed record expires when it is older than the TTL, or when the
//! next occurrence of the recurrence schedule after its creation has
//! passed. Expiring deletes the record and its responses, so the next
//! orchestrator pass claims and runs the service again. In-flight and
//! failed records are never expired.

use crate::error::{DispatchError, Result};
use crate::model::DispatchStatus;
use crate::store::DispatchStore;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// TTL and/or recurrence schedule; inactive when both are unset
#[derive(Debug, Clone, Default)]
pub struct ExpirationPolicy {
    ttl: Option<Duration>,
    schedule: Option<Schedule>,
}

impl ExpirationPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Add a recurrence schedule (seconds-first cron syntax, e.g. `0 0 3 * * *`)
    pub fn with_schedule(mut self, expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            DispatchError::Config(format!("invalid expiration schedule '{}': {}", expression, e))
        })?;
        self.schedule = Some(schedule);
        Ok(self)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl.is_some() || self.schedule.is_some()
    }

    /// Whether a result created at `created_at` has expired at `now`
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let by_ttl = self
            .ttl
            .is_some_and(|ttl| citeflow_common::time::elapsed_between(created_at, now) > ttl);

        let by_schedule = self.schedule.as_ref().is_some_and(|schedule| {
            schedule
                .after(&created_at)
                .next()
                .is_some_and(|next| now > next)
        });

        by_ttl || by_schedule
    }

    /// Delete every expired Completed record of a request.
    ///
    /// Returns the number of records expired.
    pub async fn sweep(
        &self,
        store: &dyn DispatchStore,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if !self.is_enabled() {
            return Ok(0);
        }

        let mut expired = 0;
        for record in store.dispatched_services(request_id).await? {
            if record.status != DispatchStatus::Completed
                || !self.is_expired(record.created_at, now)
            {
                continue;
            }

            if let Some(responses) = store.expire(request_id, &record.service_id).await? {
                info!(
                    request_id = %request_id,
                    service_id = %record.service_id,
                    responses,
                    "Expired completed service results"
                );
                expired += 1;
            }
        }

        Ok(expired)
    }
}
