//! Staleness reaper
//!
//! There is no heartbeat between workers and the store: a record that has
//! not been updated within the stall timeout is presumed to belong to a dead
//! worker and is demoted to FailedTemporary. The re-queue threshold then
//! decides when it becomes claimable again.

use crate::error::Result;
use crate::model::DispatchStatus;
use crate::store::DispatchStore;
use chrono::{DateTime, Utc};
use citeflow_common::time::{from_millis, millis_before};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Detail attached to a stale InProgress record
pub const DEAD_WORKER_DETAIL: &str = "background service timed out; worker assumed dead";

/// Detail attached to a stale Queued record that never started
pub const NEVER_STARTED_DETAIL: &str = "queued but never started; worker assumed dead";

/// Demotes timed-out in-flight records
#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    stall_timeout: Duration,
}

/// Service ids demoted by one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub never_started: Vec<String>,
    pub timed_out: Vec<String>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.never_started.len() + self.timed_out.len()
    }
}

impl Reaper {
    pub fn new(stall_timeout: Duration) -> Self {
        Self { stall_timeout }
    }

    pub async fn reap(
        &self,
        store: &dyn DispatchStore,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReapReport> {
        let stale_before = from_millis(millis_before(now, self.stall_timeout));

        let never_started = store
            .demote_stale(
                request_id,
                DispatchStatus::Queued,
                stale_before,
                NEVER_STARTED_DETAIL,
                now,
            )
            .await?;

        let timed_out = store
            .demote_stale(
                request_id,
                DispatchStatus::InProgress,
                stale_before,
                DEAD_WORKER_DETAIL,
                now,
            )
            .await?;

        for service_id in never_started.iter().chain(timed_out.iter()) {
            warn!(
                request_id = %request_id,
                service_id = %service_id,
                stall_timeout_secs = self.stall_timeout.as_secs(),
                "Demoted stalled service to failed_temporary"
            );
        }

        Ok(ReapReport {
            never_started,
            timed_out,
        })
    }
}
