//! Dispatch orchestrator
//!
//! Entry point invoked once per page view or status poll. Each call:
//! 1. expires completed results past their TTL/schedule,
//! 2. demotes stalled in-flight records,
//! 3. atomically claims every eligible service,
//! 4. hands the claimed services to a detached pass task, which runs the
//!    foreground tiers in ascending order, reports them back to the caller
//!    and then continues into the background tiers.
//!
//! Once a service is claimed the pass task owns it: dropping the caller's
//! future (client disconnect, timeout) never cancels claimed work.
//!
//! Calls are idempotent: a service already Queued, InProgress, Completed or
//! recently failed is not claimed again, so repeated or concurrent calls for
//! the same request never run a service twice.

use crate::bundle::{BundleReport, ServiceBundle};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::model::{DispatchStatus, DispatchedService, NewRequest, Request, ServiceResponse, Tier};
use crate::progress;
use crate::reaper::{ReapReport, Reaper};
use crate::registry::{Collection, ServiceRegistry};
use crate::store::DispatchStore;
use citeflow_common::time::{from_millis, millis_before, now};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// What one orchestrator pass did
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Completed records deleted by the sweeper
    pub expired: usize,
    pub reaped: ReapReport,
    /// Service ids claimed by this pass, all tiers
    pub claimed: Vec<String>,
    /// Reports of the foreground tiers, in tier order
    pub foreground: Vec<BundleReport>,
    /// Background tiers still running after this call returned
    pub background_tiers: Vec<Tier>,
}

/// Currently available results of a request
#[derive(Debug, Clone, Serialize)]
pub struct ResultsReport {
    pub request_id: Uuid,
    pub in_progress: bool,
    pub responses: BTreeMap<String, Vec<ServiceResponse>>,
    pub failures: Vec<DispatchedService>,
}

/// Result of a status poll
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    #[serde(flatten)]
    pub results: ResultsReport,
    /// Suggested delay before the next poll; absent when polling should stop
    pub retry_after_secs: Option<u64>,
}

/// Handles of detached pass tasks
///
/// Dropping a handle does not cancel its task; they are kept only so tests
/// and shutdown paths can await outstanding work.
#[derive(Default)]
struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *handles)
    }
}

pub struct Dispatcher {
    store: Arc<dyn DispatchStore>,
    registry: Arc<dyn ServiceRegistry>,
    config: Arc<DispatchConfig>,
    background: BackgroundTasks,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        registry: Arc<dyn ServiceRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config: Arc::new(config),
            background: BackgroundTasks::default(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    /// Register a new resolution attempt
    pub async fn create_request(&self, new: NewRequest) -> Result<Request> {
        let request = self.store.create_request(new, now()).await?;
        info!(request_id = %request.id, "Created request");
        Ok(request)
    }

    pub async fn load_request(&self, request_id: Uuid) -> Result<Request> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(DispatchError::RequestNotFound(request_id))
    }

    /// Run one orchestrator pass for a request
    ///
    /// Returns once the foreground tiers have finished. Background tiers may
    /// still be running when this returns, and all claimed tiers keep running
    /// if this future is dropped.
    pub async fn dispatch(&self, request: &Request) -> Result<DispatchOutcome> {
        let started = now();
        let store = self.store.as_ref();

        let expired = self.config.expiration.sweep(store, request.id, started).await?;
        let reaped = Reaper::new(self.config.stall_timeout)
            .reap(store, request.id, started)
            .await?;

        let collection = self.registry.collection_for(request);
        let claimed = self.claim(request, &collection).await?;

        let background_tiers = claimed.background_tiers();
        let foreground = if claimed.is_empty() {
            Vec::new()
        } else {
            self.spawn_pass(claimed.clone(), request.clone()).await?
        };

        Ok(DispatchOutcome {
            expired,
            reaped,
            claimed: claimed.service_ids(),
            foreground,
            background_tiers,
        })
    }

    /// Claim every eligible service in one atomic step
    async fn claim(&self, request: &Request, collection: &Collection) -> Result<Collection> {
        let claim_time = now();
        let requeue_before =
            from_millis(millis_before(claim_time, self.config.requeue_threshold()));

        let claimed_ids = self
            .store
            .claim(request.id, &collection.service_ids(), requeue_before, claim_time)
            .await
            .map_err(|e| DispatchError::ClaimFailed {
                request_id: request.id,
                reason: e.to_string(),
            })?;

        if !claimed_ids.is_empty() {
            info!(
                request_id = %request.id,
                services = ?claimed_ids,
                "Claimed services"
            );
        }

        Ok(collection.subset(&claimed_ids))
    }

    /// Run claimed services on a task the caller does not own
    ///
    /// Resolves with the foreground reports; the task then continues into
    /// the background tiers.
    async fn spawn_pass(&self, claimed: Collection, request: Request) -> Result<Vec<BundleReport>> {
        let store = Arc::clone(&self.store);
        let max_concurrent = self.config.max_concurrent_services;
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let reports = run_foreground(Arc::clone(&store), &claimed, &request, max_concurrent).await;
            // Receiver is gone when the caller was dropped; keep going
            let _ = tx.send(reports);

            if claimed.background_tiers().is_empty() {
                return;
            }
            info!(request_id = %request_id, "Starting background services");

            let run = AssertUnwindSafe(run_background(store, claimed, request_id, max_concurrent))
                .catch_unwind()
                .await;

            // Records left in flight are demoted by a later reaper pass
            match run {
                Ok(Ok(())) => info!(request_id = %request_id, "Background services complete"),
                Ok(Err(e)) => error!(
                    request_id = %request_id,
                    error = %e,
                    "Background service execution failed"
                ),
                Err(_) => error!(
                    request_id = %request_id,
                    "Background service worker panicked"
                ),
            }
        });

        self.background.track(handle);

        rx.await.map_err(|_| DispatchError::WorkerLost(request_id))
    }

    /// Wait for every pass task spawned so far
    pub async fn wait_for_background(&self) {
        loop {
            let handles = self.background.take();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch pass join failed");
                }
            }
        }
    }

    /// Re-run a temporarily failed service now, ignoring the re-queue threshold.
    ///
    /// Returns false if the service is not eligible for this request or its
    /// record is not FailedTemporary, including services never dispatched.
    pub async fn retry_service(&self, request: &Request, service_id: &str) -> Result<bool> {
        let collection = self.registry.collection_for(request);
        if !collection.contains(service_id) {
            return Ok(false);
        }

        let failed_temporary = self
            .store
            .dispatched_services(request.id)
            .await?
            .iter()
            .any(|record| {
                record.service_id == service_id && record.status == DispatchStatus::FailedTemporary
            });
        if !failed_temporary {
            return Ok(false);
        }

        let claim_time = now();
        let claimed_ids = self
            .store
            .claim(request.id, &[service_id.to_string()], claim_time, claim_time)
            .await
            .map_err(|e| DispatchError::ClaimFailed {
                request_id: request.id,
                reason: e.to_string(),
            })?;

        if claimed_ids.is_empty() {
            return Ok(false);
        }

        info!(request_id = %request.id, service_id, "Manually re-queued service");
        self.spawn_pass(collection.subset(&claimed_ids), request.clone())
            .await?;
        Ok(true)
    }

    pub async fn any_in_progress(&self, request_id: Uuid) -> Result<bool> {
        progress::any_in_progress(self.store.as_ref(), request_id).await
    }

    pub async fn service_type_in_progress(&self, request: &Request, type_value: &str) -> Result<bool> {
        let collection = self.registry.collection_for(request);
        progress::service_type_in_progress(self.store.as_ref(), &collection, request.id, type_value)
            .await
    }

    /// FailedTemporary and FailedFatal records with their detail
    pub async fn failed_dispatches(&self, request_id: Uuid) -> Result<Vec<DispatchedService>> {
        Ok(self
            .store
            .dispatched_services(request_id)
            .await?
            .into_iter()
            .filter(|record| record.status.is_failed())
            .collect())
    }

    pub async fn responses_by_type(
        &self,
        request_id: Uuid,
    ) -> Result<BTreeMap<String, Vec<ServiceResponse>>> {
        Ok(progress::group_by_type(self.store.responses(request_id).await?))
    }

    /// Response to skip the menu to, per the configured policy
    pub async fn skip_menu_target(
        &self,
        request: &Request,
        allow_skip: Option<bool>,
    ) -> Result<Option<ServiceResponse>> {
        let responses = self.store.responses(request.id).await?;
        Ok(self.config.menu_skip.select(request, &responses, allow_skip))
    }

    /// Results available right now, without dispatching
    pub async fn current_results(&self, request_id: Uuid) -> Result<ResultsReport> {
        self.load_request(request_id).await?;

        Ok(ResultsReport {
            request_id,
            in_progress: self.any_in_progress(request_id).await?,
            responses: self.responses_by_type(request_id).await?,
            failures: self.failed_dispatches(request_id).await?,
        })
    }

    /// Trigger or continue dispatch and report progress
    ///
    /// `attempt` counts the client's polls so far, starting at 0.
    pub async fn poll(&self, request_id: Uuid, attempt: u32) -> Result<PollReport> {
        let request = self.load_request(request_id).await?;
        self.store.touch_request(request_id, now()).await?;
        self.dispatch(&request).await?;

        let results = self.current_results(request_id).await?;
        let under_cap = self
            .config
            .max_poll_attempts
            .map_or(true, |max| attempt < max);
        let retry_after_secs = (results.in_progress && under_cap)
            .then(|| self.config.poll_interval.as_secs().max(1));

        Ok(PollReport {
            results,
            retry_after_secs,
        })
    }
}

async fn run_foreground(
    store: Arc<dyn DispatchStore>,
    claimed: &Collection,
    request: &Request,
    max_concurrent: usize,
) -> Vec<BundleReport> {
    let mut reports = Vec::new();
    for tier in claimed.foreground_tiers() {
        let bundle = ServiceBundle::new(tier, claimed.service_level(tier).to_vec(), max_concurrent);
        reports.push(bundle.handle(Arc::clone(&store), request).await);
    }
    reports
}

/// Background half of a pass
///
/// Reloads the request through the store: the call that claimed these
/// services may already have returned.
async fn run_background(
    store: Arc<dyn DispatchStore>,
    claimed: Collection,
    request_id: Uuid,
    max_concurrent: usize,
) -> Result<()> {
    let request = store
        .get_request(request_id)
        .await?
        .ok_or(DispatchError::RequestNotFound(request_id))?;

    for tier in claimed.background_tiers() {
        info!(request_id = %request_id, tier = %tier, "background: handling service bundle");
        let bundle = ServiceBundle::new(tier, claimed.service_level(tier).to_vec(), max_concurrent);
        bundle.handle(Arc::clone(&store), &request).await;
        info!(request_id = %request_id, tier = %tier, "background: done handling bundle");
    }

    Ok(())
}
