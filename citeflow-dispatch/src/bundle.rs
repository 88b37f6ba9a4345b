//! Tier executor
//!
//! Runs the claimed services of one tier concurrently and waits for all of
//! them. Each service is isolated: a failure, a panic or a persistence error
//! for one service never aborts its siblings or later tiers.

use crate::model::{Request, Tier};
use crate::service::{FailureKind, Responses, Service};
use crate::store::DispatchStore;
use citeflow_common::time::now;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What happened to one service in a bundle run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Completed with this many responses
    Completed(usize),
    Failed(FailureKind),
    /// Record was not Queued; another worker owns it
    NotClaimed,
    /// Finished after its record was reaped or expired; results dropped
    Discarded,
    /// The store rejected a status write; the record is left for the reaper
    StoreError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub tier: Tier,
    pub outcomes: Vec<(String, ServiceOutcome)>,
}

impl BundleReport {
    pub fn outcome(&self, service_id: &str) -> Option<&ServiceOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == service_id)
            .map(|(_, outcome)| outcome)
    }
}

/// One tier's worth of claimed services
pub struct ServiceBundle {
    tier: Tier,
    services: Vec<Arc<dyn Service>>,
    permits: Arc<Semaphore>,
}

impl ServiceBundle {
    pub fn new(tier: Tier, services: Vec<Arc<dyn Service>>, max_concurrent: usize) -> Self {
        Self {
            tier,
            services,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run every service and wait for all of them
    pub async fn handle(&self, store: Arc<dyn DispatchStore>, request: &Request) -> BundleReport {
        debug!(
            request_id = %request.id,
            tier = %self.tier,
            services = self.services.len(),
            "Handling service bundle"
        );

        let mut set = JoinSet::new();
        for service in &self.services {
            let service = Arc::clone(service);
            let store = Arc::clone(&store);
            let request = request.clone();
            let permits = Arc::clone(&self.permits);

            set.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let id = service.id().to_string();
                let outcome = run_service(store.as_ref(), service.as_ref(), &request).await;
                (id, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.services.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => error!(
                    request_id = %request.id,
                    tier = %self.tier,
                    error = %e,
                    "Service task aborted"
                ),
            }
        }

        // Report in bundle order regardless of completion order
        outcomes.sort_by_key(|(id, _)| {
            self.services
                .iter()
                .position(|s| s.id() == id)
                .unwrap_or(usize::MAX)
        });

        BundleReport {
            tier: self.tier,
            outcomes,
        }
    }
}

/// Claim, invoke and record one service
async fn run_service(
    store: &dyn DispatchStore,
    service: &dyn Service,
    request: &Request,
) -> ServiceOutcome {
    let service_id = service.id();

    match store.start(request.id, service_id, now()).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                request_id = %request.id,
                service_id,
                "Service not queued for this worker, skipping"
            );
            return ServiceOutcome::NotClaimed;
        }
        Err(e) => {
            error!(request_id = %request.id, service_id, error = %e, "Failed to mark service in progress");
            return ServiceOutcome::StoreError(e.to_string());
        }
    }

    info!(request_id = %request.id, service_id, "Service started");

    let mut responses = Responses::new();
    let invoked = AssertUnwindSafe(service.handle(request, &mut responses))
        .catch_unwind()
        .await;

    let result = match invoked {
        Ok(Ok(())) => {
            let count = responses.len();
            store
                .complete(request.id, service_id, responses.into_inner(), now())
                .await
                .map(|written| {
                    if written {
                        info!(request_id = %request.id, service_id, responses = count, "Service completed");
                        ServiceOutcome::Completed(count)
                    } else {
                        warn!(
                            request_id = %request.id,
                            service_id,
                            "Service finished after its record was reaped; results discarded"
                        );
                        ServiceOutcome::Discarded
                    }
                })
        }
        Ok(Err(failure)) => {
            warn!(
                request_id = %request.id,
                service_id,
                kind = ?failure.kind,
                error = %failure.message,
                "Service failed"
            );
            record_failure(store, request, service_id, failure.kind, &failure.message).await
        }
        Err(panic) => {
            let detail = format!("service panicked: {}", panic_message(panic.as_ref()));
            error!(request_id = %request.id, service_id, error = %detail, "Service panicked");
            record_failure(store, request, service_id, FailureKind::Fatal, &detail).await
        }
    };

    result.unwrap_or_else(|e| {
        error!(request_id = %request.id, service_id, error = %e, "Failed to record service result");
        ServiceOutcome::StoreError(e.to_string())
    })
}

async fn record_failure(
    store: &dyn DispatchStore,
    request: &Request,
    service_id: &str,
    kind: FailureKind,
    detail: &str,
) -> crate::error::Result<ServiceOutcome> {
    let written = store.fail(request.id, service_id, kind, detail, now()).await?;
    Ok(if written {
        ServiceOutcome::Failed(kind)
    } else {
        ServiceOutcome::Discarded
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DispatchStatus, NewRequest};
    use crate::service::ServiceFailure;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use citeflow_common::db::init_database;
    use serde_json::json;
    use tempfile::TempDir;

    /// Responds once; optionally demotes its own record mid-run
    struct Lookup {
        id: &'static str,
        reaped_by: Option<Arc<SqliteStore>>,
    }

    #[async_trait]
    impl Service for Lookup {
        fn id(&self) -> &str {
            self.id
        }

        fn tier(&self) -> Tier {
            Tier::foreground(0).unwrap()
        }

        async fn handle(&self, request: &Request, responses: &mut Responses) -> Result<(), ServiceFailure> {
            if let Some(store) = &self.reaped_by {
                let far = now() + chrono::Duration::hours(1);
                store
                    .demote_stale(request.id, DispatchStatus::InProgress, far, "reaped", now())
                    .await
                    .map_err(|e| ServiceFailure::temporary(e.to_string()))?;
            }
            responses.add("fulltext", json!(self.id));
            Ok(())
        }
    }

    async fn setup() -> (TempDir, Arc<SqliteStore>, Request) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("bundle.db")).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        let request = store.create_request(NewRequest::default(), now()).await.unwrap();
        (dir, store, request)
    }

    fn lookup(id: &'static str) -> Arc<dyn Service> {
        Arc::new(Lookup { id, reaped_by: None })
    }

    #[tokio::test]
    async fn test_unclaimed_services_are_skipped() {
        let (_dir, store, request) = setup().await;
        let t = now();
        store.claim(request.id, &["claimed".to_string()], t, t).await.unwrap();

        let bundle = ServiceBundle::new(
            Tier::foreground(0).unwrap(),
            vec![lookup("claimed"), lookup("unclaimed")],
            1,
        );
        let report = bundle.handle(store.clone(), &request).await;

        assert_eq!(report.outcome("claimed"), Some(&ServiceOutcome::Completed(1)));
        assert_eq!(report.outcome("unclaimed"), Some(&ServiceOutcome::NotClaimed));
        assert_eq!(
            report.outcomes.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["claimed", "unclaimed"]
        );
    }

    #[tokio::test]
    async fn test_results_after_reaping_are_discarded() {
        let (_dir, store, request) = setup().await;
        let t = now();
        store.claim(request.id, &["slow".to_string()], t, t).await.unwrap();

        let slow: Arc<dyn Service> = Arc::new(Lookup {
            id: "slow",
            reaped_by: Some(store.clone()),
        });
        let report = ServiceBundle::new(Tier::foreground(0).unwrap(), vec![slow], 4)
            .handle(store.clone(), &request)
            .await;

        assert_eq!(report.outcome("slow"), Some(&ServiceOutcome::Discarded));
        assert!(store.responses(request.id).await.unwrap().is_empty());
        let record = &store.dispatched_services(request.id).await.unwrap()[0];
        assert_eq!(record.status, DispatchStatus::FailedTemporary);
    }
}
