//! Shared helpers for dispatch integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use citeflow_common::db::init_database;
use chrono::{DateTime, Utc};
use citeflow_dispatch::{
    DispatchConfig, DispatchError, DispatchStatus, DispatchStore, DispatchedService, Dispatcher,
    FailureKind, InstitutionRegistry, NewRequest, NewServiceResponse, Request, Responses, Service,
    ServiceFailure, ServiceResponse, SqliteStore, Tier,
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Ordered record of service start/finish events
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {} not logged", event))
    }
}

#[derive(Clone)]
enum Behavior {
    Respond(Vec<(String, Value, bool)>),
    FailTemporary(String),
    FailFatal(String),
    Panic,
}

/// Scripted service for tests
pub struct TestService {
    id: String,
    tier: Tier,
    types: Vec<String>,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
    log: Option<EventLog>,
}

impl TestService {
    pub fn new(id: &str, tier: &str) -> Self {
        Self {
            id: id.to_string(),
            tier: tier.parse().unwrap(),
            types: Vec::new(),
            behavior: Behavior::Respond(Vec::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
            log: None,
        }
    }

    pub fn responding(mut self, type_value: &str, payload: Value) -> Self {
        self.push_response(type_value, payload, true);
        self
    }

    pub fn responding_unembeddable(mut self, type_value: &str, payload: Value) -> Self {
        self.push_response(type_value, payload, false);
        self
    }

    fn push_response(&mut self, type_value: &str, payload: Value, embeddable: bool) {
        if !self.types.iter().any(|t| t == type_value) {
            self.types.push(type_value.to_string());
        }
        if let Behavior::Respond(items) = &mut self.behavior {
            items.push((type_value.to_string(), payload, embeddable));
        }
    }

    pub fn producing(mut self, type_value: &str) -> Self {
        self.types.push(type_value.to_string());
        self
    }

    pub fn failing_temporary(mut self, message: &str) -> Self {
        self.behavior = Behavior::FailTemporary(message.to_string());
        self
    }

    pub fn failing_fatal(mut self, message: &str) -> Self {
        self.behavior = Behavior::FailFatal(message.to_string());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    /// Block inside `handle` until the gate has a permit
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn logging(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Invocation counter, shared with the built service
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn build(self) -> Arc<dyn Service> {
        Arc::new(self)
    }
}

#[async_trait]
impl Service for TestService {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn service_types(&self) -> &[String] {
        &self.types
    }

    async fn handle(&self, _request: &Request, responses: &mut Responses) -> Result<(), ServiceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push(format!("{}:start", self.id));
        }

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let result = match &self.behavior {
            Behavior::Respond(items) => {
                for (type_value, payload, embeddable) in items {
                    if *embeddable {
                        responses.add(type_value.as_str(), payload.clone());
                    } else {
                        responses.add_unembeddable(type_value.as_str(), payload.clone());
                    }
                }
                Ok(())
            }
            Behavior::FailTemporary(message) => Err(ServiceFailure::temporary(message.clone())),
            Behavior::FailFatal(message) => Err(ServiceFailure::fatal(message.clone())),
            Behavior::Panic => panic!("{} exploded", self.id),
        };

        if let Some(log) = &self.log {
            log.push(format!("{}:end", self.id));
        }
        result
    }
}

pub fn calls(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

pub struct TestEnv {
    _dir: TempDir,
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub request: Request,
}

pub async fn setup(services: Vec<Arc<dyn Service>>, config: DispatchConfig) -> TestEnv {
    setup_with_request(services, config, NewRequest::default()).await
}

pub async fn setup_with_request(
    services: Vec<Arc<dyn Service>>,
    config: DispatchConfig,
    new_request: NewRequest,
) -> TestEnv {
    build_env(services, config, new_request, |store| store).await
}

/// Like `setup`, with the dispatcher talking through a `FlakyStore`
pub async fn setup_flaky(
    services: Vec<Arc<dyn Service>>,
    config: DispatchConfig,
) -> (TestEnv, Arc<FlakyStore>) {
    let mut flaky = None;
    let env = build_env(services, config, NewRequest::default(), |store| {
        let wrapped = Arc::new(FlakyStore::new(store));
        flaky = Some(Arc::clone(&wrapped));
        wrapped as Arc<dyn DispatchStore>
    })
    .await;
    (env, flaky.unwrap())
}

async fn build_env<F>(
    services: Vec<Arc<dyn Service>>,
    config: DispatchConfig,
    new_request: NewRequest,
    wrap: F,
) -> TestEnv
where
    F: FnOnce(Arc<dyn DispatchStore>) -> Arc<dyn DispatchStore>,
{
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("dispatch.db")).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool.clone()));

    let mut registry = InstitutionRegistry::new();
    for service in services {
        registry.register_default(service).unwrap();
    }

    let shared: Arc<dyn DispatchStore> = store.clone();
    let dispatcher = Arc::new(Dispatcher::new(wrap(shared), Arc::new(registry), config));
    let request = dispatcher.create_request(new_request).await.unwrap();

    TestEnv {
        _dir: dir,
        pool,
        store,
        dispatcher,
        request,
    }
}

/// Shift a dispatch record's timestamp into the past
pub async fn backdate(pool: &SqlitePool, request_id: Uuid, service_id: &str, column: &str, secs: i64) {
    assert!(column == "created_at" || column == "updated_at");
    let sql = format!(
        "UPDATE dispatched_services SET {col} = {col} - ? WHERE request_id = ? AND service_id = ?",
        col = column
    );
    sqlx::query(&sql)
        .bind(secs * 1000)
        .bind(request_id.to_string())
        .bind(service_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Shift every response of a dispatch record into the past
pub async fn backdate_completed(pool: &SqlitePool, request_id: Uuid, service_id: &str, secs: i64) {
    backdate(pool, request_id, service_id, "created_at", secs).await;
    backdate(pool, request_id, service_id, "updated_at", secs).await;
    sqlx::query(
        "UPDATE service_responses SET created_at = created_at - ? WHERE request_id = ? AND service_id = ?",
    )
    .bind(secs * 1000)
    .bind(request_id.to_string())
    .bind(service_id)
    .execute(pool)
    .await
    .unwrap();
}

/// Store wrapper whose request lookups can be switched to fail
pub struct FlakyStore {
    inner: Arc<dyn DispatchStore>,
    fail_request_lookups: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DispatchStore>) -> Self {
        Self {
            inner,
            fail_request_lookups: AtomicBool::new(false),
        }
    }

    pub fn fail_request_lookups(&self, fail: bool) {
        self.fail_request_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DispatchStore for FlakyStore {
    async fn create_request(&self, new: NewRequest, now: DateTime<Utc>) -> citeflow_dispatch::Result<Request> {
        self.inner.create_request(new, now).await
    }

    async fn get_request(&self, request_id: Uuid) -> citeflow_dispatch::Result<Option<Request>> {
        if self.fail_request_lookups.load(Ordering::SeqCst) {
            return Err(DispatchError::Corrupt("request lookup disabled".to_string()));
        }
        self.inner.get_request(request_id).await
    }

    async fn touch_request(&self, request_id: Uuid, now: DateTime<Utc>) -> citeflow_dispatch::Result<bool> {
        self.inner.touch_request(request_id, now).await
    }

    async fn dispatched_services(&self, request_id: Uuid) -> citeflow_dispatch::Result<Vec<DispatchedService>> {
        self.inner.dispatched_services(request_id).await
    }

    async fn claim(
        &self,
        request_id: Uuid,
        service_ids: &[String],
        requeue_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> citeflow_dispatch::Result<Vec<String>> {
        self.inner.claim(request_id, service_ids, requeue_before, now).await
    }

    async fn start(&self, request_id: Uuid, service_id: &str, now: DateTime<Utc>) -> citeflow_dispatch::Result<bool> {
        self.inner.start(request_id, service_id, now).await
    }

    async fn complete(
        &self,
        request_id: Uuid,
        service_id: &str,
        responses: Vec<NewServiceResponse>,
        now: DateTime<Utc>,
    ) -> citeflow_dispatch::Result<bool> {
        self.inner.complete(request_id, service_id, responses, now).await
    }

    async fn fail(
        &self,
        request_id: Uuid,
        service_id: &str,
        kind: FailureKind,
        detail: &str,
        now: DateTime<Utc>,
    ) -> citeflow_dispatch::Result<bool> {
        self.inner.fail(request_id, service_id, kind, detail, now).await
    }

    async fn demote_stale(
        &self,
        request_id: Uuid,
        status: DispatchStatus,
        stale_before: DateTime<Utc>,
        detail: &str,
        now: DateTime<Utc>,
    ) -> citeflow_dispatch::Result<Vec<String>> {
        self.inner
            .demote_stale(request_id, status, stale_before, detail, now)
            .await
    }

    async fn expire(&self, request_id: Uuid, service_id: &str) -> citeflow_dispatch::Result<Option<u64>> {
        self.inner.expire(request_id, service_id).await
    }

    async fn responses(&self, request_id: Uuid) -> citeflow_dispatch::Result<Vec<ServiceResponse>> {
        self.inner.responses(request_id).await
    }

    async fn count_in_flight(&self, request_id: Uuid) -> citeflow_dispatch::Result<i64> {
        self.inner.count_in_flight(request_id).await
    }
}
