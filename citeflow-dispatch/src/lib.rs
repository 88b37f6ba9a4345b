//! citeflow dispatch engine
//!
//! Resolves a citation request by running pluggable lookup services in
//! priority tiers: foreground tiers on the caller's path, background tiers
//! on a detached worker the caller polls for. Each (request, service) pair
//! runs at most once per claim, stalled workers are detected by timestamp
//! and completed results expire so they get recomputed.

pub mod api;
pub mod bundle;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod expiration;
pub mod menu_skip;
pub mod model;
pub mod progress;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod store;

pub use config::DispatchConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, PollReport, ResultsReport};
pub use error::{DispatchError, Result};
pub use model::{
    DispatchStatus, DispatchedService, NewRequest, NewServiceResponse, Request, ServiceResponse,
    Tier,
};
pub use registry::{Collection, InstitutionRegistry, ServiceRegistry};
pub use service::{FailureKind, Responses, Service, ServiceFailure};
pub use store::{DispatchStore, SqliteStore};
