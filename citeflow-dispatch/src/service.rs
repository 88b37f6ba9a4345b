//! Lookup service contract
//!
//! A service is an opaque capability with a fixed tier. It is invoked once
//! per claimed (request, service) pair and reports its results through a
//! [`Responses`] collector. Results are persisted only when the service
//! returns `Ok`, in the same transaction that marks the record completed.

use crate::model::{NewServiceResponse, Request, Tier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failed invocation should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Believed transient; eligible for re-queue after the threshold
    Temporary,
    /// Not retried automatically
    Fatal,
}

/// Failure reported by a service
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ServiceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ServiceFailure {
    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Temporary,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}

/// Collector handed to [`Service::handle`]
#[derive(Debug, Default)]
pub struct Responses {
    items: Vec<NewServiceResponse>,
}

impl Responses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an embeddable result of the given type
    pub fn add(&mut self, service_type_value: impl Into<String>, payload: serde_json::Value) {
        self.push(NewServiceResponse {
            service_type_value: service_type_value.into(),
            payload,
            embeddable: true,
        });
    }

    /// Add a result whose target refuses to be embedded in a frame
    pub fn add_unembeddable(
        &mut self,
        service_type_value: impl Into<String>,
        payload: serde_json::Value,
    ) {
        self.push(NewServiceResponse {
            service_type_value: service_type_value.into(),
            payload,
            embeddable: false,
        });
    }

    pub fn push(&mut self, response: NewServiceResponse) {
        self.items.push(response);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_inner(self) -> Vec<NewServiceResponse> {
        self.items
    }
}

/// A pluggable lookup service
///
/// Implementations must tolerate concurrent invocation for different
/// requests and must not assume they are the only service running for a
/// request.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable identifier, unique within a registry
    fn id(&self) -> &str;

    fn tier(&self) -> Tier;

    /// Service type values this service may produce
    fn service_types(&self) -> &[String] {
        &[]
    }

    async fn handle(
        &self,
        request: &Request,
        responses: &mut Responses,
    ) -> Result<(), ServiceFailure>;
}
