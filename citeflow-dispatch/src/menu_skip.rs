//! Menu-skip policy
//!
//! Decides whether a client should be sent straight to a single result
//! instead of the full menu. Policies only inspect responses that already
//! exist, so evaluating one never waits on running services.

use crate::error::{DispatchError, Result};
use crate::model::{Request, ServiceResponse};
use citeflow_common::config::MenuSkipSection;
use std::fmt;
use std::sync::Arc;

/// Application-supplied decision, for rules the data-driven form cannot express
///
/// Only embeddable responses are offered to the hook.
pub trait SkipMenuHook: Send + Sync {
    fn select(&self, request: &Request, responses: &[ServiceResponse]) -> Option<ServiceResponse>;
}

/// Rule-based selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkipRule {
    /// Target type values, in preference order
    pub service_types: Vec<String>,
    /// Requests from these referrers always get the menu
    pub excluded_referrers: Vec<String>,
    /// When set, only responses from these services qualify
    pub allowed_services: Option<Vec<String>>,
}

impl SkipRule {
    pub fn select(&self, request: &Request, responses: &[ServiceResponse]) -> Option<ServiceResponse> {
        if let Some(referrer) = &request.referrer {
            if self.excluded_referrers.iter().any(|r| r == referrer) {
                return None;
            }
        }

        self.service_types.iter().find_map(|type_value| {
            responses
                .iter()
                .filter(|r| &r.service_type_value == type_value)
                .filter(|r| r.embeddable)
                .find(|r| self.allows_service(&r.service_id))
                .cloned()
        })
    }

    fn allows_service(&self, service_id: &str) -> bool {
        match &self.allowed_services {
            Some(allowed) => allowed.iter().any(|s| s == service_id),
            None => true,
        }
    }
}

#[derive(Clone, Default)]
pub enum MenuSkipPolicy {
    #[default]
    Disabled,
    Rule(SkipRule),
    Custom(Arc<dyn SkipMenuHook>),
}

impl fmt::Debug for MenuSkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MenuSkipPolicy::Disabled => f.write_str("Disabled"),
            MenuSkipPolicy::Rule(rule) => f.debug_tuple("Rule").field(rule).finish(),
            MenuSkipPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl MenuSkipPolicy {
    /// Build from the `[menu_skip]` section; custom hooks are programmatic only
    pub fn from_config(section: &MenuSkipSection) -> Result<Self> {
        match section.mode.as_deref() {
            None | Some("disabled") => Ok(MenuSkipPolicy::Disabled),
            Some("rule") => {
                if section.service_types.is_empty() {
                    return Err(DispatchError::Config(
                        "menu_skip.mode = \"rule\" requires service_types".to_string(),
                    ));
                }
                Ok(MenuSkipPolicy::Rule(SkipRule {
                    service_types: section.service_types.clone(),
                    excluded_referrers: section.excluded_referrers.clone(),
                    allowed_services: section.allowed_services.clone(),
                }))
            }
            Some(other) => Err(DispatchError::Config(format!(
                "unknown menu_skip.mode '{}'",
                other
            ))),
        }
    }

    /// Pick the response to skip to, if any.
    ///
    /// `allow_skip = Some(false)` forces the menu for this call. Responses
    /// that cannot be embedded are never a skip target.
    pub fn select(
        &self,
        request: &Request,
        responses: &[ServiceResponse],
        allow_skip: Option<bool>,
    ) -> Option<ServiceResponse> {
        if allow_skip == Some(false) {
            return None;
        }

        let candidates: Vec<ServiceResponse> =
            responses.iter().filter(|r| r.embeddable).cloned().collect();

        match self {
            MenuSkipPolicy::Disabled => None,
            MenuSkipPolicy::Rule(rule) => rule.select(request, &candidates),
            MenuSkipPolicy::Custom(hook) => hook.select(request, &candidates),
        }
    }
}
