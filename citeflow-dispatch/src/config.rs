//! Validated dispatch configuration
//!
//! Built once, from TOML or programmatically, and handed to the
//! [`Dispatcher`](crate::Dispatcher) at construction.

use crate::error::Result;
use crate::expiration::ExpirationPolicy;
use crate::menu_skip::MenuSkipPolicy;
use citeflow_common::config::{validate, TomlConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// In-flight records not updated for this long are presumed dead
    pub stall_timeout: Duration,
    /// Temporary failures become claimable after `stall_timeout * requeue_multiplier`
    pub requeue_multiplier: u32,
    pub expiration: ExpirationPolicy,
    /// Suggested client re-poll delay while work is in flight
    pub poll_interval: Duration,
    /// Stop suggesting re-polls after this many attempts
    pub max_poll_attempts: Option<u32>,
    /// Services running at once within one tier
    pub max_concurrent_services: usize,
    pub menu_skip: MenuSkipPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            requeue_multiplier: 10,
            expiration: ExpirationPolicy::disabled(),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: None,
            max_concurrent_services: 8,
            menu_skip: MenuSkipPolicy::Disabled,
        }
    }
}

impl DispatchConfig {
    pub fn from_toml(config: &TomlConfig) -> Result<Self> {
        validate(config)?;
        let section = &config.dispatch;

        let mut expiration = ExpirationPolicy::disabled();
        if let Some(secs) = section.response_expire_interval_secs {
            expiration = expiration.with_ttl(Duration::from_secs(secs));
        }
        if let Some(expression) = &section.response_expire_schedule {
            expiration = expiration.with_schedule(expression)?;
        }

        Ok(Self {
            stall_timeout: Duration::from_secs(section.stall_timeout_secs),
            requeue_multiplier: section.requeue_multiplier,
            expiration,
            poll_interval: Duration::from_secs(section.poll_interval_secs),
            max_poll_attempts: section.max_poll_attempts,
            max_concurrent_services: section.max_concurrent_services,
            menu_skip: MenuSkipPolicy::from_config(&config.menu_skip)?,
        })
    }

    /// Age of a temporary failure after which it is claimed again
    pub fn requeue_threshold(&self) -> Duration {
        self.stall_timeout.saturating_mul(self.requeue_multiplier)
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn with_expiration(mut self, expiration: ExpirationPolicy) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_menu_skip(mut self, menu_skip: MenuSkipPolicy) -> Self {
        self.menu_skip = menu_skip;
        self
    }
}
