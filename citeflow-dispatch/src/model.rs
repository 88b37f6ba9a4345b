//! Domain types shared by the store, the executor and the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Highest foreground level, written `9`
pub const MAX_FOREGROUND_LEVEL: u8 = 9;

/// Highest background level, written `z`
pub const MAX_BACKGROUND_LEVEL: u8 = 25;

/// Priority tier of a service
///
/// Tiers are totally ordered: every foreground tier sorts before every
/// background tier. The textual form is a digit `0`-`9` for foreground
/// tiers and a lowercase letter `a`-`z` for background tiers. Levels are
/// range-checked at construction, so every tier has a textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tier {
    class: TierClass,
    level: u8,
}

/// Field order matters: foreground sorts first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum TierClass {
    /// Runs on the caller's path; the caller waits for it
    Foreground,
    /// Runs on a detached worker after the call returns
    Background,
}

impl Tier {
    /// Foreground tier `0`-`9`
    pub fn foreground(level: u8) -> Result<Self, String> {
        if level > MAX_FOREGROUND_LEVEL {
            return Err(format!(
                "foreground level {} out of range 0-{}",
                level, MAX_FOREGROUND_LEVEL
            ));
        }
        Ok(Self {
            class: TierClass::Foreground,
            level,
        })
    }

    /// Background tier `a`-`z`, level 0 being `a`
    pub fn background(level: u8) -> Result<Self, String> {
        if level > MAX_BACKGROUND_LEVEL {
            return Err(format!(
                "background level {} out of range 0-{}",
                level, MAX_BACKGROUND_LEVEL
            ));
        }
        Ok(Self {
            class: TierClass::Background,
            level,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_foreground(&self) -> bool {
        self.class == TierClass::Foreground
    }

    pub fn is_background(&self) -> bool {
        self.class == TierClass::Background
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            TierClass::Foreground => write!(f, "{}", self.level),
            TierClass::Background => write!(f, "{}", char::from(b'a' + self.level)),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c @ '0'..='9'), None) => Tier::foreground(c as u8 - b'0'),
            (Some(c @ 'a'..='z'), None) => Tier::background(c as u8 - b'a'),
            _ => Err(format!("invalid tier '{}': expected 0-9 or a-z", s)),
        }
    }
}

impl TryFrom<String> for Tier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tier> for String {
    fn from(tier: Tier) -> Self {
        tier.to_string()
    }
}

/// Status of one (request, service) dispatch record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    InProgress,
    Completed,
    FailedTemporary,
    FailedFatal,
}

impl DispatchStatus {
    /// Stored column value
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Queued => "queued",
            DispatchStatus::InProgress => "in_progress",
            DispatchStatus::Completed => "completed",
            DispatchStatus::FailedTemporary => "failed_temporary",
            DispatchStatus::FailedFatal => "failed_fatal",
        }
    }

    /// Queued or InProgress
    pub fn is_in_flight(&self) -> bool {
        matches!(self, DispatchStatus::Queued | DispatchStatus::InProgress)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            DispatchStatus::FailedTemporary | DispatchStatus::FailedFatal
        )
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DispatchStatus::Queued),
            "in_progress" => Ok(DispatchStatus::InProgress),
            "completed" => Ok(DispatchStatus::Completed),
            "failed_temporary" => Ok(DispatchStatus::FailedTemporary),
            "failed_fatal" => Ok(DispatchStatus::FailedFatal),
            other => Err(format!("unknown dispatch status '{}'", other)),
        }
    }
}

/// One resolution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    /// Identity of the referring source (e.g. an `rfr_id`)
    pub referrer: Option<String>,
    pub client_ip: Option<IpAddr>,
    /// Institution context, if already known
    pub institution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes of a request on first contact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub referrer: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub institution: Option<String>,
}

/// Join record between one request and one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedService {
    pub request_id: Uuid,
    pub service_id: String,
    pub status: DispatchStatus,
    pub failure_detail: Option<String>,
    /// Claim time
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One result item produced by a completed service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: Uuid,
    pub request_id: Uuid,
    pub service_id: String,
    /// Value-type tag, e.g. `fulltext` or `holding`
    pub service_type_value: String,
    pub payload: serde_json::Value,
    /// False when the target refuses to be framed
    pub embeddable: bool,
    pub created_at: DateTime<Utc>,
}

/// A result item as produced by a service, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewServiceResponse {
    pub service_type_value: String,
    pub payload: serde_json::Value,
    pub embeddable: bool,
}
