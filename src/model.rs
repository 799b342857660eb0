//! Core data model.
//!
//! A unit of work is one logical task carried by a queue message. It has
//! identity, a creation time, and the limits that bound its redelivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Unit of work
// ---------------------------------------------------------------------------

/// Business payload carried by a queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Stable identity. Locks and try-counts are keyed by it, so duplicate
    /// deliveries of the same unit share them.
    pub id: String,

    /// Creation time, seconds since the Unix epoch.
    pub creation_epoch: i64,

    /// How long after creation the unit may still be retried.
    #[serde(default)]
    pub max_age_seconds: Limit,

    /// Attempt ceiling. A unit is not requeued once its try-count reaches it.
    #[serde(default)]
    pub max_retries: Limit,

    /// Opaque input for the business processor.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl UnitOfWork {
    /// A unit created now with unlimited age and retries.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            creation_epoch: Utc::now().timestamp(),
            max_age_seconds: Limit::Unlimited,
            max_retries: Limit::Unlimited,
            payload: serde_json::Value::Null,
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.creation_epoch = at.timestamp();
        self
    }

    pub fn max_age_seconds(mut self, limit: Limit) -> Self {
        self.max_age_seconds = limit;
        self
    }

    pub fn max_retries(mut self, limit: Limit) -> Self {
        self.max_retries = limit;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Limit
// ---------------------------------------------------------------------------

/// An optional ceiling. Encoded as an integer on the wire, `-1` = unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Limit {
    #[default]
    Unlimited,
    AtMost(u32),
}

impl Limit {
    pub fn value(self) -> Option<u32> {
        match self {
            Limit::Unlimited => None,
            Limit::AtMost(n) => Some(n),
        }
    }
}

impl TryFrom<i64> for Limit {
    type Error = String;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            -1 => Ok(Limit::Unlimited),
            n => u32::try_from(n)
                .map(Limit::AtMost)
                .map_err(|_| format!("invalid limit {n}: expected -1 or 0..={}", u32::MAX)),
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Unlimited => -1,
            Limit::AtMost(n) => i64::from(n),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::AtMost(n) => write!(f, "{n}"),
        }
    }
}
