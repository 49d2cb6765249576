use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

/// Processing status of a single URL within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    #[default]
    Unprocessed,
    InProgress,
    Done,
    Failed,
    Rejected,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Unprocessed => "unprocessed",
            UrlStatus::InProgress => "in_progress",
            UrlStatus::Done => "done",
            UrlStatus::Failed => "failed",
            UrlStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrlStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(UrlStatus::Unprocessed),
            "in_progress" => Ok(UrlStatus::InProgress),
            "done" => Ok(UrlStatus::Done),
            "failed" => Ok(UrlStatus::Failed),
            "rejected" => Ok(UrlStatus::Rejected),
            other => Err(format!("unknown url status '{}'", other)),
        }
    }
}

/// Per-URL record stored as one JSON hash field value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UrlState {
    #[serde(default)]
    pub worker_id: String,
    pub status: UrlStatus,
}

impl UrlState {
    pub fn new(status: UrlStatus) -> Self {
        Self {
            worker_id: String::new(),
            status,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(raw)?)
    }
}
