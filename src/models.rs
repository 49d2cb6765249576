use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::SessionError;

/// Bumped whenever the set of required metadata fields changes.
pub const SCHEMA_VERSION: u32 = 3;

pub const FIELD_VERSION: &str = "version";
pub const FIELD_HINT_ID: &str = "hint_id";
pub const FIELD_URL: &str = "url";
pub const FIELD_TOTAL_TASKS: &str = "total_tasks";
pub const FIELD_COMPLETE_TASKS: &str = "complete_tasks";
pub const FIELD_FAILED_TASKS: &str = "failed_tasks";
pub const FIELD_REJECTED_TASKS: &str = "rejected_tasks";
pub const FIELD_CRAWLED_CONTENT: &str = "crawled_content";
pub const FIELD_EVALUATED_CONTENT: &str = "evaluated_content";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_LAST_REPORTED_STATUS: &str = "last_reported_status";
pub const FIELD_SINCE_LAST_TAGGED: &str = "since_last_tagged";

/// Fields that must be present for a metadata record to be usable.
pub const REQUIRED_FIELDS: [&str; 11] = [
    FIELD_VERSION,
    FIELD_HINT_ID,
    FIELD_URL,
    FIELD_TOTAL_TASKS,
    FIELD_COMPLETE_TASKS,
    FIELD_FAILED_TASKS,
    FIELD_REJECTED_TASKS,
    FIELD_CRAWLED_CONTENT,
    FIELD_EVALUATED_CONTENT,
    FIELD_STATUS,
    FIELD_LAST_REPORTED_STATUS,
];

/// Lifecycle of a session. Workers stop fetching new work once it is `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Normal = 0,
    Stopped = 1,
}

impl SessionStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SessionStatus::Normal),
            1 => Some(SessionStatus::Stopped),
            _ => None,
        }
    }
}

/// Last crawl-hint status flushed to the external reporting system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintStatus {
    #[default]
    Unprocessed = 0,
    Crawling = 1,
    Finished = 2,
    Failed = 3,
    Stopped = 4,
}

impl HintStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(HintStatus::Unprocessed),
            1 => Some(HintStatus::Crawling),
            2 => Some(HintStatus::Finished),
            3 => Some(HintStatus::Failed),
            4 => Some(HintStatus::Stopped),
            _ => None,
        }
    }
}

/// Decoded metadata hash of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub hint_id: String,
    pub url: String,
    pub total_tasks: u64,
    pub complete_tasks: u64,
    pub failed_tasks: u64,
    pub rejected_tasks: u64,
    pub crawled_content: u64,
    pub evaluated_content: u64,
    pub status: SessionStatus,
    pub last_reported_status: HintStatus,
    pub since_last_tagged: u64,
}

impl SessionMeta {
    /// Metadata written by `SessionManager::create`: every counter at zero.
    pub fn initial(hint_id: &str, url: &str) -> Self {
        Self {
            version: SCHEMA_VERSION,
            hint_id: hint_id.to_string(),
            url: url.to_string(),
            total_tasks: 0,
            complete_tasks: 0,
            failed_tasks: 0,
            rejected_tasks: 0,
            crawled_content: 0,
            evaluated_content: 0,
            status: SessionStatus::Normal,
            last_reported_status: HintStatus::Unprocessed,
            since_last_tagged: 0,
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_VERSION, self.version.to_string()),
            (FIELD_HINT_ID, self.hint_id.clone()),
            (FIELD_URL, self.url.clone()),
            (FIELD_TOTAL_TASKS, self.total_tasks.to_string()),
            (FIELD_COMPLETE_TASKS, self.complete_tasks.to_string()),
            (FIELD_FAILED_TASKS, self.failed_tasks.to_string()),
            (FIELD_REJECTED_TASKS, self.rejected_tasks.to_string()),
            (FIELD_CRAWLED_CONTENT, self.crawled_content.to_string()),
            (FIELD_EVALUATED_CONTENT, self.evaluated_content.to_string()),
            (FIELD_STATUS, self.status.as_i64().to_string()),
            (
                FIELD_LAST_REPORTED_STATUS,
                self.last_reported_status.as_i64().to_string(),
            ),
            (FIELD_SINCE_LAST_TAGGED, self.since_last_tagged.to_string()),
        ]
    }

    /// Decode a raw hash. Missing or malformed required fields are errors.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, SessionError> {
        let since_last_tagged = match fields.get(FIELD_SINCE_LAST_TAGGED) {
            Some(raw) => parse_value(FIELD_SINCE_LAST_TAGGED, raw)?,
            None => 0,
        };

        Ok(Self {
            version: parse_field(fields, FIELD_VERSION)?,
            hint_id: required(fields, FIELD_HINT_ID)?.to_string(),
            url: required(fields, FIELD_URL)?.to_string(),
            total_tasks: parse_field(fields, FIELD_TOTAL_TASKS)?,
            complete_tasks: parse_field(fields, FIELD_COMPLETE_TASKS)?,
            failed_tasks: parse_field(fields, FIELD_FAILED_TASKS)?,
            rejected_tasks: parse_field(fields, FIELD_REJECTED_TASKS)?,
            crawled_content: parse_field(fields, FIELD_CRAWLED_CONTENT)?,
            evaluated_content: parse_field(fields, FIELD_EVALUATED_CONTENT)?,
            status: decode_session_status(required(fields, FIELD_STATUS)?)?,
            last_reported_status: decode_hint_status(required(
                fields,
                FIELD_LAST_REPORTED_STATUS,
            )?)?,
            since_last_tagged,
        })
    }
}

/// Schema check used by `Session::is_valid`. Never fails.
pub fn fields_are_current(fields: &HashMap<String, String>) -> bool {
    let version_ok = fields
        .get(FIELD_VERSION)
        .and_then(|v| v.parse::<u32>().ok())
        .is_some_and(|v| v >= SCHEMA_VERSION);

    version_ok && REQUIRED_FIELDS.iter().all(|f| fields.contains_key(*f))
}

pub fn decode_session_status(raw: &str) -> Result<SessionStatus, SessionError> {
    let value: i64 = parse_value(FIELD_STATUS, raw)?;
    SessionStatus::from_i64(value).ok_or_else(|| SessionError::InvalidField {
        field: FIELD_STATUS,
        value: raw.to_string(),
    })
}

pub fn decode_hint_status(raw: &str) -> Result<HintStatus, SessionError> {
    let value: i64 = parse_value(FIELD_LAST_REPORTED_STATUS, raw)?;
    HintStatus::from_i64(value).ok_or_else(|| SessionError::InvalidField {
        field: FIELD_LAST_REPORTED_STATUS,
        value: raw.to_string(),
    })
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    field: &'static str,
) -> Result<&'a str, SessionError> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or(SessionError::MissingField { field })
}

fn parse_field<T: FromStr>(
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<T, SessionError> {
    parse_value(field, required(fields, field)?)
}

fn parse_value<T: FromStr>(field: &'static str, raw: &str) -> Result<T, SessionError> {
    raw.trim().parse().map_err(|_| SessionError::InvalidField {
        field,
        value: raw.to_string(),
    })
}
