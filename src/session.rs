//! Read/write handle for the shared state of one crawl session.
//!
//! Every call is a round trip to Redis; nothing is cached locally so all workers holding a
//! handle for the same id see each other's writes. Counters are `HINCRBY`, URL
//! registration is `HSETNX`, and content membership is a set. There is no
//! cross-command transaction except where a script or an atomic pipeline is noted.

use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::SessionError;
use crate::keys::{self, SessionKeys};
use crate::models::{
    self, HintStatus, SessionMeta, SessionStatus, FIELD_COMPLETE_TASKS, FIELD_CRAWLED_CONTENT,
    FIELD_EVALUATED_CONTENT, FIELD_FAILED_TASKS, FIELD_LAST_REPORTED_STATUS,
    FIELD_REJECTED_TASKS, FIELD_SINCE_LAST_TAGGED, FIELD_STATUS, FIELD_TOTAL_TASKS,
};
use crate::notifications::StatsEventKind;
use crate::store::StoreHandle;
use crate::url_state::{UrlState, UrlStatus};

// KEYS[1] = url hash, KEYS[2] = meta hash
// ARGV[1] = url, ARGV[2] = encoded state, ARGV[3] = total counter field
const ADD_URL_LUA: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
    redis.call('HINCRBY', KEYS[2], ARGV[3], 1)
    return 1
end
return 0
"#;

// KEYS[1] = url hash
// ARGV[1] = url, ARGV[2] = field name, ARGV[3] = new value
const PATCH_URL_FIELD_LUA: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
    return 0
end
local state = cjson.decode(raw)
state[ARGV[2]] = ARGV[3]
redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(state))
return 1
"#;

static ADD_URL: LazyLock<Script> = LazyLock::new(|| Script::new(ADD_URL_LUA));
static PATCH_URL_FIELD: LazyLock<Script> = LazyLock::new(|| Script::new(PATCH_URL_FIELD_LUA));

#[derive(Clone)]
pub struct Session {
    id: String,
    keys: SessionKeys,
    channel: String,
    store: StoreHandle,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.store.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(id: String, store: StoreHandle) -> Self {
        let keys = SessionKeys::new(&id);
        let channel = keys::stats_channel(&id);
        Self {
            id,
            keys,
            channel,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    // Metadata

    /// Full metadata record. Fails if the session is absent or a required field is missing.
    pub async fn get_meta(&self) -> Result<SessionMeta, SessionError> {
        let mut conn = self.store.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(&self.keys.meta).await?;
        if fields.is_empty() {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        SessionMeta::from_fields(&fields)
    }

    /// Schema check: current version and every required field present.
    pub async fn is_valid(&self) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(&self.keys.meta).await?;
        Ok(models::fields_are_current(&fields))
    }

    pub async fn exists(&self) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.exists(&self.keys.meta).await?)
    }

    /// Write the lifecycle status and broadcast `status_change` in the same transaction.
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn set_status(&self, status: SessionStatus) -> Result<(), SessionError> {
        let mut conn = self.store.conn()?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.meta, FIELD_STATUS, status.as_i64())
            .ignore()
            .publish(&self.channel, StatsEventKind::StatusChange.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::info!(?status, "Session status changed");
        Ok(())
    }

    pub async fn get_status(&self) -> Result<SessionStatus, SessionError> {
        let mut conn = self.store.conn()?;
        let raw: Option<String> = conn.hget(&self.keys.meta, FIELD_STATUS).await?;
        match raw {
            Some(raw) => models::decode_session_status(&raw),
            None => Err(SessionError::NotFound(self.id.clone())),
        }
    }

    pub async fn is_stopped(&self) -> Result<bool, SessionError> {
        Ok(self.get_status().await? == SessionStatus::Stopped)
    }

    /// Metadata carries a status and that status is not `Stopped`.
    ///
    /// A hash without `status` is not a live session: it is what a late counter
    /// increment leaves behind after removal.
    pub async fn is_alive(&self) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        let raw: Option<String> = conn.hget(&self.keys.meta, FIELD_STATUS).await?;
        match raw {
            Some(raw) => Ok(models::decode_session_status(&raw)? != SessionStatus::Stopped),
            None => Ok(false),
        }
    }

    /// Plain write, not broadcast.
    pub async fn set_last_reported_status(&self, status: HintStatus) -> Result<(), SessionError> {
        let mut conn = self.store.conn()?;
        let _: () = conn
            .hset(&self.keys.meta, FIELD_LAST_REPORTED_STATUS, status.as_i64())
            .await?;
        Ok(())
    }

    pub async fn get_last_reported_status(&self) -> Result<HintStatus, SessionError> {
        let mut conn = self.store.conn()?;
        let raw: Option<String> = conn
            .hget(&self.keys.meta, FIELD_LAST_REPORTED_STATUS)
            .await?;
        match raw {
            Some(raw) => models::decode_hint_status(&raw),
            None => Err(SessionError::NotFound(self.id.clone())),
        }
    }

    // URL state

    /// Register a URL as unprocessed. Returns true only for the caller that created the
    /// entry; `total_tasks` is incremented in the same script so it counts each URL once.
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn add_url(&self, url: &str) -> Result<bool, SessionError> {
        let encoded = UrlState::new(UrlStatus::Unprocessed).to_json()?;
        let mut conn = self.store.conn()?;
        let created: i64 = ADD_URL
            .key(&self.keys.urls)
            .key(&self.keys.meta)
            .arg(url)
            .arg(encoded)
            .arg(FIELD_TOTAL_TASKS)
            .invoke_async(&mut conn)
            .await?;

        if created == 1 {
            tracing::debug!("Registered new url");
        }
        Ok(created == 1)
    }

    pub async fn has_url(&self, url: &str) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.hexists(&self.keys.urls, url).await?)
    }

    pub async fn get_url_state(&self, url: &str) -> Result<Option<UrlState>, SessionError> {
        let mut conn = self.store.conn()?;
        let raw: Option<String> = conn.hget(&self.keys.urls, url).await?;
        raw.map(|r| UrlState::from_json(&r)).transpose()
    }

    /// Whole-record overwrite.
    pub async fn set_url_state(&self, url: &str, state: &UrlState) -> Result<(), SessionError> {
        let encoded = state.to_json()?;
        let mut conn = self.store.conn()?;
        let _: () = conn.hset(&self.keys.urls, url, encoded).await?;
        Ok(())
    }

    pub async fn get_url_worker(&self, url: &str) -> Result<Option<String>, SessionError> {
        Ok(self.get_url_state(url).await?.map(|s| s.worker_id))
    }

    /// Patch only `worker_id`. Returns false when the URL was never added.
    pub async fn set_url_worker(&self, url: &str, worker_id: &str) -> Result<bool, SessionError> {
        self.patch_url_field(url, "worker_id", worker_id).await
    }

    /// Patch only `status`. Returns false when the URL was never added.
    pub async fn set_url_status(&self, url: &str, status: UrlStatus) -> Result<bool, SessionError> {
        self.patch_url_field(url, "status", status.as_str()).await
    }

    async fn patch_url_field(
        &self,
        url: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        let patched: i64 = PATCH_URL_FIELD
            .key(&self.keys.urls)
            .arg(url)
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        if patched == 0 {
            tracing::warn!(session_id = %self.id, url, field, "Patch skipped, url was never added");
        }
        Ok(patched == 1)
    }

    /// Number of URL entries; compare with `total_tasks` to audit counting.
    pub async fn url_count(&self) -> Result<u64, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.hlen(&self.keys.urls).await?)
    }

    // Content set

    pub async fn add_content(&self, url: &str) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        let added: i64 = conn.sadd(&self.keys.content, url).await?;
        Ok(added == 1)
    }

    pub async fn has_content(&self, url: &str) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.sismember(&self.keys.content, url).await?)
    }

    // Counters

    pub async fn inc_complete_urls(&self) -> Result<(), SessionError> {
        self.inc_counter(FIELD_COMPLETE_TASKS, StatsEventKind::CompleteTasks)
            .await
    }

    pub async fn inc_failed_urls(&self) -> Result<(), SessionError> {
        self.inc_counter(FIELD_FAILED_TASKS, StatsEventKind::FailedTasks)
            .await
    }

    pub async fn inc_rejected_urls(&self) -> Result<(), SessionError> {
        self.inc_counter(FIELD_REJECTED_TASKS, StatsEventKind::RejectedTasks)
            .await
    }

    pub async fn inc_crawled_content(&self) -> Result<(), SessionError> {
        self.inc_counter(FIELD_CRAWLED_CONTENT, StatsEventKind::CrawledContent)
            .await
    }

    pub async fn inc_evaluated_content(&self) -> Result<(), SessionError> {
        self.inc_counter(FIELD_EVALUATED_CONTENT, StatsEventKind::EvaluatedContent)
            .await
    }

    async fn inc_counter(&self, field: &str, event: StatsEventKind) -> Result<(), SessionError> {
        let mut conn = self.store.conn()?;
        let _: () = redis::pipe()
            .atomic()
            .hincr(&self.keys.meta, field, 1)
            .ignore()
            .publish(&self.channel, event.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    // Tags

    /// Bump the kept counter, or the separate keepout counter when the tag was filtered.
    pub async fn inc_tag_usage(&self, tag_id: &str, keepout: bool) -> Result<(), SessionError> {
        let mut conn = self.store.conn()?;
        let _: i64 = conn
            .hincr(&self.keys.tags, keys::tag_field(tag_id, keepout), 1)
            .await?;
        Ok(())
    }

    /// Returns `(usage, keepout)`, absent counters read as zero.
    pub async fn get_tag_usage(&self, tag_id: &str) -> Result<(u64, u64), SessionError> {
        let mut conn = self.store.conn()?;
        let (usage, keepout): (Option<u64>, Option<u64>) = redis::cmd("HMGET")
            .arg(&self.keys.tags)
            .arg(keys::tag_field(tag_id, false))
            .arg(keys::tag_field(tag_id, true))
            .query_async(&mut conn)
            .await?;
        Ok((usage.unwrap_or(0), keepout.unwrap_or(0)))
    }

    pub async fn inc_since_last_tagged(&self) -> Result<u64, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn
            .hincr(&self.keys.meta, FIELD_SINCE_LAST_TAGGED, 1)
            .await?)
    }

    /// Overwrite with zero.
    pub async fn reset_since_last_tagged(&self) -> Result<(), SessionError> {
        let mut conn = self.store.conn()?;
        let _: () = conn
            .hset(&self.keys.meta, FIELD_SINCE_LAST_TAGGED, 0)
            .await?;
        Ok(())
    }

    pub async fn get_since_last_tagged(&self) -> Result<u64, SessionError> {
        let mut conn = self.store.conn()?;
        let value: Option<u64> = conn
            .hget(&self.keys.meta, FIELD_SINCE_LAST_TAGGED)
            .await?;
        Ok(value.unwrap_or(0))
    }

    // Heartbeats

    pub async fn add_heartbeat(&self, worker_id: &str) -> Result<(), SessionError> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.store.conn()?;
        let _: () = conn.hset(&self.keys.heartbeat, worker_id, now).await?;
        Ok(())
    }

    /// Unix seconds of the last heartbeat, 0 if the worker was never seen.
    pub async fn get_heartbeat(&self, worker_id: &str) -> Result<i64, SessionError> {
        let mut conn = self.store.conn()?;
        let value: Option<i64> = conn.hget(&self.keys.heartbeat, worker_id).await?;
        Ok(value.unwrap_or(0))
    }

    pub async fn get_heartbeats(&self) -> Result<HashMap<String, i64>, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.hgetall(&self.keys.heartbeat).await?)
    }
}
