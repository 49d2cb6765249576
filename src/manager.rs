use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::error::SessionError;
use crate::keys::{self, SessionKeys};
use crate::models::{self, SessionMeta, FIELD_VERSION};
use crate::notifications::{StatsEventKind, StatsSubscription, SubscribeTarget};
use crate::session::Session;
use crate::store::StoreHandle;

/// Outcome of resolving a session id against the store.
#[derive(Debug)]
pub enum SessionLookup {
    NotFound,
    /// Metadata exists but is older than the current schema or lacks required fields.
    Stale {
        session: Session,
        version: Option<u32>,
    },
    Valid(Session),
}

impl SessionLookup {
    pub fn into_valid(self) -> Option<Session> {
        match self {
            SessionLookup::Valid(session) => Some(session),
            _ => None,
        }
    }
}

/// Creates, resolves and removes crawl sessions over one shared Redis connection.
///
/// Pass the manager to whatever needs sessions. After `stop()` the manager and every
/// session it produced fail with `SessionError::Closed`.
#[derive(Clone)]
pub struct SessionManager {
    store: StoreHandle,
    scan_count: usize,
}

impl SessionManager {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, SessionError> {
        let store = StoreHandle::connect(redis_url).await?;
        tracing::info!("Session manager connected to {}", redis_url);

        Ok(Self {
            store,
            scan_count: Config::SCAN_COUNT,
        })
    }

    /// Start a new session with zeroed counters and announce it on its channel.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, hint_id: &str, url: &str) -> Result<Session, SessionError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = self.bind(id);
        let fields = SessionMeta::initial(hint_id, url).to_fields();

        let mut conn = self.store.conn()?;
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&session.keys().meta, &fields)
            .ignore()
            .publish(session.channel(), StatsEventKind::StatusChange.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::info!(session_id = session.id(), "Created session");
        Ok(session)
    }

    /// Existence of the metadata key only.
    pub async fn has(&self, id: &str) -> Result<bool, SessionError> {
        let mut conn = self.store.conn()?;
        Ok(conn.exists(keys::meta_key(id)).await?)
    }

    /// A session that exists under the current schema. Missing and stale both yield `None`;
    /// use `lookup` to tell them apart.
    pub async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.lookup(id).await?.into_valid())
    }

    pub async fn lookup(&self, id: &str) -> Result<SessionLookup, SessionError> {
        let mut conn = self.store.conn()?;
        let fields: HashMap<String, String> = conn.hgetall(keys::meta_key(id)).await?;

        if fields.is_empty() {
            return Ok(SessionLookup::NotFound);
        }

        let session = self.bind(id.to_string());
        if models::fields_are_current(&fields) {
            Ok(SessionLookup::Valid(session))
        } else {
            let version = fields.get(FIELD_VERSION).and_then(|v| v.parse().ok());
            tracing::warn!(session_id = id, ?version, "Session metadata is stale");
            Ok(SessionLookup::Stale { session, version })
        }
    }

    /// Delete every key owned by the session in a single command.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        let keys = SessionKeys::new(id);
        let mut conn = self.store.conn()?;
        let removed: i64 = conn.del(&keys.all()[..]).await?;

        tracing::info!(session_id = id, removed, "Removed session");
        Ok(())
    }

    /// Up to `limit` session ids found by scanning metadata keys. Unordered.
    pub async fn get_ids(&self, limit: usize) -> Result<Vec<String>, SessionError> {
        let mut conn = self.store.conn()?;
        let pattern = keys::meta_key_pattern();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await?;

            for key in batch {
                if ids.len() >= limit {
                    return Ok(ids);
                }
                if let Some(id) = keys::session_id_from_meta_key(&key)
                    && seen.insert(id.to_string())
                {
                    ids.push(id.to_string());
                }
            }

            if next == 0 || ids.len() >= limit {
                return Ok(ids);
            }
            cursor = next;
        }
    }

    pub async fn subscribe(&self, target: SubscribeTarget) -> Result<StatsSubscription, SessionError> {
        StatsSubscription::open(&self.store, target).await
    }

    /// Ping the store. Any failure, including a stopped manager, reads as not ready.
    pub async fn is_ready(&self) -> bool {
        let Ok(mut conn) = self.store.conn() else {
            return false;
        };
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Redis ping failed: {}", e);
                false
            }
        }
    }

    /// Release the shared connection. Sessions from this manager fail with `Closed` and open
    /// subscriptions drop their pub/sub connection and end.
    pub fn stop(&self) {
        self.store.close();
        tracing::info!("Session manager stopped");
    }

    fn bind(&self, id: String) -> Session {
        Session::new(id, self.store.clone())
    }
}
