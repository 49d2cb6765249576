//! Storage key layout for one crawl session.
//!
//! Every key is a fixed prefix followed by the session id. The prefixes are part of the
//! persisted format and must not change between schema versions.

pub const META_PREFIX: &str = "meta:";
pub const URLS_PREFIX: &str = "urls:";
pub const CONTENT_PREFIX: &str = "content:";
pub const TAGS_PREFIX: &str = "tags:";
pub const HEARTBEAT_PREFIX: &str = "heartbeat:";
pub const STATS_CHANNEL_PREFIX: &str = "stats_channel_";

/// Field prefix for tag counters that were seen but filtered out.
pub const KEEPOUT_TAG_PREFIX: &str = "n/";

/// The five storage keys owned by a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub meta: String,
    pub urls: String,
    pub content: String,
    pub tags: String,
    pub heartbeat: String,
}

impl SessionKeys {
    pub fn new(session_id: &str) -> Self {
        Self {
            meta: meta_key(session_id),
            urls: urls_key(session_id),
            content: content_key(session_id),
            tags: tags_key(session_id),
            heartbeat: heartbeat_key(session_id),
        }
    }

    /// All keys in deletion order, metadata first.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.meta,
            &self.urls,
            &self.content,
            &self.tags,
            &self.heartbeat,
        ]
    }
}

pub fn meta_key(session_id: &str) -> String {
    format!("{}{}", META_PREFIX, session_id)
}

pub fn urls_key(session_id: &str) -> String {
    format!("{}{}", URLS_PREFIX, session_id)
}

pub fn content_key(session_id: &str) -> String {
    format!("{}{}", CONTENT_PREFIX, session_id)
}

pub fn tags_key(session_id: &str) -> String {
    format!("{}{}", TAGS_PREFIX, session_id)
}

pub fn heartbeat_key(session_id: &str) -> String {
    format!("{}{}", HEARTBEAT_PREFIX, session_id)
}

/// Pattern matching every metadata key, used by `SCAN`.
pub fn meta_key_pattern() -> String {
    format!("{}*", META_PREFIX)
}

pub fn stats_channel(session_id: &str) -> String {
    format!("{}{}", STATS_CHANNEL_PREFIX, session_id)
}

/// Pattern channel covering the stats of every session.
pub fn stats_channel_mask() -> String {
    format!("{}*", STATS_CHANNEL_PREFIX)
}

/// Strip a fixed-length prefix to recover the session id.
///
/// Returns `None` when the name is not longer than the prefix.
pub fn strip_prefix_len(name: &str, prefix_len: usize) -> Option<&str> {
    match name.get(prefix_len..) {
        Some(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

pub fn session_id_from_channel(channel: &str) -> Option<&str> {
    strip_prefix_len(channel, STATS_CHANNEL_PREFIX.len())
}

pub fn session_id_from_meta_key(key: &str) -> Option<&str> {
    strip_prefix_len(key, META_PREFIX.len())
}

/// Hash field holding the usage counter for a tag.
pub fn tag_field(tag_id: &str, keepout: bool) -> String {
    if keepout {
        format!("{}{}", KEEPOUT_TAG_PREFIX, tag_id)
    } else {
        tag_id.to_string()
    }
}
