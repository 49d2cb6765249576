// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // Store
    pub const DEFAULT_REDIS_URL: &'static str = "redis://localhost:6379";
    pub const SCAN_COUNT: usize = 200;
    pub const DEFAULT_LIST_LIMIT: usize = 100;

    // Worker liveness
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
    pub const STALE_AFTER_SECS: u64 = 120;

    // Stats watcher reconnects
    pub const WATCH_BACKOFF_BASE_MS: u64 = 250;
    pub const WATCH_BACKOFF_MAX_MS: u64 = 30_000;
}
