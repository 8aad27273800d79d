/// Tunables for an open database. `Default` matches `from_env` with no
/// `VECLITE_*` variables set.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Use a WAL journal. Turning this off falls back to SQLite's default.
    pub wal: bool,
    /// Maximum bound parameters per statement; `IN (...)` projections are
    /// chunked to stay under it.
    pub max_sql_vars: usize,
    /// Floor for the hybrid candidate pool: each leg collects
    /// `max(topk * 4, hybrid_pool_floor)` hits before fusion.
    pub hybrid_pool_floor: usize,
    /// When set, deletes trigger compaction once the tombstone ratio of a
    /// vector file reaches this value. Unset leaves compaction explicit.
    pub auto_compact_tombstone_ratio: Option<f32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wal: true,
            max_sql_vars: 900,
            hybrid_pool_floor: 50,
            auto_compact_tombstone_ratio: None,
        }
    }
}

impl ClientOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            busy_timeout_ms: resolve_u64("VECLITE_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms),
            wal: resolve_bool("VECLITE_WAL", defaults.wal),
            max_sql_vars: resolve_usize("VECLITE_MAX_SQL_VARS", defaults.max_sql_vars).max(16),
            hybrid_pool_floor: resolve_usize("VECLITE_HYBRID_POOL_FLOOR", defaults.hybrid_pool_floor)
                .max(1),
            auto_compact_tombstone_ratio: resolve_ratio("VECLITE_AUTO_COMPACT_RATIO"),
        }
    }
}

fn resolve_u64(env: &str, default: u64) -> u64 {
    std::env::var(env)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_usize(env: &str, default: usize) -> usize {
    std::env::var(env)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_bool(env: &str, default: bool) -> bool {
    match std::env::var(env) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn resolve_ratio(env: &str) -> Option<f32> {
    let ratio: f32 = std::env::var(env).ok()?.parse().ok()?;
    (ratio > 0.0 && ratio <= 1.0).then_some(ratio)
}
