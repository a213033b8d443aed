//! Tunable limits and parameters for the backend. Every knob can be
//! overridden with an environment variable of the same name; defaults are
//! chosen for a single-node self-hosted deployment.

use std::{
    env,
    fmt::Display,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

fn env_config<T: FromStr + Display + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Failed to parse {name}={value}, using default {default}");
                default
            },
        },
        Err(_) => default,
    }
}

/// Minimum slack added on top of a claimed upload size when computing the
/// stream ceiling. The ceiling is `claimed + max(claimed / 20, this floor)`,
/// absorbing transport-encoding overhead without tolerating runaway bodies.
pub static UPLOAD_SIZE_TOLERANCE_FLOOR_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("UPLOAD_SIZE_TOLERANCE_FLOOR_BYTES", 1 << 20));

/// How far the actually-written byte count may exceed the claimed size
/// before the upload is rejected as a size mismatch, and how far it may
/// undershoot before the surplus reservation is returned.
pub static UPLOAD_HARD_TOLERANCE_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("UPLOAD_HARD_TOLERANCE_BYTES", 1 << 20));

/// Largest chunk a multipart client may send in a single part request. Burned
/// into every upload token at initiate time.
pub static MULTIPART_MAX_CHUNK_SIZE_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("MULTIPART_MAX_CHUNK_SIZE_BYTES", 16 << 20));

/// Lifetime of a multipart session and its upload token.
pub static MULTIPART_SESSION_TTL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("MULTIPART_SESSION_TTL_SECS", 24 * 60 * 60))
});

/// How often the background sweeper looks for expired multipart sessions.
pub static SESSION_SWEEP_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SESSION_SWEEP_INTERVAL_SECS", 10 * 60)));

/// Upper bound on breadcrumb walks, defeating pathological tree depth.
pub static MAX_BREADCRUMB_DEPTH: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_BREADCRUMB_DEPTH", 512));

/// Maximum number of entries returned by the `Recent` listing.
pub static RECENT_LISTING_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("RECENT_LISTING_LIMIT", 50));

/// Whether state mutations append to the sync-event feed. Off by default;
/// see the design notes on the known-buggy upstream writer.
pub static SYNC_EVENTS_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("SYNC_EVENTS_ENABLED", false));

/// Storage allowance of the bootstrap tier created on first startup.
pub static DEFAULT_TIER_LIMIT_BYTES: LazyLock<u64> =
    LazyLock::new(|| env_config("DEFAULT_TIER_LIMIT_BYTES", 10 << 30));
