use std::{
    ops::Add,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Wall-clock time in milliseconds since the Unix epoch. All persisted
/// timestamps (node lifecycle, token issuance, session expiry) use this
/// representation.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: UnixTimestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, delta: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + delta.as_millis() as u64)
    }
}

/// The seam between the core and its environment: a source of wall time and
/// fresh identifiers. Production uses the system clock; tests substitute a
/// steppable clock so expiry paths are deterministic.
pub trait Runtime: Clone + Send + Sync + 'static {
    fn unix_timestamp(&self) -> UnixTimestamp;
    fn new_uuid_v4(&self) -> Uuid;
}

#[derive(Clone, Default)]
pub struct ProdRuntime;

impl ProdRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for ProdRuntime {
    fn unix_timestamp(&self) -> UnixTimestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch");
        UnixTimestamp::from_millis(since_epoch.as_millis() as u64)
    }

    fn new_uuid_v4(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::{
        Runtime,
        UnixTimestamp,
    };

    /// Deterministic runtime for tests. Starts at an arbitrary fixed instant
    /// and only moves when `advance` is called.
    #[derive(Clone)]
    pub struct TestRuntime {
        now_ms: Arc<Mutex<u64>>,
    }

    impl TestRuntime {
        pub fn new() -> Self {
            // 2024-01-01T00:00:00Z
            Self {
                now_ms: Arc::new(Mutex::new(1_704_067_200_000)),
            }
        }

        pub fn advance(&self, delta: Duration) {
            *self.now_ms.lock() += delta.as_millis() as u64;
        }
    }

    impl Runtime for TestRuntime {
        fn unix_timestamp(&self) -> UnixTimestamp {
            UnixTimestamp::from_millis(*self.now_ms.lock())
        }

        fn new_uuid_v4(&self) -> Uuid {
            Uuid::new_v4()
        }
    }
}
