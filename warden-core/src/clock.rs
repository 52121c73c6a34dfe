/// Wall-clock source for registry timestamps.
///
/// Registry values are compared across processes, so implementations must
/// report Unix seconds, not a process-local monotonic reading.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}
