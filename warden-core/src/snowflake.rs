//! Snowflake ids seeded with the allocated node id
//!
//! Layout: 41 bits of milliseconds since [`EPOCH_MS`], 10 bits of node id,
//! 12 bits of per-millisecond sequence.
//!
//! Generation fails instead of waiting when the wall clock moves behind the
//! last issued timestamp.

use crate::error::{Result, WardenError};
use std::sync::Mutex;

/// 2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const NODE_MAX: u32 = (1 << NODE_BITS) - 1;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const TIME_SHIFT: u32 = NODE_BITS + STEP_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    pub timestamp_ms: i64,
    pub node_id: u32,
    pub step: u32,
}

struct GeneratorState {
    last_ms: i64,
    step: i64,
}

pub struct SnowflakeGenerator {
    node_id: u32,
    state: Mutex<GeneratorState>,
    now_ms: fn() -> i64,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u32) -> Result<Self> {
        Self::with_time_source(node_id, current_ms)
    }

    fn with_time_source(node_id: u32, now_ms: fn() -> i64) -> Result<Self> {
        if node_id > NODE_MAX {
            return Err(WardenError::Config(format!(
                "snowflake node id must be <= {}, got {}",
                NODE_MAX, node_id
            )));
        }

        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                step: 0,
            }),
            now_ms,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn generate(&self) -> Result<i64> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = self.checked_now(state.last_ms)?;

        if now == state.last_ms {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                // sequence exhausted for this millisecond
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = self.checked_now(state.last_ms)?;
                }
            }
        } else {
            state.step = 0;
        }

        state.last_ms = now;

        Ok(((now - EPOCH_MS) << TIME_SHIFT) | ((self.node_id as i64) << STEP_BITS) | state.step)
    }

    fn checked_now(&self, last_ms: i64) -> Result<i64> {
        let now = (self.now_ms)();
        if now < last_ms {
            return Err(WardenError::Internal(format!(
                "clock moved backwards by {}ms, refusing to generate id",
                last_ms - now
            )));
        }
        Ok(now)
    }

    pub fn decompose(id: i64) -> SnowflakeParts {
        SnowflakeParts {
            timestamp_ms: (id >> TIME_SHIFT) + EPOCH_MS,
            node_id: ((id >> STEP_BITS) & NODE_MAX as i64) as u32,
            step: (id & STEP_MASK) as u32,
        }
    }
}

fn current_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
