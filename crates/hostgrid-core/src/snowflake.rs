//! Snowflake ID generation.
//!
//! Ids are 63-bit positive integers laid out as
//!
//! ```text
//! [ timestamp ms since EPOCH_MS : 41 ][ worker id : 10 ][ sequence : 12 ]
//! ```
//!
//! A generator owns one worker id. Its only shared state is the
//! `(last_timestamp, sequence)` pair, guarded by a mutex that is held for
//! the clock read and the bookkeeping, never while sleeping or spinning.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// A generated Snowflake id.
pub type SnowflakeId = i64;

/// Custom epoch: 2024-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

pub const TIMESTAMP_BITS: u32 = 41;
pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;

/// Number of distinct worker ids (0..=1023).
pub const WORKER_ID_SPACE: u16 = 1 << WORKER_ID_BITS;
pub const MAX_WORKER_ID: u16 = WORKER_ID_SPACE - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Default tolerance for a backwards-moving clock.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_millis(50);

/// Result type alias for id generation.
pub type SnowflakeResult<T> = Result<T, SnowflakeError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnowflakeError {
    #[error("worker id {0} out of range (0..={MAX_WORKER_ID})")]
    Range(u32),

    #[error("clock moved backwards by {drift_ms}ms (tolerance {tolerance_ms}ms)")]
    ClockDrift { drift_ms: u64, tolerance_ms: u64 },

    #[error("timestamp exceeds the 41-bit range of the epoch")]
    TimestampOverflow,
}

/// Source of wall-clock milliseconds. Swappable for tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp: u64,
    sequence: u16,
}

/// What happened during one locked bookkeeping pass.
enum Attempt {
    Issued(SnowflakeId),
    SequenceExhausted,
    ClockBehind(u64),
}

/// Thread-safe Snowflake id generator for a single worker id.
pub struct SnowflakeGenerator<C: Clock = SystemClock> {
    worker_id: u16,
    max_drift: Duration,
    clock: C,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator<SystemClock> {
    /// Create a generator on the system clock.
    pub fn new(worker_id: u32) -> SnowflakeResult<Self> {
        Self::with_clock(worker_id, SystemClock, DEFAULT_MAX_CLOCK_DRIFT)
    }
}

impl<C: Clock> SnowflakeGenerator<C> {
    /// Create a generator with an explicit clock and drift tolerance.
    pub fn with_clock(worker_id: u32, clock: C, max_drift: Duration) -> SnowflakeResult<Self> {
        if worker_id > MAX_WORKER_ID as u32 {
            return Err(SnowflakeError::Range(worker_id));
        }
        Ok(Self {
            worker_id: worker_id as u16,
            max_drift,
            clock,
            state: Mutex::new(GeneratorState::default()),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Produce the next id.
    ///
    /// Spins into the next millisecond when the 4096 sequence numbers of
    /// the current one are used up. When the clock is behind the last
    /// issued timestamp, sleeps until it catches up, failing with
    /// [`SnowflakeError::ClockDrift`] once the drift tolerance is spent.
    pub fn next_id(&self) -> SnowflakeResult<SnowflakeId> {
        let mut drift_deadline: Option<Instant> = None;

        loop {
            match self.attempt()? {
                Attempt::Issued(id) => return Ok(id),
                Attempt::SequenceExhausted => std::hint::spin_loop(),
                Attempt::ClockBehind(drift_ms) => {
                    let tolerance_ms = self.max_drift.as_millis() as u64;
                    let deadline =
                        *drift_deadline.get_or_insert_with(|| Instant::now() + self.max_drift);
                    let now = Instant::now();
                    if drift_ms > tolerance_ms || now >= deadline {
                        return Err(SnowflakeError::ClockDrift {
                            drift_ms,
                            tolerance_ms,
                        });
                    }
                    let wait = Duration::from_millis(drift_ms).min(deadline - now);
                    std::thread::sleep(wait.max(Duration::from_micros(100)));
                }
            }
        }
    }

    fn attempt(&self) -> SnowflakeResult<Attempt> {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now_millis();

        if now < state.last_timestamp {
            return Ok(Attempt::ClockBehind(state.last_timestamp - now));
        }

        if now == state.last_timestamp {
            if state.sequence >= MAX_SEQUENCE {
                return Ok(Attempt::SequenceExhausted);
            }
            state.sequence += 1;
        } else {
            state.last_timestamp = now;
            state.sequence = 0;
        }

        let id = compose(now, self.worker_id, state.sequence)?;
        Ok(Attempt::Issued(id))
    }
}

fn compose(timestamp_ms: u64, worker_id: u16, sequence: u16) -> SnowflakeResult<SnowflakeId> {
    let elapsed = timestamp_ms.saturating_sub(EPOCH_MS);
    if elapsed > MAX_TIMESTAMP {
        return Err(SnowflakeError::TimestampOverflow);
    }
    let id = (elapsed << (WORKER_ID_BITS + SEQUENCE_BITS))
        | ((worker_id as u64) << SEQUENCE_BITS)
        | sequence as u64;
    Ok(id as SnowflakeId)
}

/// Worker id encoded in `id`.
pub fn worker_id_from_id(id: SnowflakeId) -> u16 {
    ((id as u64 >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16
}

/// Unix timestamp (ms) encoded in `id`.
pub fn timestamp_from_id(id: SnowflakeId) -> u64 {
    (id as u64 >> (WORKER_ID_BITS + SEQUENCE_BITS)) + EPOCH_MS
}

/// Sequence number encoded in `id`.
pub fn sequence_from_id(id: SnowflakeId) -> u16 {
    (id as u64 & MAX_SEQUENCE as u64) as u16
}
