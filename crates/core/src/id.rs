//! Strongly-typed identifiers and the identifier source.

use core::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, IdError};

/// Identifier of a product (business record primary key).
///
/// Externally generated, roughly time-ordered, always fits a signed 64-bit
/// column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(u64);

impl ProductId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for ProductId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ProductId> for u64 {
    fn from(value: ProductId) -> Self {
        value.0
    }
}

impl FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = u64::from_str(s).map_err(|e| DomainError::invalid_id(format!("ProductId: {e}")))?;
        Ok(Self(raw))
    }
}

/// Source of unique, roughly time-ordered 64-bit identifiers.
///
/// Implementations must be safe to call from many tasks at once and should be
/// low-latency; failures are surfaced to the write path as-is.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<u64, IdError>;
}

impl<G> IdGenerator for Arc<G>
where
    G: IdGenerator + ?Sized,
{
    fn generate(&self) -> Result<u64, IdError> {
        (**self).generate()
    }
}

const EPOCH_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
const TIME_UNIT_MS: i64 = 10;
const BITS_TIME: u32 = 39;
const BITS_SEQUENCE: u32 = 8;
const BITS_MACHINE: u32 = 16;
const SEQUENCE_MASK: u64 = (1 << BITS_SEQUENCE) - 1;

#[derive(Debug, Default)]
struct SnowflakeState {
    elapsed: u64,
    sequence: u64,
}

/// Sonyflake-style generator.
///
/// Layout (most significant first): 1 zero bit, 39 bits of elapsed time in
/// 10 ms units since 2024-01-01, 8 bits of sequence, 16 bits of machine id.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    machine_id: u16,
    state: Mutex<SnowflakeState>,
}

impl SnowflakeGenerator {
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id,
            state: Mutex::new(SnowflakeState::default()),
        }
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Generate an identifier as if the wall clock read `now_ms` (unix millis).
    ///
    /// Never goes backwards: a clock step back keeps counting from the last
    /// logical tick, and sequence overflow borrows the next tick.
    pub fn generate_at(&self, now_ms: i64) -> Result<u64, IdError> {
        let current = (now_ms.saturating_sub(EPOCH_MS).max(0) / TIME_UNIT_MS) as u64;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.elapsed < current {
            state.elapsed = current;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.elapsed += 1;
            }
        }

        if state.elapsed >= 1 << BITS_TIME {
            return Err(IdError::Exhausted);
        }

        Ok((state.elapsed << (BITS_SEQUENCE + BITS_MACHINE))
            | (state.sequence << BITS_MACHINE)
            | u64::from(self.machine_id))
    }
}

impl IdGenerator for SnowflakeGenerator {
    fn generate(&self) -> Result<u64, IdError> {
        self.generate_at(Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NOW: i64 = EPOCH_MS + 86_400_000;

    #[test]
    fn ids_are_unique_and_increasing_within_one_tick() {
        let generator = SnowflakeGenerator::new(7);
        let mut last = 0;
        for _ in 0..2_000 {
            let id = generator.generate_at(NOW).unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn machine_id_occupies_low_bits() {
        let generator = SnowflakeGenerator::new(0xBEEF);
        let id = generator.generate_at(NOW).unwrap();
        assert_eq!(id & 0xFFFF, 0xBEEF);
    }

    #[test]
    fn clock_moving_backwards_does_not_repeat_ids() {
        let generator = SnowflakeGenerator::new(1);
        let before = generator.generate_at(NOW).unwrap();
        let after = generator.generate_at(NOW - 60_000).unwrap();
        assert!(after > before);
    }

    #[test]
    fn ids_fit_signed_column() {
        let generator = SnowflakeGenerator::new(u16::MAX);
        let id = generator.generate_at(NOW).unwrap();
        assert!(i64::try_from(id).is_ok());
    }

    #[test]
    fn exhausted_time_range_is_an_error() {
        let generator = SnowflakeGenerator::new(1);
        let far_future = EPOCH_MS + (1_i64 << BITS_TIME) * TIME_UNIT_MS;
        assert_eq!(generator.generate_at(far_future), Err(IdError::Exhausted));
    }

    #[test]
    fn product_id_parses_from_string() {
        let id: ProductId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert!("nope".parse::<ProductId>().is_err());
    }

    proptest! {
        #[test]
        fn ids_strictly_increase_for_any_clock(offsets in proptest::collection::vec(0i64..10_000_000, 1..200)) {
            let generator = SnowflakeGenerator::new(3);
            let mut last = 0u64;
            for offset in offsets {
                let id = generator.generate_at(EPOCH_MS + offset).unwrap();
                prop_assert!(id > last);
                last = id;
            }
        }
    }
}
