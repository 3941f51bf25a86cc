//! Monotonic snowflake ids.
//!
//! Ids pack a millisecond timestamp relative to a configured epoch, a node
//! id and a per-millisecond step counter. Within one instance the sequence
//! is strictly increasing even when the clock stalls: an exhausted step
//! counter advances the logical millisecond.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Snowflake {
    nodebits: u32,
    stepbits: u32,
    epoch_ms: i64,
    node: i64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    last_ms: i64,
    step: i64,
}

impl Snowflake {
    pub fn new(timebits: u32, nodebits: u32, stepbits: u32, epoch_ms: i64, node: i64) -> Snowflake {
        assert!(
            timebits + nodebits + stepbits <= 63,
            "snowflake layout exceeds 63 bits"
        );
        let node_mask = (1i64 << nodebits) - 1;
        Snowflake {
            nodebits,
            stepbits,
            epoch_ms,
            node: node & node_mask,
            state: Mutex::new(State::default()),
        }
    }

    pub fn next(&self) -> i64 {
        let mut state = self.state.lock().unwrap();

        let now = self.elapsed_ms();
        if now > state.last_ms {
            state.last_ms = now;
            state.step = 0;
        } else {
            state.step += 1;
            if state.step >= (1 << self.stepbits) {
                // logical time moves on when a millisecond is exhausted
                state.last_ms += 1;
                state.step = 0;
            }
        }

        (state.last_ms << (self.nodebits + self.stepbits))
            | (self.node << self.stepbits)
            | state.step
    }

    fn elapsed_ms(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        (now - self.epoch_ms).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let flake = Snowflake::new(42, 7, 14, 1_651_363_200_000, 0);
        let mut last = 0;
        for _ in 0..50_000 {
            let id = flake.next();
            assert!(id > last, "{id} <= {last}");
            last = id;
        }
    }

    #[test]
    fn node_ids_never_collide() {
        let a = Snowflake::new(42, 7, 14, 1_651_363_200_000, 1);
        let b = Snowflake::new(42, 7, 14, 1_651_363_200_000, 2);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(a.next()));
            assert!(seen.insert(b.next()));
        }
    }

    #[test]
    fn node_is_masked_into_layout() {
        let flake = Snowflake::new(42, 7, 14, 1_651_363_200_000, 0b1111_1111_1);
        let id = flake.next();
        let node = (id >> 14) & 0x7f;
        assert_eq!(node, 0b1111_1111_1 & 0x7f);
    }
}
