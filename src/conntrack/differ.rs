//! Pure differencing logic: turns cumulative, flow-id-keyed conntrack
//! counters into non-negative deltas. See §4.2 of the design notes.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-direction counter state the differencer remembers for a flow-id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    origin: u64,
    reply: u64,
}

/// Independently reconcile one direction's stored baseline against a new
/// cumulative sample.
///
/// Returns `(delta, new_baseline)`.
fn diff_direction(prev: u64, cur: u64) -> (u64, u64) {
    if cur >= prev {
        (cur - prev, cur)
    } else if cur == 0 {
        // Transient glitch (e.g. a hardware-offload artifact): keep the old
        // baseline so counters don't ramp up again once they resume.
        (0, prev)
    } else {
        // 0 < cur < prev: flow-id reuse on a fresh connection. Abandon the
        // old baseline.
        (0, cur)
    }
}

/// Thread-safe table of per-flow-id last-observed counters, shared between
/// the listen and poll sources. `std::sync::Mutex` because both sources run
/// on synchronous recv loops outside the async runtime.
#[derive(Default)]
pub struct CounterTable {
    state: Mutex<HashMap<u32, Counters>>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile a sample for flow-id `flow_id` against the stored
    /// baseline, returning the `(origin_delta, reply_delta)` to emit. On a
    /// destroy event the baseline is dropped after differencing.
    pub fn process(&self, flow_id: u32, origin: u64, reply: u64, destroy: bool) -> (u64, u64) {
        let mut state = self.state.lock().unwrap();
        let deltas = match state.get(&flow_id).copied() {
            None => {
                // Conservative first-observation rule: a flow already in
                // flight when we start must not produce a spurious delta.
                state.insert(flow_id, Counters { origin, reply });
                (0, 0)
            }
            Some(prev) => {
                let (origin_delta, new_origin) = diff_direction(prev.origin, origin);
                let (reply_delta, new_reply) = diff_direction(prev.reply, reply);
                state.insert(
                    flow_id,
                    Counters {
                        origin: new_origin,
                        reply: new_reply,
                    },
                );
                (origin_delta, reply_delta)
            }
        };
        if destroy {
            state.remove(&flow_id);
        }
        deltas
    }

    pub fn tracked_flow_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_conservative() {
        let table = CounterTable::new();
        assert_eq!(table.process(7, 10_000, 20_000, false), (0, 0));
        assert_eq!(table.process(7, 10_500, 20_000, false), (500, 0));
    }

    #[test]
    fn flow_id_reuse_abandons_old_baseline() {
        let table = CounterTable::new();
        table.process(42, 5_000, 5_000, false);
        assert_eq!(table.process(42, 300, 0, false), (0, 0));
        assert_eq!(table.process(42, 800, 0, false), (500, 0));
    }

    #[test]
    fn glitch_to_zero_keeps_baseline() {
        let table = CounterTable::new();
        table.process(9, 1_000, 2_000, false);
        assert_eq!(table.process(9, 0, 2_000, false), (0, 0));
        assert_eq!(table.process(9, 1_200, 2_500, false), (200, 500));
    }

    #[test]
    fn destroy_differences_then_forgets_the_flow() {
        let table = CounterTable::new();
        table.process(1, 100, 200, false);
        assert_eq!(table.process(1, 150, 250, true), (50, 50));
        assert_eq!(table.tracked_flow_count(), 0);
        // Re-observing the same flow-id after destroy is a fresh baseline.
        assert_eq!(table.process(1, 10, 10, false), (0, 0));
    }

    #[test]
    fn destroy_with_no_prior_state_is_a_net_no_op() {
        let table = CounterTable::new();
        assert_eq!(table.process(99, 500, 500, true), (0, 0));
        assert_eq!(table.tracked_flow_count(), 0);
    }

    #[test]
    fn independent_directions() {
        let table = CounterTable::new();
        table.process(5, 100, 900, false);
        // origin glitches to zero while reply grows normally.
        assert_eq!(table.process(5, 0, 1_000, false), (0, 100));
    }
}
