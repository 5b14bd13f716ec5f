// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timer, counter, and hysteresis state pools (spec §3). Each pool has a
//! fixed capacity; the engine hands out slots lazily, keyed by the
//! `(function_index, operation_index)` that first uses one, since a
//! given operation always occupies the same position in its function
//! across ticks.

use std::collections::HashMap;

pub const T_MAX: usize = 32;
pub const C_MAX: usize = 32;
pub const H_MAX: usize = 32;

#[derive(Clone, Copy, Debug, Default)]
pub struct TimerState {
    pub start_ms: u64,
    pub duration_ms: u64,
    pub active: bool,
    pub expired: bool,
}

impl TimerState {
    /// `start_timer` rearms: single-shot semantics (spec §4.2).
    pub fn start(&mut self, now_ms: u64, duration_ms: u64) {
        self.start_ms = now_ms;
        self.duration_ms = duration_ms;
        self.active = true;
        self.expired = false;
    }

    pub fn advance(&mut self, now_ms: u64) {
        if self.active && now_ms.saturating_sub(self.start_ms) >= self.duration_ms {
            self.expired = true;
            self.active = false;
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CounterState {
    pub count: u32,
    pub threshold: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HysteresisState {
    pub latched: bool,
}

impl HysteresisState {
    /// Transitions only on crossing the high (`hi`) or low (`lo`)
    /// threshold (spec §4.2); holds otherwise.
    pub fn update(&mut self, value: f64, lo: f64, hi: f64) -> bool {
        if !self.latched && value >= hi {
            self.latched = true;
        } else if self.latched && value <= lo {
            self.latched = false;
        }
        self.latched
    }
}

/// A fixed-capacity pool that assigns stable slots to the first `K` keys
/// that ask for one, and holds a steady default for any key arriving
/// once the pool is exhausted (spec §4.2 "no operation panics").
pub struct Pool<T> {
    slots: Vec<T>,
    assignment: HashMap<(u8, u8), usize>,
    capacity: usize,
}

impl<T: Default + Copy> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Pool {
            slots: Vec::new(),
            assignment: HashMap::new(),
            capacity,
        }
    }

    /// Returns the slot for `key`, allocating one if there's room.
    /// Returns `None` if the pool is full and `key` is not yet assigned.
    pub fn slot_mut(&mut self, key: (u8, u8)) -> Option<&mut T> {
        if let Some(&idx) = self.assignment.get(&key) {
            return Some(&mut self.slots[idx]);
        }
        if self.slots.len() >= self.capacity {
            return None;
        }
        let idx = self.slots.len();
        self.slots.push(T::default());
        self.assignment.insert(key, idx);
        Some(&mut self.slots[idx])
    }

    pub fn get(&self, key: (u8, u8)) -> Option<&T> {
        self.assignment.get(&key).map(|&idx| &self.slots[idx])
    }

    /// Whether `key` already has an assigned slot, without allocating one.
    pub fn contains(&self, key: (u8, u8)) -> bool {
        self.assignment.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_single_shot() {
        let mut t = TimerState::default();
        t.start(0, 100);
        t.advance(50);
        assert!(t.active && !t.expired);
        t.advance(100);
        assert!(!t.active && t.expired);
    }

    #[test]
    fn timer_restart_rearms() {
        let mut t = TimerState::default();
        t.start(0, 100);
        t.advance(150);
        assert!(t.expired);
        t.start(200, 100);
        assert!(t.active && !t.expired);
    }

    #[test]
    fn hysteresis_transitions_on_threshold() {
        let mut h = HysteresisState::default();
        assert!(!h.update(0.0, 0.3, 0.7));
        assert!(!h.update(0.5, 0.3, 0.7));
        assert!(h.update(0.8, 0.3, 0.7));
        assert!(h.update(0.5, 0.3, 0.7));
        assert!(!h.update(0.2, 0.3, 0.7));
    }

    #[test]
    fn pool_exhaustion_is_total() {
        let mut pool: Pool<CounterState> = Pool::new(1);
        assert!(pool.slot_mut((0, 0)).is_some());
        assert!(pool.slot_mut((0, 0)).is_some());
        assert!(pool.slot_mut((0, 1)).is_none());
    }
}
