//! Counter bank (§3.4, §4.2): an up-counter with edge detection per
//! configured name, each projected into a fixed process-image slot.

use crate::image::ProcessImage;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("counter {0} already exists")]
    AlreadyExists(String),
    #[error("no free counter slots (max {0})")]
    NoFreeSlots(usize),
}

struct CounterState {
    slot: usize,
    preset: i64,
    done: bool,
    count: i64,
    last_signal: bool,
}

pub struct CounterBank {
    counters: BTreeMap<String, CounterState>,
    next_slot: usize,
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBank {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: BTreeMap::new(),
            next_slot: 0,
        }
    }

    pub fn add(&mut self, name: &str, preset: i64) -> Result<(), CounterError> {
        if self.counters.contains_key(name) {
            return Err(CounterError::AlreadyExists(name.to_owned()));
        }
        if self.next_slot >= crate::image::NUM_COUNTERS {
            return Err(CounterError::NoFreeSlots(crate::image::NUM_COUNTERS));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.counters.insert(
            name.to_owned(),
            CounterState {
                slot,
                preset,
                done: false,
                count: 0,
                last_signal: false,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn is_done(&self, name: &str) -> bool {
        self.counters.get(name).map_or(false, |c| c.done)
    }

    pub fn reset(&mut self, name: &str) {
        if let Some(c) = self.counters.get_mut(name) {
            c.done = false;
            c.count = 0;
            c.last_signal = false;
        }
    }

    pub fn reset_all(&mut self) {
        let names: Vec<String> = self.counters.keys().cloned().collect();
        for name in names {
            self.reset(&name);
        }
    }

    /// Counts false→true edges of the trigger signal from the *previous*
    /// cycle's trigger set (§4.2 ordering), then publishes into the image.
    pub fn update(&mut self, image: &ProcessImage, triggered: &HashSet<String>) {
        for (name, c) in &mut self.counters {
            let signal = triggered.contains(name);
            if signal && !c.last_signal {
                c.count += 1;
                if c.count >= c.preset {
                    c.done = true;
                }
            }
            c.last_signal = signal;
            let cell = &image.counters[c.slot];
            cell.done.store(c.done, Ordering::Relaxed);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            cell.count.store(c.count.max(0) as u32, Ordering::Relaxed);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            cell.preset.store(c.preset.max(0) as u32, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_rising_edges_only() {
        let image = ProcessImage::default();
        let mut bank = CounterBank::new();
        bank.add("C1", 3).unwrap();
        let mut trig = HashSet::new();

        for pulse in [true, false, true, false, true, false] {
            trig.clear();
            if pulse {
                trig.insert("C1".to_owned());
            }
            bank.update(&image, &trig);
        }
        assert!(bank.is_done("C1"));
    }

    #[test]
    fn holding_signal_true_counts_once() {
        let image = ProcessImage::default();
        let mut bank = CounterBank::new();
        bank.add("C1", 2).unwrap();
        let mut trig = HashSet::new();
        trig.insert("C1".to_owned());
        bank.update(&image, &trig);
        bank.update(&image, &trig);
        bank.update(&image, &trig);
        assert!(!bank.is_done("C1"));
    }

    #[test]
    fn reset_clears_count_and_edge_memory() {
        let image = ProcessImage::default();
        let mut bank = CounterBank::new();
        bank.add("C1", 1).unwrap();
        let mut trig = HashSet::new();
        trig.insert("C1".to_owned());
        bank.update(&image, &trig);
        assert!(bank.is_done("C1"));
        bank.reset("C1");
        assert!(!bank.is_done("C1"));
    }
}
