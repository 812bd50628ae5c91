//! Timer bank (§3.4, §4.2): an on-delay timer state machine per configured
//! name, each also projected into a fixed slot of the process image.

use crate::image::ProcessImage;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer {0} already exists")]
    AlreadyExists(String),
    #[error("no free timer slots (max {0})")]
    NoFreeSlots(usize),
}

struct TimerState {
    slot: usize,
    preset: f64,
    running: bool,
    done: bool,
    elapsed: f64,
    start: Option<Instant>,
    done_at: Option<Instant>,
}

/// Keyed collection of timer state machines plus the name→slot assignment
/// handed out at `add` time and held for the worker's lifetime (§3.4
/// lifecycle).
pub struct TimerBank {
    timers: BTreeMap<String, TimerState>,
    next_slot: usize,
}

impl Default for TimerBank {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBank {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
            next_slot: 0,
        }
    }

    pub fn add(&mut self, name: &str, preset: f64) -> Result<(), TimerError> {
        if self.timers.contains_key(name) {
            return Err(TimerError::AlreadyExists(name.to_owned()));
        }
        if self.next_slot >= crate::image::NUM_TIMERS {
            return Err(TimerError::NoFreeSlots(crate::image::NUM_TIMERS));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.timers.insert(
            name.to_owned(),
            TimerState {
                slot,
                preset,
                running: false,
                done: false,
                elapsed: 0.0,
                start: None,
                done_at: None,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn is_done(&self, name: &str) -> bool {
        self.timers.get(name).map_or(false, |t| t.done)
    }

    pub fn reset(&mut self, name: &str) {
        if let Some(t) = self.timers.get_mut(name) {
            t.running = false;
            t.done = false;
            t.elapsed = 0.0;
            t.start = None;
            t.done_at = None;
        }
    }

    pub fn reset_all(&mut self) {
        let names: Vec<String> = self.timers.keys().cloned().collect();
        for name in names {
            self.reset(&name);
        }
    }

    /// Advances every slot per the §3.4 on-delay rules using the *previous*
    /// cycle's enable set (§4.2 ordering), then publishes the public
    /// fields into the image slot.
    pub fn update(&mut self, image: &ProcessImage, now: Instant, enabled: &HashSet<String>) {
        for (name, t) in &mut self.timers {
            let enable = enabled.contains(name);
            if enable {
                if !t.running {
                    t.running = true;
                    t.done = false;
                    t.elapsed = 0.0;
                    t.start = Some(now);
                } else {
                    let elapsed = now
                        .duration_since(t.start.unwrap_or(now))
                        .as_secs_f64();
                    t.elapsed = elapsed;
                    if elapsed >= t.preset {
                        t.done = true;
                        t.running = false;
                        t.done_at = Some(now);
                    }
                }
            } else if !t.done {
                t.running = false;
                t.elapsed = 0.0;
                t.start = None;
            } else {
                // Hold `done` for a further `preset` seconds from done_at,
                // then auto-reset (§3.4, Design Notes open question #1:
                // treated as a deliberate pulse-stretch feature).
                let held = t
                    .done_at
                    .map_or(false, |at| now.duration_since(at).as_secs_f64() < t.preset);
                if !held {
                    t.done = false;
                    t.elapsed = 0.0;
                    t.done_at = None;
                }
            }
            let cell = &image.timers[t.slot];
            cell.running.store(t.running, std::sync::atomic::Ordering::Relaxed);
            cell.done.store(t.done, std::sync::atomic::Ordering::Relaxed);
            cell.set_elapsed(t.elapsed);
            cell.set_preset(t.preset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn on_delay_asserts_done_at_preset() {
        let image = ProcessImage::default();
        let mut bank = TimerBank::new();
        bank.add("T1", 0.1).unwrap();
        let mut enabled = HashSet::new();
        enabled.insert("T1".to_owned());

        let t0 = Instant::now();
        bank.update(&image, t0, &enabled);
        assert!(!bank.is_done("T1"));

        bank.update(&image, t0 + Duration::from_millis(50), &enabled);
        assert!(!bank.is_done("T1"));

        bank.update(&image, t0 + Duration::from_millis(150), &enabled);
        assert!(bank.is_done("T1"));
    }

    #[test]
    fn disabling_before_done_resets_immediately() {
        let image = ProcessImage::default();
        let mut bank = TimerBank::new();
        bank.add("T1", 1.0).unwrap();
        let mut enabled = HashSet::new();
        enabled.insert("T1".to_owned());
        let t0 = Instant::now();
        bank.update(&image, t0, &enabled);
        enabled.clear();
        bank.update(&image, t0 + Duration::from_millis(10), &enabled);
        assert!(!bank.is_done("T1"));
    }

    #[test]
    fn done_holds_for_one_more_preset_before_reset() {
        let image = ProcessImage::default();
        let mut bank = TimerBank::new();
        bank.add("T1", 0.1).unwrap();
        let mut enabled = HashSet::new();
        enabled.insert("T1".to_owned());
        let t0 = Instant::now();
        bank.update(&image, t0, &enabled);
        bank.update(&image, t0 + Duration::from_millis(110), &enabled);
        assert!(bank.is_done("T1"));
        enabled.clear();
        // still within the hold window
        bank.update(&image, t0 + Duration::from_millis(150), &enabled);
        assert!(bank.is_done("T1"));
        // past the hold window
        bank.update(&image, t0 + Duration::from_millis(230), &enabled);
        assert!(!bank.is_done("T1"));
    }

    #[test]
    fn slots_exhausted_errors() {
        let mut bank = TimerBank::new();
        for i in 0..crate::image::NUM_TIMERS {
            bank.add(&format!("T{i}"), 1.0).unwrap();
        }
        assert!(bank.add("Textra", 1.0).is_err());
    }
}
