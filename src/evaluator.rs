//! Ladder Evaluator (§4.1): a pure per-cycle function from (merged rungs,
//! input snapshot, process image, timer/counter banks) to output/memory
//! writes plus the next cycle's timer-enable and counter-trigger sets.

use crate::config::{Action, ActionTarget, Condition, ConditionTarget, Rung};
use crate::counters::CounterBank;
use crate::image::ProcessImage;
use crate::timers::TimerBank;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

/// Output of one evaluator pass: the sets the banks will consume on the
/// *next* cycle (§4.2 ordering).
#[derive(Default)]
pub struct CycleSets {
    pub timer_enable: HashSet<String>,
    pub counter_trigger: HashSet<String>,
}

/// Resolves a condition's raw boolean by kind, then applies contact
/// polarity (§4.1). Unresolvable conditions are permanent no-ops (false).
fn raw_state(
    target: &ConditionTarget,
    inputs: &[bool],
    image: &ProcessImage,
    timers: &TimerBank,
    counters: &CounterBank,
) -> bool {
    match target {
        ConditionTarget::Input(k) => inputs.get(*k).copied().unwrap_or(false),
        ConditionTarget::Output(k) => image.outputs[*k].load(Ordering::Relaxed),
        ConditionTarget::Memory(k) => image.memory[*k].load(Ordering::Relaxed),
        ConditionTarget::Timer(name) => timers.is_done(name),
        ConditionTarget::Counter(name) => counters.is_done(name),
        ConditionTarget::YoloFlag(n) => image.yolo_flags[*n - 1].load(Ordering::Relaxed),
        ConditionTarget::Unresolvable => false,
    }
}

fn evaluate_condition(
    cond: &Condition,
    inputs: &[bool],
    image: &ProcessImage,
    timers: &TimerBank,
    counters: &CounterBank,
) -> bool {
    let raw = raw_state(&cond.target, inputs, image, timers, counters);
    if cond.normally_open {
        raw
    } else {
        !raw
    }
}

/// Conditions AND together in declaration order, short-circuiting on the
/// first false; an empty list is true (§4.1).
fn evaluate_rung(
    rung: &Rung,
    inputs: &[bool],
    image: &ProcessImage,
    timers: &TimerBank,
    counters: &CounterBank,
) -> bool {
    for cond in &rung.conditions {
        if !evaluate_condition(cond, inputs, image, timers, counters) {
            return false;
        }
    }
    true
}

fn execute_action(action: &Action, result: bool, image: &ProcessImage, sets: &mut CycleSets) {
    match &action.target {
        ActionTarget::Output(k) => image.outputs[*k].store(result, Ordering::Relaxed),
        ActionTarget::Set(k) => {
            if result {
                image.outputs[*k].store(true, Ordering::Relaxed);
            }
        }
        ActionTarget::Reset(k) => {
            if result {
                image.outputs[*k].store(false, Ordering::Relaxed);
            }
        }
        ActionTarget::MemorySet(k) => {
            if result {
                image.write_memory(*k, true);
            }
        }
        ActionTarget::MemoryReset(k) => {
            if result {
                image.write_memory(*k, false);
            }
        }
        ActionTarget::Timer(name) => {
            if result {
                sets.timer_enable.insert(name.clone());
            }
        }
        ActionTarget::Counter(name) => {
            if result {
                sets.counter_trigger.insert(name.clone());
            }
        }
        ActionTarget::ResetTimer(_) | ActionTarget::ResetCounter(_) => {
            // Unconditional resets are applied by the caller directly
            // against the banks, not through image writes; see
            // `run_cycle`'s second pass below.
        }
        ActionTarget::Unresolvable => {}
    }
}

/// Runs one evaluator pass over the merged rung list. Resets (`RESET_TIMER`/
/// `RESET_COUNTER`) are applied directly to the banks since they are not
/// process-image writes; everything else only touches `image` and `sets`,
/// keeping the evaluator's core dispatch a flat, branch-predictable loop
/// over tagged variants (Design Notes: no virtual dispatch).
pub fn run_cycle(
    rungs: &[Rung],
    inputs: &[bool],
    image: &ProcessImage,
    timers: &mut TimerBank,
    counters: &mut CounterBank,
) -> CycleSets {
    let mut sets = CycleSets::default();
    for rung in rungs {
        if !rung.enabled {
            continue;
        }
        let result = evaluate_rung(rung, inputs, image, timers, counters);
        match &rung.action.target {
            ActionTarget::ResetTimer(name) => {
                if result {
                    timers.reset(name);
                }
            }
            ActionTarget::ResetCounter(name) => {
                if result {
                    counters.reset(name);
                }
            }
            _ => execute_action(&rung.action, result, image, &mut sets),
        }
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionTarget, ConditionTarget, RungSource};

    fn rung(id: &str, conditions: Vec<Condition>, action: Action) -> Rung {
        Rung {
            id: id.to_owned(),
            enabled: true,
            conditions,
            action,
            source: RungSource::User,
        }
    }

    fn cond_input(k: usize, no: bool) -> Condition {
        Condition {
            name: format!("I{k}"),
            normally_open: no,
            target: ConditionTarget::Input(k),
        }
    }

    fn action_output(k: usize) -> Action {
        Action {
            name: format!("Q{k}"),
            target: ActionTarget::Output(k),
        }
    }

    #[test]
    fn s1_single_direct_coil() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        let rungs = vec![rung("r1", vec![cond_input(0, true)], action_output(0))];
        let inputs = vec![true, false, false];
        run_cycle(&rungs, &inputs, &image, &mut timers, &mut counters);
        image.mirror_outputs();
        assert!(image.outputs[0].load(Ordering::Relaxed));
        for i in 1..crate::image::NUM_OUTPUTS {
            assert!(!image.outputs[i].load(Ordering::Relaxed));
        }
        assert!(image.memory[46].load(Ordering::Relaxed));
    }

    #[test]
    fn s2_latch_set_reset() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        let rungs = vec![
            rung(
                "r1",
                vec![cond_input(0, true)],
                Action {
                    name: "Q1".to_owned(),
                    target: ActionTarget::Set(1),
                },
            ),
            rung(
                "r2",
                vec![cond_input(1, true)],
                Action {
                    name: "Q1".to_owned(),
                    target: ActionTarget::Reset(1),
                },
            ),
        ];
        run_cycle(&rungs, &[true, false, false], &image, &mut timers, &mut counters);
        assert!(image.outputs[1].load(Ordering::Relaxed));
        run_cycle(&rungs, &[false, false, false], &image, &mut timers, &mut counters);
        assert!(image.outputs[1].load(Ordering::Relaxed));
        run_cycle(&rungs, &[false, true, false], &image, &mut timers, &mut counters);
        assert!(!image.outputs[1].load(Ordering::Relaxed));
    }

    #[test]
    fn user_rung_dominates_on_shared_output() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        let rungs = vec![
            Rung {
                id: "sys1".to_owned(),
                enabled: true,
                conditions: vec![],
                action: action_output(0),
                source: RungSource::System,
            },
            rung("user1", vec![cond_input(0, false)], action_output(0)),
        ];
        // system rung always true -> Q0 true, but user rung's NC condition
        // on a false input is also true -> still true; flip input true so
        // user's verdict (false) wins as the last writer.
        run_cycle(&rungs, &[true, false, false], &image, &mut timers, &mut counters);
        assert!(!image.outputs[0].load(Ordering::Relaxed));
    }

    #[test]
    fn empty_condition_list_is_true() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        let rungs = vec![rung("r1", vec![], action_output(2))];
        run_cycle(&rungs, &[false, false, false], &image, &mut timers, &mut counters);
        assert!(image.outputs[2].load(Ordering::Relaxed));
    }

    #[test]
    fn disabled_rung_is_skipped_entirely() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        image.outputs[0].store(true, Ordering::Relaxed);
        let mut r = rung("r1", vec![cond_input(0, true)], action_output(0));
        r.enabled = false;
        run_cycle(&[r], &[false, false, false], &image, &mut timers, &mut counters);
        assert!(image.outputs[0].load(Ordering::Relaxed));
    }

    #[test]
    fn memory_write_to_output_mirror_range_is_ignored() {
        let image = ProcessImage::default();
        let mut timers = TimerBank::new();
        let mut counters = CounterBank::new();
        let rungs = vec![rung(
            "r1",
            vec![],
            Action {
                name: "M46".to_owned(),
                target: ActionTarget::MemorySet(46),
            },
        )];
        run_cycle(&rungs, &[false, false, false], &image, &mut timers, &mut counters);
        assert!(!image.memory[46].load(Ordering::Relaxed));
    }
}
