//! Configuration value objects (§3.3, §6.2). These deserialize directly from
//! the JSON shapes the external configuration loader produces — field names
//! and tags follow `original_source/plc_cpp/include/json_parser.h` exactly.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Input,
    Output,
    Memory,
    Timer,
    Counter,
    #[serde(rename = "yolo_flag")]
    YoloFlag,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Output,
    Set,
    Reset,
    #[serde(rename = "memory_set")]
    MemorySet,
    #[serde(rename = "memory_reset")]
    MemoryReset,
    Timer,
    Counter,
    #[serde(rename = "reset_timer")]
    ResetTimer,
    #[serde(rename = "reset_counter")]
    ResetCounter,
}

/// Raw condition as it comes off the wire. `kind` says which of
/// `input`/`output`/`memory`/`timer`/`counter` field to read the handle
/// from — modeled as a flat struct with optional fields rather than an
/// internally-tagged enum because the source JSON carries the type as a
/// sibling field alongside a type-named field (`{"type":"input","input":"I0",...}`),
/// not as enum-variant content.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub normally_open: bool,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default)]
    pub counter: Option<String>,
    #[serde(default)]
    pub yolo_flag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default)]
    pub counter: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RungSource {
    System,
    User,
}

/// A condition resolved at load time: the raw handle name (diagnostics),
/// polarity, and the parsed `(kind, index)` or named timer/counter target.
#[derive(Debug, Clone)]
pub struct Condition {
    pub name: String,
    pub normally_open: bool,
    pub target: ConditionTarget,
}

#[derive(Debug, Clone)]
pub enum ConditionTarget {
    Input(usize),
    Output(usize),
    Memory(usize),
    Timer(String),
    Counter(String),
    YoloFlag(usize),
    /// A condition that failed to resolve (unknown kind, OOB index,
    /// unparseable name) is never rejected outright — per §4.1 failure
    /// semantics it is kept as a permanent no-op (always false).
    Unresolvable,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub target: ActionTarget,
}

#[derive(Debug, Clone)]
pub enum ActionTarget {
    Output(usize),
    Set(usize),
    Reset(usize),
    MemorySet(usize),
    MemoryReset(usize),
    Timer(String),
    Counter(String),
    ResetTimer(String),
    ResetCounter(String),
    Unresolvable,
}

#[derive(Debug, Clone)]
pub struct Rung {
    pub id: String,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub action: Action,
    pub source: RungSource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRung {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<RawCondition>,
    pub action: RawAction,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    pub name: String,
    pub preset: f64,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterConfig {
    pub name: String,
    pub preset: i64,
    #[serde(default)]
    pub alias: String,
}

/// The unified-mode file shape (§6.2): one file with all three lists.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UnifiedFile {
    #[serde(default)]
    pub timers: Vec<TimerConfig>,
    #[serde(default)]
    pub counters: Vec<CounterConfig>,
    #[serde(default)]
    pub rungs: Vec<RawRung>,
}

/// The split-mode system file: rungs only.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SystemFile {
    #[serde(default)]
    pub rungs: Vec<RawRung>,
}

/// The split-mode user file: timers, counters, and rungs.
pub type UserFile = UnifiedFile;

fn parse_index(prefix: char, s: &str) -> Option<usize> {
    let s = s.strip_prefix(prefix)?;
    s.parse::<usize>().ok()
}

/// Resolves a raw condition's handle name into a `ConditionTarget`. Never
/// fails — an out-of-range or malformed handle becomes
/// `ConditionTarget::Unresolvable` per §4.1.
pub fn resolve_condition(raw: &RawCondition) -> Condition {
    let (name, target) = match raw.kind {
        ConditionKind::Input => {
            let name = raw.input.clone().unwrap_or_default();
            let target = parse_index('I', &name)
                .filter(|&i| i < crate::image::NUM_INPUTS)
                .map_or(ConditionTarget::Unresolvable, ConditionTarget::Input);
            (name, target)
        }
        ConditionKind::Output => {
            let name = raw.output.clone().unwrap_or_default();
            let target = parse_index('Q', &name)
                .filter(|&i| i < crate::image::NUM_OUTPUTS)
                .map_or(ConditionTarget::Unresolvable, ConditionTarget::Output);
            (name, target)
        }
        ConditionKind::Memory => {
            let name = raw.memory.clone().unwrap_or_default();
            let target = parse_index('M', &name)
                .filter(|&i| i < crate::image::NUM_MEMORY)
                .map_or(ConditionTarget::Unresolvable, ConditionTarget::Memory);
            (name, target)
        }
        ConditionKind::Timer => {
            let name = raw.timer.clone().unwrap_or_default();
            let target = if name.is_empty() {
                ConditionTarget::Unresolvable
            } else {
                ConditionTarget::Timer(name.clone())
            };
            (name, target)
        }
        ConditionKind::Counter => {
            let name = raw.counter.clone().unwrap_or_default();
            let target = if name.is_empty() {
                ConditionTarget::Unresolvable
            } else {
                ConditionTarget::Counter(name.clone())
            };
            (name, target)
        }
        ConditionKind::YoloFlag => {
            let name = raw.yolo_flag.clone().unwrap_or_default();
            let target = parse_index('Y', &name)
                .filter(|&n| (1..=crate::image::NUM_YOLO_FLAGS).contains(&n))
                .map_or(ConditionTarget::Unresolvable, ConditionTarget::YoloFlag);
            (name, target)
        }
    };
    Condition {
        name,
        normally_open: raw.normally_open,
        target,
    }
}

pub fn resolve_action(raw: &RawAction) -> Action {
    let (name, target) = match raw.kind {
        ActionKind::Output => {
            let name = raw.output.clone().unwrap_or_default();
            let t = parse_index('Q', &name)
                .filter(|&i| i < crate::image::NUM_OUTPUTS)
                .map_or(ActionTarget::Unresolvable, ActionTarget::Output);
            (name, t)
        }
        ActionKind::Set => {
            let name = raw.output.clone().unwrap_or_default();
            let t = parse_index('Q', &name)
                .filter(|&i| i < crate::image::NUM_OUTPUTS)
                .map_or(ActionTarget::Unresolvable, ActionTarget::Set);
            (name, t)
        }
        ActionKind::Reset => {
            let name = raw.output.clone().unwrap_or_default();
            let t = parse_index('Q', &name)
                .filter(|&i| i < crate::image::NUM_OUTPUTS)
                .map_or(ActionTarget::Unresolvable, ActionTarget::Reset);
            (name, t)
        }
        ActionKind::MemorySet => {
            let name = raw.memory.clone().unwrap_or_default();
            let t = parse_index('M', &name)
                .filter(|&i| i < crate::image::NUM_MEMORY)
                .map_or(ActionTarget::Unresolvable, ActionTarget::MemorySet);
            (name, t)
        }
        ActionKind::MemoryReset => {
            let name = raw.memory.clone().unwrap_or_default();
            let t = parse_index('M', &name)
                .filter(|&i| i < crate::image::NUM_MEMORY)
                .map_or(ActionTarget::Unresolvable, ActionTarget::MemoryReset);
            (name, t)
        }
        ActionKind::Timer => {
            let name = raw.timer.clone().unwrap_or_default();
            let t = if name.is_empty() {
                ActionTarget::Unresolvable
            } else {
                ActionTarget::Timer(name.clone())
            };
            (name, t)
        }
        ActionKind::Counter => {
            let name = raw.counter.clone().unwrap_or_default();
            let t = if name.is_empty() {
                ActionTarget::Unresolvable
            } else {
                ActionTarget::Counter(name.clone())
            };
            (name, t)
        }
        ActionKind::ResetTimer => {
            let name = raw.timer.clone().unwrap_or_default();
            let t = if name.is_empty() {
                ActionTarget::Unresolvable
            } else {
                ActionTarget::ResetTimer(name.clone())
            };
            (name, t)
        }
        ActionKind::ResetCounter => {
            let name = raw.counter.clone().unwrap_or_default();
            let t = if name.is_empty() {
                ActionTarget::Unresolvable
            } else {
                ActionTarget::ResetCounter(name.clone())
            };
            (name, t)
        }
    };
    Action { name, target }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_input_handle() {
        let raw = RawCondition {
            kind: ConditionKind::Input,
            normally_open: true,
            input: Some("I0".to_owned()),
            output: None,
            memory: None,
            timer: None,
            counter: None,
            yolo_flag: None,
        };
        let cond = resolve_condition(&raw);
        assert!(matches!(cond.target, ConditionTarget::Input(0)));
    }

    #[test]
    fn out_of_range_input_is_unresolvable_not_an_error() {
        let raw = RawCondition {
            kind: ConditionKind::Input,
            normally_open: true,
            input: Some("I9".to_owned()),
            output: None,
            memory: None,
            timer: None,
            counter: None,
            yolo_flag: None,
        };
        let cond = resolve_condition(&raw);
        assert!(matches!(cond.target, ConditionTarget::Unresolvable));
    }
}
