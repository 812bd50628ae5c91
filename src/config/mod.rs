//! Configuration entities and the reload-safe store feeding the evaluator
//! (§3.3, §4.3).

pub mod store;
pub mod types;

pub use store::{ConfigError, ConfigStore};
pub use types::{
    Action, ActionTarget, Condition, ConditionTarget, CounterConfig, Rung, RungSource,
    TimerConfig,
};
