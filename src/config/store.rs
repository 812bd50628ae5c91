//! Config Store (§4.3): two rung lists plus timer/counter definitions,
//! merged atomically into one evaluation list. All mutation and the scan
//! loop's per-cycle read share one reentrant lock, so a reload blocks at
//! most one cycle and never exposes a half-applied configuration.

use crate::config::types::{
    resolve_action, resolve_condition, ActionTarget, CounterConfig, RawRung, Rung, RungSource,
    SystemFile, TimerConfig, UnifiedFile,
};
use crate::image::SharedImage;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("rung {rung_id} references unknown timer {name}")]
    UnknownTimer { rung_id: String, name: String },
    #[error("rung {rung_id} references unknown counter {name}")]
    UnknownCounter { rung_id: String, name: String },
    #[error("too many timers: {0} > {1}")]
    TooManyTimers(usize, usize),
    #[error("too many counters: {0} > {1}")]
    TooManyCounters(usize, usize),
}

impl From<ConfigError> for crate::error::PlcError {
    fn from(e: ConfigError) -> Self {
        crate::error::PlcError::ConfigParseError(e.to_string())
    }
}

struct Inner {
    system_rungs: Vec<Rung>,
    user_rungs: Vec<Rung>,
    timer_configs: Vec<TimerConfig>,
    counter_configs: Vec<CounterConfig>,
    merged: Vec<Rung>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            system_rungs: Vec::new(),
            user_rungs: Vec::new(),
            timer_configs: Vec::new(),
            counter_configs: Vec::new(),
            merged: Vec::new(),
        }
    }

    /// System rungs evaluate before user rungs, each in declaration order
    /// (§4.1 merge order). No stable-sort reliance — this is just
    /// concatenation, which preserves declaration order by construction.
    fn remerge(&mut self) {
        let mut merged = Vec::with_capacity(self.system_rungs.len() + self.user_rungs.len());
        merged.extend(self.system_rungs.iter().cloned());
        merged.extend(self.user_rungs.iter().cloned());
        self.merged = merged;
    }
}

pub struct ConfigStore {
    inner: ReentrantMutex<RefCell<Inner>>,
    /// The process image a reload must force dropped outputs low against
    /// (§8 S5). `None` for standalone/test stores that never need that
    /// side effect — `snapshot`/`load_*` behave identically either way,
    /// just without the image write.
    image: Option<SharedImage>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner::empty())),
            image: None,
        }
    }

    /// Like `new`, but wired to the process image so a reload that drops a
    /// rung's governance of an output forces that output false instead of
    /// leaving it latched at its last value (§8 S5).
    #[must_use]
    pub fn with_image(image: SharedImage) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner::empty())),
            image: Some(image),
        }
    }

    /// Read access for the scan loop: a cloned merged rung list plus the
    /// timer/counter config lists in effect for this cycle. Cloning happens
    /// inside the lock so the cycle always sees one consistent snapshot
    /// (§4.3, §5 "a given cycle sees exactly one configuration").
    pub fn snapshot(&self) -> (Vec<Rung>, Vec<TimerConfig>, Vec<CounterConfig>) {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        (
            inner.merged.clone(),
            inner.timer_configs.clone(),
            inner.counter_configs.clone(),
        )
    }

    #[must_use]
    pub fn rung_count(&self) -> usize {
        self.inner.lock().borrow().merged.len()
    }

    pub fn clear(&self) {
        let guard = self.inner.lock();
        *guard.borrow_mut() = Inner::empty();
    }

    /// Unified mode (§6.2): one file with `timers[]`, `counters[]`,
    /// `rungs[]`. Replaces user+timer+counter config and empties the
    /// system list. On any validation failure the prior state is left
    /// untouched (§4.3, testable property #4).
    pub fn load_unified<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = read_json::<UnifiedFile, _>(&path)?;
        let timer_configs = file.timers;
        let counter_configs = file.counters;
        let user_rungs = resolve_rungs(&file.rungs, RungSource::User);
        validate(&user_rungs, &[], &timer_configs, &counter_configs)?;
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let outgoing = std::mem::take(&mut inner.merged);
        inner.system_rungs.clear();
        inner.user_rungs = user_rungs;
        inner.timer_configs = timer_configs;
        inner.counter_configs = counter_configs;
        inner.remerge();
        self.force_dropped_outputs(&outgoing, &inner.merged);
        Ok(())
    }

    /// Split mode (§6.2): system file carries rungs only.
    pub fn load_system<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = read_json::<SystemFile, _>(&path)?;
        let system_rungs = resolve_rungs(&file.rungs, RungSource::System);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        validate(
            &system_rungs,
            &inner.user_rungs,
            &inner.timer_configs,
            &inner.counter_configs,
        )?;
        let outgoing = std::mem::take(&mut inner.merged);
        inner.system_rungs = system_rungs;
        inner.remerge();
        self.force_dropped_outputs(&outgoing, &inner.merged);
        Ok(())
    }

    /// Split mode (§6.2): user file carries timers, counters, and rungs.
    pub fn load_user<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = read_json::<UnifiedFile, _>(&path)?;
        let timer_configs = file.timers;
        let counter_configs = file.counters;
        let user_rungs = resolve_rungs(&file.rungs, RungSource::User);
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        validate(
            &inner.system_rungs,
            &user_rungs,
            &timer_configs,
            &counter_configs,
        )?;
        let outgoing = std::mem::take(&mut inner.merged);
        inner.user_rungs = user_rungs;
        inner.timer_configs = timer_configs;
        inner.counter_configs = counter_configs;
        inner.remerge();
        self.force_dropped_outputs(&outgoing, &inner.merged);
        Ok(())
    }

    /// Reloads the unified file if present, falling back to the split user
    /// file, matching §6.4's `reload_user_config` ("reloads either unified
    /// or user file, unified tried first").
    pub fn reload_user_config<P: AsRef<Path>>(
        &self,
        unified_path: P,
        user_path: P,
    ) -> Result<(), ConfigError> {
        if unified_path.as_ref().exists() {
            self.load_unified(unified_path)
        } else {
            self.load_user(user_path)
        }
    }

    /// §8 S5: an output that was governed by the outgoing rung list but
    /// isn't governed by the incoming one must not keep whatever value it
    /// was last driven to — nothing will ever write it again. Forces every
    /// such index false and mirrors, the same as `force_outputs_low`.
    fn force_dropped_outputs(&self, outgoing: &[Rung], incoming: &[Rung]) {
        let Some(image) = &self.image else {
            return;
        };
        let before = referenced_outputs(outgoing);
        let after = referenced_outputs(incoming);
        let mut dropped_any = false;
        for &index in before.difference(&after) {
            if index < crate::image::NUM_OUTPUTS {
                image.outputs[index].store(false, Ordering::Relaxed);
                dropped_any = true;
            }
        }
        if dropped_any {
            image.mirror_outputs();
        }
    }
}

/// Physical output indices that some enabled rung in `rungs` drives
/// (`OUTPUT`/`SET`/`RESET` targets). A disabled rung governs nothing (§4.1
/// disabled-rung semantics), so it never counts here either as outgoing or
/// incoming coverage.
fn referenced_outputs(rungs: &[Rung]) -> HashSet<usize> {
    rungs
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| match r.action.target {
            ActionTarget::Output(i) | ActionTarget::Set(i) | ActionTarget::Reset(i) => Some(i),
            _ => None,
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, ConfigError> {
    let path_s = path.as_ref().display().to_string();
    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path_s.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path_s,
        source,
    })
}

fn resolve_rungs(raw: &[RawRung], source: RungSource) -> Vec<Rung> {
    raw.iter()
        .map(|r| Rung {
            id: r.id.clone(),
            enabled: r.enabled,
            conditions: r.conditions.iter().map(resolve_condition).collect(),
            action: resolve_action(&r.action),
            source,
        })
        .collect()
}

/// §3.3 validation: every `TIMER`/`COUNTER` condition and every
/// `TIMER`/`RESET_TIMER`/`COUNTER`/`RESET_COUNTER` action must name a
/// timer/counter present in the provided config lists, and counts must
/// stay within the fixed limits (§3.1).
fn validate(
    system_rungs: &[Rung],
    user_rungs: &[Rung],
    timers: &[TimerConfig],
    counters: &[CounterConfig],
) -> Result<(), ConfigError> {
    use crate::config::types::ConditionTarget;

    if timers.len() > crate::image::NUM_TIMERS {
        return Err(ConfigError::TooManyTimers(
            timers.len(),
            crate::image::NUM_TIMERS,
        ));
    }
    if counters.len() > crate::image::NUM_COUNTERS {
        return Err(ConfigError::TooManyCounters(
            counters.len(),
            crate::image::NUM_COUNTERS,
        ));
    }

    let timer_names: std::collections::HashSet<&str> =
        timers.iter().map(|t| t.name.as_str()).collect();
    let counter_names: std::collections::HashSet<&str> =
        counters.iter().map(|c| c.name.as_str()).collect();

    for rung in system_rungs.iter().chain(user_rungs.iter()) {
        for cond in &rung.conditions {
            match &cond.target {
                ConditionTarget::Timer(name) if !timer_names.contains(name.as_str()) => {
                    return Err(ConfigError::UnknownTimer {
                        rung_id: rung.id.clone(),
                        name: name.clone(),
                    });
                }
                ConditionTarget::Counter(name) if !counter_names.contains(name.as_str()) => {
                    return Err(ConfigError::UnknownCounter {
                        rung_id: rung.id.clone(),
                        name: name.clone(),
                    });
                }
                _ => {}
            }
        }
        match &rung.action.target {
            ActionTarget::Timer(name) | ActionTarget::ResetTimer(name)
                if !timer_names.contains(name.as_str()) =>
            {
                return Err(ConfigError::UnknownTimer {
                    rung_id: rung.id.clone(),
                    name: name.clone(),
                });
            }
            ActionTarget::Counter(name) | ActionTarget::ResetCounter(name)
                if !counter_names.contains(name.as_str()) =>
            {
                return Err(ConfigError::UnknownCounter {
                    rung_id: rung.id.clone(),
                    name: name.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn unified_load_then_query() {
        let store = ConfigStore::new();
        let f = write_tmp(
            r#"{
              "timers": [], "counters": [],
              "rungs": [
                {"id":"r1","enabled":true,
                 "conditions":[{"type":"input","input":"I0","normally_open":true}],
                 "action":{"type":"output","output":"Q0"}}
              ]
            }"#,
        );
        store.load_unified(f.path()).unwrap();
        assert_eq!(store.rung_count(), 1);
    }

    #[test]
    fn unknown_timer_reference_is_rejected_whole() {
        let store = ConfigStore::new();
        let f = write_tmp(
            r#"{
              "timers": [], "counters": [],
              "rungs": [
                {"id":"r1","enabled":true,
                 "conditions":[{"type":"timer","timer":"T1","normally_open":true}],
                 "action":{"type":"output","output":"Q0"}}
              ]
            }"#,
        );
        assert!(store.load_unified(f.path()).is_err());
        assert_eq!(store.rung_count(), 0);
    }

    #[test]
    fn failed_reload_preserves_prior_state() {
        let store = ConfigStore::new();
        let good = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r1","enabled":true,"conditions":[],
                          "action":{"type":"output","output":"Q0"}}]}"#,
        );
        store.load_unified(good.path()).unwrap();
        assert_eq!(store.rung_count(), 1);

        let bad = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r2","enabled":true,
                          "conditions":[{"type":"counter","counter":"C9","normally_open":true}],
                          "action":{"type":"output","output":"Q1"}}]}"#,
        );
        assert!(store.load_unified(bad.path()).is_err());
        assert_eq!(store.rung_count(), 1);
    }

    fn leaked_image() -> SharedImage {
        let leaked: &'static crate::image::ProcessImage =
            Box::leak(Box::new(crate::image::ProcessImage::default()));
        unsafe { SharedImage::from_raw(leaked) }
    }

    #[test]
    fn reload_drops_output_governance_forces_it_low() {
        let image = leaked_image();
        let store = ConfigStore::with_image(image);

        let config_a = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r1","enabled":true,"conditions":[],
                          "action":{"type":"output","output":"Q0"}}]}"#,
        );
        store.load_unified(config_a.path()).unwrap();
        image.outputs[0].store(true, Ordering::Relaxed);
        image.mirror_outputs();
        assert!(image.outputs[0].load(Ordering::Relaxed));

        let config_b = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r2","enabled":true,"conditions":[],
                          "action":{"type":"output","output":"Q1"}}]}"#,
        );
        store.load_unified(config_b.path()).unwrap();

        assert!(!image.outputs[0].load(Ordering::Relaxed));
        assert!(!image.memory[crate::image::MEM_OUTPUT_MIRROR_START].load(Ordering::Relaxed));
    }

    #[test]
    fn reload_keeps_output_governed_by_both_configs_untouched() {
        let image = leaked_image();
        let store = ConfigStore::with_image(image);

        let config_a = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r1","enabled":true,"conditions":[],
                          "action":{"type":"output","output":"Q0"}}]}"#,
        );
        store.load_unified(config_a.path()).unwrap();
        image.outputs[0].store(true, Ordering::Relaxed);
        image.mirror_outputs();

        let config_b = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r1","enabled":true,
                          "conditions":[{"type":"input","input":"I0","normally_open":true}],
                          "action":{"type":"output","output":"Q0"}}]}"#,
        );
        store.load_unified(config_b.path()).unwrap();

        assert!(image.outputs[0].load(Ordering::Relaxed));
    }

    #[test]
    fn reload_does_not_force_output_governed_only_by_disabled_rung() {
        let image = leaked_image();
        let store = ConfigStore::with_image(image);

        let config_a = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r1","enabled":false,"conditions":[],
                          "action":{"type":"output","output":"Q0"}}]}"#,
        );
        store.load_unified(config_a.path()).unwrap();
        image.outputs[0].store(true, Ordering::Relaxed);

        let config_b = write_tmp(
            r#"{"timers":[],"counters":[],
                "rungs":[{"id":"r2","enabled":true,"conditions":[],
                          "action":{"type":"output","output":"Q1"}}]}"#,
        );
        store.load_unified(config_b.path()).unwrap();

        assert!(image.outputs[0].load(Ordering::Relaxed));
    }
}
