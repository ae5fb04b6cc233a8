// Range evaluation - Flags readings outside their resolved borders
use super::border::BorderSet;
use super::metric::{MetricCatalog, MetricKey, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_WARMUP_SECONDS: u64 = 20 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutOfRange {
    pub min: bool,
    pub max: bool,
}

impl OutOfRange {
    pub fn any(&self) -> bool {
        self.min || self.max
    }
}

/// Keys currently judged out of range; an absent key is in range or not evaluated
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutOfRangeState(BTreeMap<MetricKey, OutOfRange>);

impl OutOfRangeState {
    pub fn get(&self, key: &MetricKey) -> Option<OutOfRange> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    fn flag(&mut self, key: MetricKey, flags: OutOfRange) {
        self.0.insert(key, flags);
    }

    /// OR the flags of a fresh evaluation into this state. Returns true if anything changed.
    pub fn absorb(&mut self, fresh: &OutOfRangeState) -> bool {
        let mut changed = false;
        for (key, flags) in &fresh.0 {
            let entry = self.0.entry(key.clone()).or_default();
            let merged = OutOfRange {
                min: entry.min || flags.min,
                max: entry.max || flags.max,
            };
            if merged != *entry {
                *entry = merged;
                changed = true;
            }
        }
        changed
    }
}

/// Whether a flag survives a later in-range reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangePolicy {
    /// Flags stay set until the session is reset
    #[default]
    Sticky,
    /// Each evaluation replaces the previous flags
    Clearing,
}

#[derive(Debug, Clone)]
pub struct RangeEvaluator {
    catalog: Arc<MetricCatalog>,
    warmup_seconds: u64,
    policy: OutOfRangePolicy,
}

impl RangeEvaluator {
    pub fn new(catalog: Arc<MetricCatalog>, warmup_seconds: u64, policy: OutOfRangePolicy) -> Self {
        Self {
            catalog,
            warmup_seconds,
            policy,
        }
    }

    pub fn policy(&self) -> OutOfRangePolicy {
        self.policy
    }

    /// Evaluate the current readings against the resolved borders.
    ///
    /// Efficiency metrics are skipped until the warm-up has elapsed.
    pub fn evaluate(
        &self,
        current: &Snapshot,
        borders: &BorderSet,
        elapsed_seconds: u64,
        machine_type_selected: bool,
    ) -> OutOfRangeState {
        let resolved = borders.resolve(machine_type_selected);
        let warmed_up = elapsed_seconds >= self.warmup_seconds;
        let mut state = OutOfRangeState::default();

        for (key, value) in current.iter() {
            let Some(border) = resolved.get(key) else {
                continue;
            };
            if !warmed_up && self.catalog.is_efficiency(key) {
                continue;
            }
            let flags = OutOfRange {
                min: border.below_min(value),
                max: border.above_max(value),
            };
            if flags.any() {
                state.flag(key.clone(), flags);
            }
        }

        state
    }

    /// Fold a fresh evaluation into the session state according to the policy.
    /// Returns true if the visible state changed.
    pub fn apply(&self, state: &mut OutOfRangeState, fresh: OutOfRangeState) -> bool {
        match self.policy {
            OutOfRangePolicy::Sticky => state.absorb(&fresh),
            OutOfRangePolicy::Clearing => {
                let changed = *state != fresh;
                *state = fresh;
                changed
            }
        }
    }
}
