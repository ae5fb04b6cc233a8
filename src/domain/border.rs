// Border domain model - min/soll/max thresholds and the border resolver
use super::metric::MetricKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configured thresholds for one metric; `soll` is the target value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Border {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soll: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Border {
    pub fn new(min: Option<f64>, soll: Option<f64>, max: Option<f64>) -> Self {
        Self { min, soll, max }
    }

    pub fn below_min(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min)
    }

    pub fn above_max(&self, value: f64) -> bool {
        self.max.is_some_and(|max| value > max)
    }
}

pub type Borders = BTreeMap<MetricKey, Border>;

/// Merge default borders with machine-type borders.
///
/// Every key of either input is kept. For a key present in both, the
/// machine-type entry replaces the default entry as a whole; sub-fields are
/// never mixed across sources.
pub fn merge_borders(defaults: &Borders, machine_type: &Borders) -> Borders {
    let mut merged = defaults.clone();
    for (key, border) in machine_type {
        merged.insert(key.clone(), *border);
    }
    merged
}

/// The two border sources held by the session, each replaced wholesale on fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BorderSet {
    pub defaults: Borders,
    pub machine_type: Borders,
}

impl BorderSet {
    /// Borders in effect; machine-type borders only count once a type is selected
    pub fn resolve(&self, machine_type_selected: bool) -> Borders {
        if machine_type_selected {
            merge_borders(&self.defaults, &self.machine_type)
        } else {
            self.defaults.clone()
        }
    }

    pub fn clear(&mut self) {
        self.defaults.clear();
        self.machine_type.clear();
    }
}
