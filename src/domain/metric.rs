// Metric domain model - Catalog of bench sensor keys and value snapshots
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identifier of a sensor reading as it appears on the wire (e.g. `GAS_METER`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricKey(String);

impl MetricKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Which meter a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGroup {
    Energy,
    Gas,
    Heating,
    Chp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricClass {
    #[default]
    Instantaneous,
    /// Cumulative counter; the backend reports deltas for these
    Counter,
    /// Efficiency ratio, unstable right after start
    Efficiency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub key: MetricKey,
    pub group: MetricGroup,
    #[serde(default)]
    pub class: MetricClass,
}

impl MetricDefinition {
    pub fn new(key: &str, group: MetricGroup, class: MetricClass) -> Self {
        Self {
            key: MetricKey::new(key),
            group,
            class,
        }
    }
}

/// The closed set of metric keys known to the session.
///
/// Anything not listed here is ignored on every inbound path.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    definitions: Vec<MetricDefinition>,
    index: HashMap<MetricKey, MetricClass>,
}

impl MetricCatalog {
    /// Build a catalog; on duplicate keys the first definition wins
    pub fn new(definitions: Vec<MetricDefinition>) -> Self {
        let mut index = HashMap::new();
        let mut kept = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if index.contains_key(&definition.key) {
                tracing::warn!("Duplicate metric definition for {}, ignoring", definition.key);
                continue;
            }
            index.insert(definition.key.clone(), definition.class);
            kept.push(definition);
        }
        Self {
            definitions: kept,
            index,
        }
    }

    /// Catalog matching the bench's energy, gas, heating and CHP register maps
    pub fn builtin() -> Self {
        use MetricClass::{Counter, Efficiency, Instantaneous};
        use MetricGroup::{Chp, Energy, Gas, Heating};

        let table: &[(&str, MetricGroup, MetricClass)] = &[
            ("GENERATED_ENERGY", Energy, Counter),
            ("CONSUMED_ENERGY", Energy, Counter),
            ("ACTIVE_POWER", Energy, Instantaneous),
            ("REACTIVE_POWER_BLIND_POWER", Energy, Instantaneous),
            ("APPARENT_POWER_RESERVED", Energy, Instantaneous),
            ("VOLTAGE_L1_VOLTS", Energy, Instantaneous),
            ("VOLTAGE_L2_VOLTS", Energy, Instantaneous),
            ("VOLTAGE_L3_VOLTS", Energy, Instantaneous),
            ("FREQUENCY", Energy, Instantaneous),
            ("CURRENT", Energy, Instantaneous),
            ("COS_PHI", Energy, Instantaneous),
            ("GAS_TEMPERATURE", Gas, Instantaneous),
            ("GAS_METER", Gas, Counter),
            ("AMBIENT_TEMPERATURE", Gas, Instantaneous),
            ("AMBIENT_PRESSURE", Gas, Instantaneous),
            ("GAS_PRESSURE", Gas, Instantaneous),
            ("GAS_POWER", Gas, Instantaneous),
            ("ELECTRICAL_EFFICIENCY", Gas, Efficiency),
            ("THERMAL_EFFICIENCY", Gas, Efficiency),
            ("OVERALL_EFFICIENCY", Gas, Efficiency),
            ("GENERATED_ENERGY_HEATING", Heating, Counter),
            ("SUPPLY_TEMPERATURE", Heating, Instantaneous),
            ("RETURN_TEMPERATURE", Heating, Instantaneous),
            ("TEMPERATURE_DIFFERENCE", Heating, Instantaneous),
            ("VOLUME_FLOW", Heating, Instantaneous),
            ("TOTAL_VOLUME", Heating, Counter),
            ("POWER", Heating, Instantaneous),
            ("EXHAUST_TEMPERATURE", Chp, Instantaneous),
            ("HEATING_WATER_FLOW", Chp, Instantaneous),
            ("HEATING_WATER_RETURN", Chp, Instantaneous),
            ("ENGINE_COOLANT", Chp, Instantaneous),
            ("ENGINE_COOLANT_FLOW", Chp, Instantaneous),
            ("ENGINE_COOLANT_RETURN", Chp, Instantaneous),
            ("CONTROL_CABINET", Chp, Instantaneous),
            ("HOUSING", Chp, Instantaneous),
            ("GENERATOR_WINDING", Chp, Instantaneous),
            ("ENGINE_OIL", Chp, Instantaneous),
            ("OPERATING_HOURS", Chp, Counter),
            ("START_COUNT", Chp, Counter),
        ];

        Self::new(
            table
                .iter()
                .map(|(key, group, class)| MetricDefinition::new(key, *group, *class))
                .collect(),
        )
    }

    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    pub fn contains(&self, key: &MetricKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn class_of(&self, key: &MetricKey) -> Option<MetricClass> {
        self.index.get(key).copied()
    }

    pub fn is_counter(&self, key: &MetricKey) -> bool {
        self.class_of(key) == Some(MetricClass::Counter)
    }

    pub fn is_efficiency(&self, key: &MetricKey) -> bool {
        self.class_of(key) == Some(MetricClass::Efficiency)
    }

    /// Drop every key the catalog does not know
    pub fn retain_known(&self, snapshot: Snapshot) -> Snapshot {
        snapshot
            .into_iter()
            .filter(|(key, _)| {
                let known = self.contains(key);
                if !known {
                    tracing::debug!("Ignoring unknown metric key {}", key);
                }
                known
            })
            .collect()
    }
}

/// Parse a wire value into a reading.
///
/// The backend sends plain numbers or numbers pre-formatted as strings ("12.50").
pub fn parse_metric_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Point-in-time mapping of metric values
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<MetricKey, f64>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw JSON entries, dropping anything that is not a finite number
    pub fn from_raw<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut snapshot = Self::new();
        for (key, value) in entries {
            match parse_metric_value(value) {
                Some(v) => {
                    snapshot.insert(MetricKey::new(key.as_str()), v);
                }
                None if value.is_null() => {}
                None => tracing::debug!("Dropping non-numeric value for {}: {}", key, value),
            }
        }
        snapshot
    }

    pub fn get(&self, key: &MetricKey) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: MetricKey, value: f64) -> Option<f64> {
        self.0.insert(key, value)
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

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, f64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// Apply an update and return the keys whose value actually changed
    pub fn apply_changes(&mut self, update: &Snapshot) -> Vec<MetricKey> {
        let mut changed = Vec::new();
        for (key, value) in update.iter() {
            if self.get(key) != Some(value) {
                self.0.insert(key.clone(), value);
                changed.push(key.clone());
            }
        }
        changed
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
        Ok(raw.map(|raw| Self::from_raw(&raw)).unwrap_or_default())
    }
}

impl IntoIterator for Snapshot {
    type Item = (MetricKey, f64);
    type IntoIter = std::collections::btree_map::IntoIter<MetricKey, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(MetricKey, f64)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (MetricKey, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
