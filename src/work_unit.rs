//! Work units and the sweep plan that enumerates them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::SnapshotLayout;
use crate::config::{ConfigError, ConfigResult};

/// One schedulable job: a fixed combination of sweep axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Simulated entity, e.g. a phantom model.
    pub entity: String,
    pub frequency_mhz: u32,
    pub scenario: String,
    pub position: String,
    pub orientation: String,
}

impl WorkUnit {
    pub fn new(
        entity: impl Into<String>,
        frequency_mhz: u32,
        scenario: impl Into<String>,
        position: impl Into<String>,
        orientation: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            frequency_mhz,
            scenario: scenario.into(),
            position: position.into(),
            orientation: orientation.into(),
        }
    }

    /// `<root>/<entity>/<frequency>MHz/<scenario>_<position>_<orientation>`
    pub fn dir(&self, results_root: &Path) -> PathBuf {
        results_root
            .join(sanitize(&self.entity))
            .join(format!("{}MHz", self.frequency_mhz))
            .join(format!(
                "{}_{}_{}",
                sanitize(&self.scenario),
                sanitize(&self.position),
                sanitize(&self.orientation)
            ))
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}MHz/{}_{}_{}",
            self.entity, self.frequency_mhz, self.scenario, self.position, self.orientation
        )
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// Ordered list of work units derived from a study configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SweepPlan {
    units: Vec<WorkUnit>,
}

impl SweepPlan {
    /// Enumerate entity x frequency x scenario x position x orientation.
    ///
    /// Entities come from the entity list, falling back to the keys of the
    /// entity definitions. A scenario without positions or orientations
    /// contributes a single `default` entry on that axis.
    pub fn enumerate(study: &Value, layout: &SnapshotLayout) -> ConfigResult<Self> {
        let entities = entity_names(study, layout)?;
        let frequencies = frequencies(study, layout)?;
        let scenarios = study
            .get(&layout.scenarios_key)
            .and_then(Value::as_object)
            .ok_or_else(|| ConfigError::study(&layout.scenarios_key, "expected an object of scenarios"))?;

        let mut units = Vec::new();
        for entity in &entities {
            for frequency in &frequencies {
                for (scenario, definition) in scenarios {
                    let positions = axis_keys(definition, &layout.positions_key);
                    let orientations = axis_keys(definition, &layout.orientations_key);
                    for position in &positions {
                        for orientation in &orientations {
                            units.push(WorkUnit::new(
                                entity.clone(),
                                *frequency,
                                scenario.clone(),
                                position.clone(),
                                orientation.clone(),
                            ));
                        }
                    }
                }
            }
        }
        reject_shared_dirs(&units, layout)?;
        Ok(Self { units })
    }

    pub fn from_units(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }

    /// Round-robin subset `index` of `count` disjoint shards.
    pub fn shard(&self, index: usize, count: usize) -> ConfigResult<Self> {
        if count == 0 || index >= count {
            return Err(ConfigError::InvalidShard { index, count });
        }
        let units = self
            .units
            .iter()
            .enumerate()
            .filter(|(position, _)| position % count == index)
            .map(|(_, unit)| unit.clone())
            .collect();
        Ok(Self { units })
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Distinct units must not share a results directory, or they would overwrite
/// each other's checkpoint record.
fn reject_shared_dirs(units: &[WorkUnit], layout: &SnapshotLayout) -> ConfigResult<()> {
    let mut seen: HashMap<PathBuf, &WorkUnit> = HashMap::with_capacity(units.len());
    for unit in units {
        if let Some(other) = seen.insert(unit.dir(Path::new("")), unit) {
            let key = if other.entity != unit.entity {
                &layout.entities_key
            } else {
                &layout.scenarios_key
            };
            return Err(ConfigError::study(
                key,
                format!(
                    "units {} and {} map to the same results directory; rename one of them",
                    other, unit
                ),
            ));
        }
    }
    Ok(())
}

fn entity_names(study: &Value, layout: &SnapshotLayout) -> ConfigResult<Vec<String>> {
    if let Some(list) = study.get(&layout.entities_key) {
        let items = list
            .as_array()
            .ok_or_else(|| ConfigError::study(&layout.entities_key, "expected a list of names"))?;
        return items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::study(&layout.entities_key, "entity names must be strings"))
            })
            .collect();
    }
    study
        .get(&layout.entity_definitions_key)
        .and_then(Value::as_object)
        .map(|definitions| definitions.keys().cloned().collect())
        .ok_or_else(|| ConfigError::study(&layout.entities_key, "no entities configured"))
}

fn frequencies(study: &Value, layout: &SnapshotLayout) -> ConfigResult<Vec<u32>> {
    let items = study
        .get(&layout.frequencies_key)
        .and_then(Value::as_array)
        .ok_or_else(|| ConfigError::study(&layout.frequencies_key, "expected a list of frequencies"))?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|f| u32::try_from(f).ok())
                .or_else(|| {
                    item.as_f64()
                        .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64)
                        .map(|f| f as u32)
                })
                .ok_or_else(|| {
                    ConfigError::study(&layout.frequencies_key, "frequencies must be whole MHz values")
                })
        })
        .collect()
}

fn axis_keys(definition: &Value, key: &str) -> Vec<String> {
    match definition.get(key).and_then(Value::as_object) {
        Some(entries) if !entries.is_empty() => entries.keys().cloned().collect(),
        _ => vec!["default".to_string()],
    }
}
