//! Surgical configuration snapshots.
//!
//! A snapshot keeps the global study parameters in full but narrows every
//! per-axis collection down to the one entry the work unit uses, so editing a
//! different frequency, entity or placement never changes this unit's digest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::work_unit::WorkUnit;

/// Where the per-axis collections live in the study configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotLayout {
    /// List of entity names.
    pub entities_key: String,
    /// Map of entity name to definition.
    pub entity_definitions_key: String,
    /// List of frequencies in MHz.
    pub frequencies_key: String,
    /// Map of frequency (as text) to the frequency-specific block.
    pub frequency_blocks_key: String,
    /// Map of scenario name to scenario definition.
    pub scenarios_key: String,
    /// Map of position name to position, inside a scenario.
    pub positions_key: String,
    /// Map of orientation name to orientation, inside a scenario.
    pub orientations_key: String,
}

impl Default for SnapshotLayout {
    fn default() -> Self {
        Self {
            entities_key: "phantoms".to_string(),
            entity_definitions_key: "phantom_definitions".to_string(),
            frequencies_key: "frequencies_mhz".to_string(),
            frequency_blocks_key: "antenna_config".to_string(),
            scenarios_key: "placement_scenarios".to_string(),
            positions_key: "positions".to_string(),
            orientations_key: "orientations".to_string(),
        }
    }
}

impl SnapshotLayout {
    fn axis_keys(&self) -> [&str; 5] {
        [
            &self.entities_key,
            &self.entity_definitions_key,
            &self.frequencies_key,
            &self.frequency_blocks_key,
            &self.scenarios_key,
        ]
    }
}

/// Minimal configuration subset that affects `unit`.
pub fn build_surgical_snapshot(study: &Value, unit: &WorkUnit, layout: &SnapshotLayout) -> Value {
    let mut snapshot = Map::new();

    if let Some(root) = study.as_object() {
        let axis_keys = layout.axis_keys();
        for (key, value) in root {
            if !axis_keys.contains(&key.as_str()) {
                snapshot.insert(key.clone(), value.clone());
            }
        }
    }

    snapshot.insert(
        layout.entities_key.clone(),
        Value::Array(vec![Value::String(unit.entity.clone())]),
    );
    snapshot.insert(
        layout.entity_definitions_key.clone(),
        singleton(study.get(&layout.entity_definitions_key), &unit.entity),
    );
    snapshot.insert(
        layout.frequencies_key.clone(),
        Value::Array(vec![Value::from(unit.frequency_mhz)]),
    );
    snapshot.insert(
        layout.frequency_blocks_key.clone(),
        singleton(
            study.get(&layout.frequency_blocks_key),
            &unit.frequency_mhz.to_string(),
        ),
    );
    snapshot.insert(
        layout.scenarios_key.clone(),
        scenario_snapshot(study.get(&layout.scenarios_key), unit, layout),
    );

    Value::Object(snapshot)
}

/// `{key: collection[key]}`, or an empty map when the entry is absent.
fn singleton(collection: Option<&Value>, key: &str) -> Value {
    let mut map = Map::new();
    if let Some(entry) = collection.and_then(|c| c.get(key)) {
        map.insert(key.to_string(), entry.clone());
    }
    Value::Object(map)
}

fn scenario_snapshot(scenarios: Option<&Value>, unit: &WorkUnit, layout: &SnapshotLayout) -> Value {
    let mut outer = Map::new();
    let Some(definition) = scenarios.and_then(|s| s.get(&unit.scenario)) else {
        return Value::Object(outer);
    };

    let scenario = match definition.as_object() {
        Some(fields) => {
            let mut narrowed = Map::new();
            for (key, value) in fields {
                if key == &layout.positions_key {
                    narrowed.insert(key.clone(), singleton(Some(value), &unit.position));
                } else if key == &layout.orientations_key {
                    narrowed.insert(key.clone(), singleton(Some(value), &unit.orientation));
                } else {
                    narrowed.insert(key.clone(), value.clone());
                }
            }
            Value::Object(narrowed)
        }
        None => definition.clone(),
    };
    outer.insert(unit.scenario.clone(), scenario);
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::canonical::digest;
    use serde_json::json;

    fn study() -> Value {
        json!({
            "simulation_parameters": {"max_step_mm": 1.5, "excitation": "gaussian"},
            "phantoms": ["thelonious", "eartha"],
            "phantom_definitions": {
                "thelonious": {"model": "thelonious_v3"},
                "eartha": {"model": "eartha_v3"}
            },
            "frequencies_mhz": [700, 900],
            "antenna_config": {
                "700": {"model": "pifa_700", "grid_mm": 2.0},
                "900": {"model": "pifa_900", "grid_mm": 1.8}
            },
            "placement_scenarios": {
                "by_cheek": {
                    "bounding_box": "head",
                    "positions": {"center": [0, 0, 0], "edge": [10, 0, 0]},
                    "orientations": {"vertical": [0, 0], "tilted": [15, 0]}
                },
                "front_of_eyes": {"positions": {"center": [0, 0, 20]}}
            }
        })
    }

    fn unit() -> WorkUnit {
        WorkUnit::new("thelonious", 700, "by_cheek", "center", "vertical")
    }

    #[test]
    fn test_snapshot_narrows_every_axis() {
        let snapshot = build_surgical_snapshot(&study(), &unit(), &SnapshotLayout::default());
        assert_eq!(
            snapshot,
            json!({
                "simulation_parameters": {"max_step_mm": 1.5, "excitation": "gaussian"},
                "phantoms": ["thelonious"],
                "phantom_definitions": {"thelonious": {"model": "thelonious_v3"}},
                "frequencies_mhz": [700],
                "antenna_config": {"700": {"model": "pifa_700", "grid_mm": 2.0}},
                "placement_scenarios": {
                    "by_cheek": {
                        "bounding_box": "head",
                        "positions": {"center": [0, 0, 0]},
                        "orientations": {"vertical": [0, 0]}
                    }
                }
            })
        );
    }

    #[test]
    fn test_other_axis_edits_do_not_change_digest() {
        let layout = SnapshotLayout::default();
        let base = digest(&build_surgical_snapshot(&study(), &unit(), &layout));

        let mut edited = study();
        edited["antenna_config"]["900"]["grid_mm"] = json!(1.2);
        edited["phantom_definitions"]["eartha"]["model"] = json!("eartha_v4");
        edited["placement_scenarios"]["by_cheek"]["positions"]["edge"] = json!([12, 0, 0]);
        edited["placement_scenarios"]["by_cheek"]["orientations"]["tilted"] = json!([30, 0]);
        edited["placement_scenarios"]["front_of_eyes"]["positions"]["center"] = json!([0, 0, 25]);
        edited["frequencies_mhz"] = json!([700, 900, 2450]);
        edited["phantoms"] = json!(["thelonious", "eartha", "duke"]);

        assert_eq!(base, digest(&build_surgical_snapshot(&edited, &unit(), &layout)));
    }

    #[test]
    fn test_own_axis_and_global_edits_change_digest() {
        let layout = SnapshotLayout::default();
        let base = digest(&build_surgical_snapshot(&study(), &unit(), &layout));

        let mut own_frequency = study();
        own_frequency["antenna_config"]["700"]["grid_mm"] = json!(1.0);
        assert_ne!(base, digest(&build_surgical_snapshot(&own_frequency, &unit(), &layout)));

        let mut own_position = study();
        own_position["placement_scenarios"]["by_cheek"]["positions"]["center"] = json!([1, 0, 0]);
        assert_ne!(base, digest(&build_surgical_snapshot(&own_position, &unit(), &layout)));

        let mut global = study();
        global["simulation_parameters"]["max_step_mm"] = json!(1.0);
        assert_ne!(base, digest(&build_surgical_snapshot(&global, &unit(), &layout)));
    }

    #[test]
    fn test_missing_entries_become_empty_maps() {
        let unit = WorkUnit::new("duke", 2450, "free_space", "default", "default");
        let snapshot = build_surgical_snapshot(&study(), &unit, &SnapshotLayout::default());
        assert_eq!(snapshot["phantom_definitions"], json!({}));
        assert_eq!(snapshot["antenna_config"], json!({}));
        assert_eq!(snapshot["placement_scenarios"], json!({}));
    }

    #[test]
    fn test_custom_layout_keys() {
        let layout = SnapshotLayout {
            frequency_blocks_key: "sources".to_string(),
            ..SnapshotLayout::default()
        };
        let study = json!({
            "frequencies_mhz": [700, 900],
            "sources": {"700": {"power_w": 1}, "900": {"power_w": 2}},
            "antenna_config": {"unrelated": true}
        });
        let snapshot = build_surgical_snapshot(&study, &unit(), &layout);
        assert_eq!(snapshot["sources"], json!({"700": {"power_w": 1}}));
        assert_eq!(snapshot["antenna_config"], json!({"unrelated": true}));
    }
}
