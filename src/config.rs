//! Run configuration (spec section 6): a `moves` section mapping move-kind
//! keys to per-molecule parameter objects, loaded from a JSON file path or
//! an inline JSON string and validated eagerly so a misconfiguration is
//! reported before any Markov step runs.

use crate::error::{Error, Result};
use crate::moves::MoveListEntry;
use crate::moves::titration::EquilibriumProcess;
use nalgebra::Vector3;
use std::collections::HashMap;
use std::fs;

/// Every move-kind key the configuration schema recognises. An unrecognised
/// key is a configuration error, never silently ignored.
pub const RECOGNIZED_MOVE_KINDS: &[&str] = &[
    "atomtranslate",
    "atomrotate",
    "moltransrot",
    "moltransrotcluster",
    "ClusterMove",
    "ctransnr",
    "crankshaft",
    "pivot",
    "reptate",
    "isobaric",
    "isochoric",
    "atomgc",
    "gc",
    "titrate",
    "gctit",
    "conformationswap",
    "temper",
    "random",
    "_jsonfile",
];

/// The run configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    pub moves: serde_json::Map<String, serde_json::Value>,
}

impl Config {
    /// Parse from an inline JSON string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(text)?;
        Self::from_document(document)
    }

    /// Parse from a file on disk, wrapping the I/O error with the path for
    /// a useful message.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_string(), source })?;
        Self::from_json_str(&text)
    }

    fn from_document(document: serde_json::Value) -> Result<Self> {
        let moves = document
            .get("moves")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let config = Config { moves };
        config.validate()?;
        Ok(config)
    }

    /// Eagerly reject any move-kind key this schema doesn't recognise.
    pub fn validate(&self) -> Result<()> {
        for key in self.moves.keys() {
            if !RECOGNIZED_MOVE_KINDS.contains(&key.as_str()) {
                return Err(Error::UnknownMoveKind(key.clone()));
            }
        }
        Ok(())
    }

    pub fn section(&self, key: &str) -> Option<&serde_json::Value> {
        self.moves.get(key)
    }

    /// The `_jsonfile` key: output path for the statistics dump, or `None`
    /// to print to stdout.
    pub fn json_output_file(&self) -> Option<String> {
        self.moves.get("_jsonfile").and_then(|v| v.as_str()).map(str::to_string)
    }
}

fn as_f64(params: &serde_json::Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn as_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn as_direction(params: &serde_json::Value, key: &str) -> Vector3<f64> {
    let components = params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|x| x.as_f64()).collect::<Vec<_>>());
    match components {
        Some(values) if values.len() == 3 => Vector3::new(values[0], values[1], values[2]),
        _ => Vector3::new(1.0, 1.0, 1.0),
    }
}

/// Build one [`MoveListEntry`] per molecule named in `section`, resolving
/// molecule names to ids through `molecule_ids`. The section's shape is an
/// object: `{ "<molecule name>": { "dp": ..., "prob": ..., ... }, ... }`.
pub fn parse_move_list(section: &serde_json::Value, molecule_ids: &HashMap<String, usize>) -> Result<Vec<MoveListEntry>> {
    let object = section.as_object().cloned().unwrap_or_default();
    let mut entries = Vec::with_capacity(object.len());
    for (molecule_name, params) in &object {
        let molecule_id = *molecule_ids
            .get(molecule_name)
            .ok_or_else(|| Error::UnknownMolecule(molecule_name.clone()))?;
        let entry = MoveListEntry::new(molecule_id)
            .with_probability(as_f64(params, "prob", 1.0))
            .with_dp(as_f64(params, "dp", 0.0), as_f64(params, "dprot", 0.0))
            .with_direction(as_direction(params, "dir"))
            .with_repeat_flags(as_bool(params, "peratom", false), as_bool(params, "permol", false));
        entries.push(entry);
    }
    Ok(entries)
}

/// Reads a scalar parameter shared across an entire move-kind section
/// (rather than per molecule), e.g. `isobaric`'s top-level `pressure`.
pub fn shared_scalar(section: &serde_json::Value, key: &str, default: f64) -> f64 {
    as_f64(section, key, default)
}

pub fn shared_bool(section: &serde_json::Value, key: &str, default: bool) -> bool {
    as_bool(section, key, default)
}

/// Parses the `processes` list shared by `titrate`/`gctit`:
/// `[{ "bound": <id>, "unbound": <id>, "pk": f64, "ph": f64 }, ...]`.
pub fn parse_processes(section: &serde_json::Value) -> Vec<EquilibriumProcess> {
    section
        .get("processes")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    Some(EquilibriumProcess {
                        bound_id: entry.get("bound")?.as_u64()? as usize,
                        unbound_id: entry.get("unbound")?.as_u64()? as usize,
                        pk: entry.get("pk")?.as_f64()?,
                        ph: entry.get("ph")?.as_f64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `savecharge`: `{ "<id>": <charge>, ... }`.
pub fn parse_save_charge(section: &serde_json::Value) -> HashMap<usize, f64> {
    section
        .get("savecharge")
        .and_then(|v| v.as_object())
        .map(|object| {
            object
                .iter()
                .filter_map(|(id, charge)| Some((id.parse::<usize>().ok()?, charge.as_f64()?)))
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `staticmol`: a list of molecule names, resolved to ids.
pub fn parse_static_molecules(section: &serde_json::Value, molecule_ids: &HashMap<String, usize>) -> Vec<usize> {
    section
        .get("staticmol")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|name| name.as_str())
                .filter_map(|name| molecule_ids.get(name).copied())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_move_kind_is_rejected() {
        let result = Config::from_json_str(r#"{ "moves": { "not_a_real_move": {} } }"#);
        assert!(matches!(result, Err(Error::UnknownMoveKind(_))));
    }

    #[test]
    fn recognised_keys_parse_cleanly() {
        let config = Config::from_json_str(
            r#"{ "moves": { "atomtranslate": { "water": { "dp": 0.5, "prob": 1.0 } }, "_jsonfile": "out.json" } }"#,
        )
        .unwrap();
        assert_eq!(config.json_output_file().as_deref(), Some("out.json"));
    }

    #[test]
    fn parse_move_list_resolves_molecule_names_to_ids() {
        let config = Config::from_json_str(
            r#"{ "moves": { "atomtranslate": { "water": { "dp": 0.5, "peratom": true } } } }"#,
        )
        .unwrap();
        let mut molecule_ids = HashMap::new();
        molecule_ids.insert("water".to_string(), 3usize);
        let entries = parse_move_list(config.section("atomtranslate").unwrap(), &molecule_ids).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].molecule_id, 3);
        assert!(entries[0].per_atom);
    }

    #[test]
    fn parse_move_list_rejects_unknown_molecule_name() {
        let config = Config::from_json_str(r#"{ "moves": { "atomtranslate": { "mystery": { "dp": 0.5 } } } }"#).unwrap();
        let molecule_ids = HashMap::new();
        let result = parse_move_list(config.section("atomtranslate").unwrap(), &molecule_ids);
        assert!(matches!(result, Err(Error::UnknownMolecule(_))));
    }
}
