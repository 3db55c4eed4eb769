//! Decoder and analysis settings

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::Result;

/// Environment variable naming a settings file
pub const CONFIG_ENV: &str = "RRA_CONFIG";

/// Options that change how structures are decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Decode bottom-level structures on the rayon pool
    pub parallel_blas: bool,
    /// Fail a BLAS whose index map does not cover every primitive
    pub strict_index_map: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            parallel_blas: true,
            strict_index_map: true,
        }
    }
}

/// Surface area heuristic cost model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SahConfig {
    pub traversal_cost: f32,
    pub intersection_cost: f32,
    /// Node areas at or below this use a unit child weight
    pub area_epsilon: f32,
}

impl Default for SahConfig {
    fn default() -> Self {
        Self {
            traversal_cost: 1.0,
            intersection_cost: 1.0,
            area_epsilon: 1e-12,
        }
    }
}

/// All settings, as stored in a JSON settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub decode: DecodeOptions,
    pub sah: SahConfig,
}

impl Settings {
    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(text)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Settings from `path`, else from `RRA_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(p) if !p.is_empty() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    // Negative or NaN costs would break SAH monotonicity
    fn sanitize(&mut self) {
        let defaults = SahConfig::default();
        if !(self.sah.traversal_cost >= 0.0) {
            self.sah.traversal_cost = defaults.traversal_cost;
        }
        if !(self.sah.intersection_cost >= 0.0) {
            self.sah.intersection_cost = defaults.intersection_cost;
        }
        if !(self.sah.area_epsilon >= 0.0) {
            self.sah.area_epsilon = defaults.area_epsilon;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let s = Settings::from_json(r#"{ "sah": { "intersection_cost": 2.5 } }"#).unwrap();
        assert_eq!(s.sah.intersection_cost, 2.5);
        assert_eq!(s.sah.traversal_cost, 1.0);
        assert!(s.decode.strict_index_map);
    }

    #[test]
    fn test_negative_cost_reset() {
        let s = Settings::from_json(r#"{ "sah": { "traversal_cost": -4.0 } }"#).unwrap();
        assert_eq!(s.sah.traversal_cost, 1.0);
    }

    #[test]
    fn test_bad_json() {
        let err = Settings::from_json("{ not json").unwrap_err();
        assert_eq!(err.kind(), crate::util::ErrorKind::Json);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::default();
        s.decode.parallel_blas = false;
        s.save(&path).unwrap();
        assert_eq!(Settings::load(Some(&path)).unwrap(), s);
    }
}
