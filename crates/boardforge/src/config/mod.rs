use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// A fully merged configuration document. Built from one or more layer
/// files; later layers override earlier ones at the key level.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_value(path: PathBuf, value: Value) -> Self {
        Self { path, value }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    merge_values(base, overlay);
}

fn load_value(path: &Path) -> Result<Value> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
}

/// Load a single configuration file.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value: load_value(path)?,
    })
}

/// Load a stack of layer files in order. Later files override earlier ones:
/// tables merge recursively, scalars and arrays replace wholesale.
pub fn load_layers(paths: &[PathBuf]) -> Result<ConfigDoc> {
    let Some(last) = paths.last() else {
        return Err(Error::msg("no configuration files to load"));
    };
    let mut acc = Value::Table(Default::default());
    for p in paths {
        let layer = load_value(p)?;
        merge_values(&mut acc, layer);
    }
    Ok(ConfigDoc {
        path: last.clone(),
        value: acc,
    })
}

/// Job count knob: `"auto"` or a concrete integer.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum Jobs {
    Count(usize),
    Word(String),
}

impl Default for Jobs {
    fn default() -> Self {
        Jobs::Word("auto".to_string())
    }
}

impl Jobs {
    pub fn resolve(&self) -> usize {
        match self {
            Jobs::Count(n) if *n > 0 => *n,
            _ => crate::executor::auto_jobs(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub jobs: Jobs,
    pub sources_dir: String,
    pub history_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            jobs: Jobs::default(),
            sources_dir: "sources".to_string(),
            history_dir: "history".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct ToolchainSpec {
    pub kind: String,
    pub url: Option<String>,
    pub path: Option<String>,
}

/// Environment-wide settings (`boardforge.toml` at the root). A missing
/// file means defaults; a malformed one is fatal.
#[derive(Debug, Clone, serde::Deserialize, Default)]
#[serde(default)]
pub struct MasterConfig {
    pub general: GeneralConfig,
    pub toolchain: std::collections::BTreeMap<String, ToolchainSpec>,
}

pub fn load_master(path: &Path) -> Result<MasterConfig> {
    if !path.is_file() {
        return Ok(MasterConfig::default());
    }
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))
}
