//! Hub config loader (strict parsing).
//!
//! The file is YAML, but components only ever see the `ConfigProvider`
//! surface: `get(key, default)` with dotted keys.

use std::fs;

use serde_yaml::Value;

use roomcast_core::provider::ConfigProvider;
use roomcast_core::{Result, RoomcastError};

/// YAML-backed `ConfigProvider` with dotted-key lookup.
#[derive(Debug)]
pub struct YamlConfig {
    root: Value,
}

pub fn load_from_file(path: &str) -> Result<YamlConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RoomcastError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<YamlConfig> {
    let root: Value =
        serde_yaml::from_str(s).map_err(|e| RoomcastError::BadRequest(format!("invalid yaml: {e}")))?;
    if !root.is_mapping() && !root.is_null() {
        return Err(RoomcastError::BadRequest(
            "config root must be a mapping".into(),
        ));
    }
    Ok(YamlConfig { root })
}

impl ConfigProvider for YamlConfig {
    fn get_raw(&self, key: &str) -> Option<String> {
        let mut cur = &self.root;
        for part in key.split('.') {
            cur = cur.get(part)?;
        }
        match cur {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
