//! Field extraction from decoded data.
//!
//! Each entry in `transforms` names an output field. String values that
//! start with `$` are paths into `input`; every other value is copied
//! through as a literal.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub input: Value,
    pub transforms: Map<String, Value>,
}

impl TransformConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Ok(Self::deserialize(value)?)
    }
}

/// Build the output map, in `transforms` order. A path that resolves to
/// nothing yields `null`.
pub fn apply(config: &TransformConfig) -> Map<String, Value> {
    let mut output = Map::with_capacity(config.transforms.len());

    for (field, spec) in &config.transforms {
        let value = match spec {
            Value::String(expr) if expr.starts_with('$') => {
                match path::extract(&config.input, expr) {
                    Some(found) => found.clone(),
                    None => {
                        warn!(path = %expr, field = %field, "Path did not match");
                        Value::Null
                    }
                }
            }
            literal => literal.clone(),
        };
        output.insert(field.clone(), value);
    }

    info!(fields = output.len(), "Data transformed");
    output
}
