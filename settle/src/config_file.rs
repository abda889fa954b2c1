//! Action config loading from files or stdin.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value;

/// On-disk config syntax, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Unknown or missing extensions are read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("yaml" | "yml") => Self::Yaml,
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }

    pub fn parse(self, text: &str) -> Result<Value> {
        let value: Value = match self {
            Self::Json => serde_json::from_str(text).context("Failed to parse JSON config")?,
            Self::Yaml => serde_yaml_ng::from_str(text).context("Failed to parse YAML config")?,
            Self::Toml => toml::from_str(text).context("Failed to parse TOML config")?,
        };
        if !value.is_object() {
            bail!("action config must be a map, got {}", kind(&value));
        }
        Ok(value)
    }
}

/// Load an action config. `-` reads JSON from stdin.
pub fn load(path: &Path) -> Result<Value> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read config from stdin")?;
        return ConfigFormat::Json.parse(&text);
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    ConfigFormat::from_path(path)
        .parse(&text)
        .with_context(|| format!("Invalid config file {:?}", path))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}
