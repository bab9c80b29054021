//! YAML configuration loading.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::rules::Rule;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    pub device: String,
    #[serde(default)]
    pub dump: bool,
}

fn default_station() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolisExporterConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "default_station")]
    pub station: u8,
    #[serde(default, rename = "go_collector")]
    pub go_collector: bool,
    #[serde(default, rename = "process_collector")]
    pub process_collector: bool,
}

impl Default for SolisExporterConfig {
    fn default() -> Self {
        SolisExporterConfig {
            listen: None,
            station: default_station(),
            go_collector: false,
            process_collector: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Top-level configuration document. All three sections are optional, but a
/// document where all three are absent is rejected as "empty configuration".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub serial: Option<SerialConfig>,
    #[serde(default)]
    pub solis_exporter: Option<SolisExporterConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

/// Reads and parses the YAML configuration at `path`.
///
/// Unknown keys anywhere in the document are a hard parse error, and a
/// document with none of `serial`/`solis_exporter`/`gateway` present is
/// rejected even though it is syntactically valid YAML.
pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse config file {}", path.display()))?;

    if config.serial.is_none() && config.solis_exporter.is_none() && config.gateway.is_none() {
        bail!("empty configuration");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_fields() {
        let yaml = "serial:\n  device: /dev/ttyUSB0\n  baud: 9600\n";
        let result: std::result::Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn station_defaults_to_one() {
        let yaml = "solis_exporter:\n  listen: \"0.0.0.0:3105\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.solis_exporter.unwrap().station, 1);
    }

    #[test]
    fn accepts_gateway_with_rules() {
        let yaml = "gateway:\n  listen: \"127.0.0.1:502\"\n  rules:\n    - from: 30001\n      to: 39999\n      functions: [3, 4]\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.rules.len(), 1);
        assert_eq!(gateway.rules[0].from, 30001);
    }
}
