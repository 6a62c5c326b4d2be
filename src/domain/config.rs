use crate::engine::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Run configuration. Every field has a default, so an empty document is a
/// valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_true")]
    pub coverage: bool,
    #[serde(default)]
    pub openapi_path: Option<String>,
    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub sample_stddev: bool,
}

fn default_true() -> bool {
    true
}

fn default_repeat() -> u32 {
    1
}

fn default_listener_buffer() -> usize {
    1024
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            timeout_ms: None,
            proxy_url: None,
            verify_ssl: true,
            follow_redirects: true,
            repeat: default_repeat(),
            fail_fast: false,
            coverage: true,
            openapi_path: None,
            listener_buffer: default_listener_buffer(),
            variables: BTreeMap::new(),
            sample_stddev: true,
        }
    }
}

impl HarnessConfig {
    /// Decode JSON when the first non-whitespace byte is `{`, YAML otherwise.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(|err| ConfigError::Read(err.to_string()))?;
        Self::from_str_sniffed(&raw)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|err| ConfigError::Read(format!("`{}`: {err}", path.display())))?;
        Self::from_reader(file)
    }

    fn from_str_sniffed(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        if raw.trim_start().starts_with('{') {
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
        } else {
            serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repeat == 0 {
            return Err(ConfigError::Invalid("repeat must be greater than 0".into()));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("timeoutMs must be greater than 0".into()));
        }
        if self.listener_buffer == 0 {
            return Err(ConfigError::Invalid(
                "listenerBuffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = HarnessConfig::from_reader("".as_bytes()).expect("config");
        assert!(config.verify_ssl);
        assert_eq!(config.repeat, 1);
        assert_eq!(config.listener_buffer, 1024);
    }

    #[test]
    fn json_and_yaml_are_both_accepted() {
        let json = r#"{"host": "http://localhost:8080", "repeat": 3, "variables": {"token": "abc"}}"#;
        let config = HarnessConfig::from_reader(json.as_bytes()).expect("json config");
        assert_eq!(config.host, "http://localhost:8080");
        assert_eq!(config.repeat, 3);
        assert_eq!(config.variables["token"], serde_json::json!("abc"));

        let yaml = "host: http://api.local\nfailFast: true\nverifySsl: false\n";
        let config = HarnessConfig::from_reader(yaml.as_bytes()).expect("yaml config");
        assert_eq!(config.host, "http://api.local");
        assert!(config.fail_fast);
        assert!(!config.verify_ssl);
    }

    #[test]
    fn validate_rejects_zero_repeat_and_timeout() {
        let mut config = HarnessConfig::default();
        config.repeat = 0;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("suite.yaml");
        std::fs::write(&path, "host: http://file.local\nrepeat: 2\n").expect("write");
        let config = HarnessConfig::from_path(&path).expect("config");
        assert_eq!(config.host, "http://file.local");
        assert_eq!(config.repeat, 2);
    }
}
