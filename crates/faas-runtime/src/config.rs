//! Runtime configuration.
//!
//! Values come from three layers, highest precedence first: `SERVICE_*`
//! environment variables, the YAML service file, built-in defaults. Function
//! entries are gathered from the service file's inline `functions` list and
//! from every `*.yml`/`*.yaml` file in the code directory, in lexicographic
//! file-name order.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_NAME: &str = "faas-runtime";
pub const DEFAULT_CONF_PATH: &str = "/etc/faas/service.yml";
pub const DEFAULT_CODE_PATH: &str = "/var/lib/faas/code";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:80";
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const ENV_NAME: &str = "SERVICE_NAME";
pub const ENV_CONF: &str = "SERVICE_CONF";
pub const ENV_CODE: &str = "SERVICE_CODE";
pub const ENV_ADDRESS: &str = "SERVICE_ADDRESS";

/// Values taken from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub name: Option<String>,
    pub conf_path: Option<PathBuf>,
    pub code_path: Option<PathBuf>,
    pub address: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        }

        Self {
            name: var(ENV_NAME),
            conf_path: var(ENV_CONF).map(PathBuf::from),
            code_path: var(ENV_CODE).map(PathBuf::from),
            address: var(ENV_ADDRESS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub name: String,
    pub code_path: PathBuf,
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub functions: Vec<FunctionEntry>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            code_path: PathBuf::from(DEFAULT_CODE_PATH),
            server: ServerConfig::default(),
            logger: LoggerConfig::default(),
            functions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub message: MessageConfig,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Grace period for in-flight calls on shutdown. Unset means force-stop.
    #[serde(with = "duration")]
    pub timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            message: MessageConfig::default(),
            ca: None,
            cert: None,
            key: None,
            timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn max_message_size(&self) -> usize {
        self.message.length.max
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub length: LengthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthConfig {
    pub max: usize,
}

impl Default for LengthConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// One declared function. Missing fields deserialize as empty so the
/// registry can reject the entry with a message naming it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub handler: String,
    #[serde(default, alias = "codeDirectory")]
    pub codedir: String,
}

impl FunctionEntry {
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            codedir: String::new(),
        }
    }

    pub fn with_codedir(mut self, codedir: impl Into<String>) -> Self {
        self.codedir = codedir.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct FunctionsFile {
    functions: Option<Vec<FunctionEntry>>,
}

impl RuntimeConfig {
    /// Resolves the service file path, reads it if present and applies overrides.
    pub fn load(overrides: &EnvOverrides) -> Result<Self> {
        let conf_path = overrides
            .conf_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_PATH));

        let mut config = if conf_path.exists() {
            info!(path = %conf_path.display(), "Loading service config");
            Self::from_file(&conf_path)?
        } else {
            info!(path = %conf_path.display(), "Service config not found, using defaults");
            Self::default()
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply(&mut self, overrides: &EnvOverrides) {
        if let Some(name) = &overrides.name {
            self.name = name.clone();
        }
        if let Some(code_path) = &overrides.code_path {
            self.code_path = code_path.clone();
        }
        if let Some(address) = &overrides.address {
            self.server.address = address.clone();
        }
    }

    /// Inline entries followed by the entries of every function file in the code path.
    pub fn function_entries(&self) -> Result<Vec<FunctionEntry>> {
        let mut entries = self.functions.clone();
        entries.extend(load_function_files(&self.code_path)?);
        Ok(entries)
    }
}

/// Reads the function lists of all YAML files directly inside `dir`.
pub fn load_function_files(dir: &Path) -> Result<Vec<FunctionEntry>> {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "Code path is not a directory, no function files");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut entries = Vec::new();
    for path in files {
        let raw = std::fs::read_to_string(&path)?;
        let parsed: FunctionsFile = serde_yaml::from_str(&raw).map_err(|e| {
            RuntimeError::config(format!("{}: {}", path.display(), e))
        })?;
        let functions = parsed.functions.ok_or_else(|| {
            RuntimeError::config(format!("{}: missing functions", path.display()))
        })?;
        debug!(path = %path.display(), count = functions.len(), "Loaded function file");
        entries.extend(functions);
    }
    Ok(entries)
}

/// Durations as Go orchestrators write them (integer nanoseconds), or as a
/// string with a unit suffix (`500ms`, `30s`, `2m`).
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(d.as_nanos() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Nanos(n)) => Ok(Some(Duration::from_nanos(n))),
            Some(Raw::Text(text)) => parse(&text).map(Some).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {text:?}"))?;
        match unit {
            "" | "ns" => Ok(Duration::from_nanos(value)),
            "us" => Ok(Duration::from_micros(value)),
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => minutes_or_hours(value, 60, text),
            "h" => minutes_or_hours(value, 3600, text),
            _ => Err(format!("invalid duration unit in {text:?}")),
        }
    }

    fn minutes_or_hours(value: u64, secs_per_unit: u64, text: &str) -> Result<Duration, String> {
        value
            .checked_mul(secs_per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration: {text:?} is out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.name, DEFAULT_NAME);
        assert_eq!(config.server.address, DEFAULT_ADDRESS);
        assert_eq!(config.server.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.server.timeout.is_none());
        assert_eq!(config.logger.level, "info");
    }

    #[test]
    fn test_parse_full_file() {
        let raw = r#"
name: greeter
server:
  address: 127.0.0.1:50051
  timeout: 5000000000
  message:
    length:
      max: 1024
  ca: certs/ca.pem
  cert: certs/crt.pem
  key: certs/key.pem
logger:
  level: debug
functions:
  - name: greet
    handler: index.handler
    codedir: app
"#;
        let config = RuntimeConfig::from_yaml(raw).unwrap();
        assert_eq!(config.name, "greeter");
        assert_eq!(config.server.address, "127.0.0.1:50051");
        assert_eq!(config.server.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.server.max_message_size(), 1024);
        assert_eq!(config.server.ca, Some(PathBuf::from("certs/ca.pem")));
        assert_eq!(config.logger.level, "debug");
        assert_eq!(
            config.functions,
            vec![FunctionEntry::new("greet", "index.handler").with_codedir("app")]
        );
    }

    #[test]
    fn test_timeout_as_text() {
        let config = RuntimeConfig::from_yaml("server:\n  timeout: 250ms\n").unwrap();
        assert_eq!(config.server.timeout, Some(Duration::from_millis(250)));
        assert!(RuntimeConfig::from_yaml("server:\n  timeout: 3 days\n").is_err());
        assert_eq!(duration::parse("2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_timeout_out_of_range() {
        assert!(duration::parse("400000000000000000m").is_err());
        assert!(duration::parse("400000000000000000h").is_err());
        assert_eq!(duration::parse("3h").unwrap(), Duration::from_secs(3 * 3600));

        let err = RuntimeConfig::from_yaml("server:\n  timeout: 400000000000000000m\n").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_env_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("service.yml");
        fs::write(&conf, "name: from-file\nserver:\n  address: 0.0.0.0:9000\n").unwrap();

        let overrides = EnvOverrides {
            name: Some("from-env".to_string()),
            conf_path: Some(conf),
            code_path: Some(dir.path().to_path_buf()),
            address: None,
        };
        let config = RuntimeConfig::load(&overrides).unwrap();
        assert_eq!(config.name, "from-env");
        assert_eq!(config.server.address, "0.0.0.0:9000");
        assert_eq!(config.code_path, dir.path());
    }

    #[test]
    fn test_missing_conf_file_uses_defaults() {
        let overrides = EnvOverrides {
            conf_path: Some(PathBuf::from("/definitely/not/here.yml")),
            address: Some("127.0.0.1:7000".to_string()),
            ..Default::default()
        };
        let config = RuntimeConfig::load(&overrides).unwrap();
        assert_eq!(config.name, DEFAULT_NAME);
        assert_eq!(config.server.address, "127.0.0.1:7000");
    }

    #[test]
    fn test_function_files_merge_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.yml"),
            "functions:\n  - name: second\n    handler: b.handler\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.yaml"),
            "functions:\n  - name: first\n    handler: a.handler\n    codedir: a\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config = RuntimeConfig {
            code_path: dir.path().to_path_buf(),
            functions: vec![FunctionEntry::new("inline", "i.handler")],
            ..Default::default()
        };
        let names: Vec<_> = config
            .function_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["inline", "first", "second"]);
    }

    #[test]
    fn test_function_file_without_functions_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.yml"), "name: nothing\n").unwrap();
        let err = load_function_files(dir.path()).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("missing functions")));
    }
}
