use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// A single typed value inside a brick or event configuration mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Text(String),
    Number(i64),
    Flag(bool),
}

impl ConfigValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ConfigValue::Flag(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Text(value) => write!(f, "{value}"),
            ConfigValue::Number(value) => write!(f, "{value}"),
            ConfigValue::Flag(value) => write!(f, "{}", if *value { "*" } else { "" }),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Number(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Flag(value)
    }
}

/// Ordered key/value mapping carried by every brick.
#[derive(Debug, Clone, Default)]
pub struct BrickConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl BrickConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn set<V: Into<ConfigValue>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ConfigValue::as_text)
    }

    pub fn number(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ConfigValue::as_number)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(ConfigValue::as_flag).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Host-wide settings loaded from `brickyard.toml`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub file_path: Option<PathBuf>,
    /// Directory holding the VDE tool set, if not discovered via PATH.
    pub vdepath: Option<PathBuf>,
    /// Directory holding the QEMU binaries, if not discovered via PATH.
    pub qemupath: Option<PathBuf>,
    /// Elevation helper used when toggling host pseudo-files.
    pub sudo: Option<String>,
    /// Whether kernel same-page merging should be enabled for QEMU bricks.
    pub ksm: bool,
    /// When true, an unresolved binary name is returned verbatim so the OS
    /// loader reports the real error at spawn time.
    pub fallback_to_name: bool,
    /// Directory receiving control sockets, pidfiles, and logs.
    pub workspace: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    vdepath: Option<String>,
    qemupath: Option<String>,
    sudo: Option<String>,
    ksm: Option<bool>,
    fallback_to_name: Option<bool>,
    workspace: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_path: None,
            vdepath: None,
            qemupath: None,
            sudo: None,
            ksm: false,
            fallback_to_name: true,
            workspace: default_workspace(),
            warnings: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawSettings =
            toml::from_str(&contents).map_err(|source| Error::ParseConfig {
                path: path.to_path_buf(),
                source,
            })?;

        let mut settings = Settings {
            file_path: Some(path.to_path_buf()),
            ..Settings::default()
        };

        if let Some(dir) = raw.vdepath {
            settings.apply_tool_dir(dir, "vdepath", |s, p| s.vdepath = Some(p));
        }
        if let Some(dir) = raw.qemupath {
            settings.apply_tool_dir(dir, "qemupath", |s, p| s.qemupath = Some(p));
        }
        settings.sudo = raw.sudo.filter(|helper| !helper.trim().is_empty());
        if let Some(ksm) = raw.ksm {
            settings.ksm = ksm;
        }
        if let Some(fallback) = raw.fallback_to_name {
            settings.fallback_to_name = fallback;
        }
        if let Some(workspace) = raw.workspace {
            settings.workspace = PathBuf::from(workspace);
        }

        Ok(settings)
    }

    fn apply_tool_dir<F>(&mut self, dir: String, key: &str, assign: F)
    where
        F: FnOnce(&mut Self, PathBuf),
    {
        let path = PathBuf::from(&dir);
        if dir.trim().is_empty() {
            return;
        }
        if !path.is_dir() {
            self.warnings.push(format!(
                "`{key}` points at {} which is not a directory; falling back to PATH lookup.",
                path.display()
            ));
            return;
        }
        assign(self, path);
    }
}

fn default_workspace() -> PathBuf {
    user_home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".brickyard")
}

pub fn user_home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn defaults_enable_name_fallback() {
        let settings = Settings::default();
        assert!(settings.fallback_to_name);
        assert!(!settings.ksm);
        assert!(settings.vdepath.is_none());
    }

    #[test]
    fn load_accepts_partial_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brickyard.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "ksm = true").unwrap();
        writeln!(file, "sudo = \"sudo\"").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(settings.ksm);
        assert_eq!(settings.sudo.as_deref(), Some("sudo"));
        assert!(settings.fallback_to_name);
        assert!(settings.warnings.is_empty());
    }

    #[test]
    fn load_warns_on_missing_tool_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brickyard.toml");
        fs::write(&path, "vdepath = \"/nonexistent/vde\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(settings.vdepath.is_none());
        assert_eq!(settings.warnings.len(), 1);
        assert!(settings.warnings[0].contains("vdepath"));
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brickyard.toml");
        fs::write(&path, "ksm = maybe\n").unwrap();

        match Settings::load(&path) {
            Err(Error::ParseConfig { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn config_values_expose_typed_accessors() {
        let mut config = BrickConfig::new();
        config.set("sock", "/tmp/switch.ctl");
        config.set("ports", 32i64);
        config.set("hub", true);

        assert_eq!(config.text("sock"), Some("/tmp/switch.ctl"));
        assert_eq!(config.number("ports"), Some(32));
        assert!(config.flag("hub"));
        assert!(!config.flag("missing"));
    }
}
