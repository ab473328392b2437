//! Settings, layered from defaults, an optional `registrar.{toml,json,yaml}`
//! file and `REGISTRAR__SECTION__KEY` environment variables.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::construct::PersistenceMode;
use crate::datatype::Rendering;
use crate::error::{RegistrarError, Result};

pub const CONFIG_FILE_VARIABLE: &str = "REGISTRAR_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "registrar";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Owner recorded on registries when the caller does not say who they are.
    pub default_owner: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: String::from("127.0.0.1:8080"),
            default_owner: String::from("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub mode: StorageMode,
    pub path: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            mode: StorageMode::File,
            path: String::from("registrar.db"),
        }
    }
}

impl PersistenceSettings {
    pub fn mode(&self) -> PersistenceMode {
        match self.mode {
            StorageMode::Memory => PersistenceMode::InMemory,
            StorageMode::File => PersistenceMode::File(self.path.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: String::from("registrar=info,tower_http=info"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub persistence: PersistenceSettings,
    pub rendering: Rendering,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reads the settings file named by `REGISTRAR_CONFIG` (or `registrar`
    /// in the working directory, if present) and the environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_VARIABLE).ok();
        let required = file.is_some();
        let file = file.unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        Self::from_sources(Config::builder().add_source(File::with_name(&file).required(required)))
    }
    /// Settings from a configuration string in the given format, still
    /// overridable from the environment.
    pub fn from_text(text: &str, format: config::FileFormat) -> Result<Self> {
        Self::from_sources(Config::builder().add_source(File::from_str(text, format)))
    }
    fn from_sources(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings: Settings = builder
            .add_source(Environment::with_prefix("REGISTRAR").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.rendering.check().map_err(RegistrarError::Config)?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::CheckboxStyle;
    use config::FileFormat;

    #[test]
    fn defaults_fill_in_missing_sections() {
        let settings = Settings::from_text("", FileFormat::Toml).unwrap();
        assert_eq!(settings.server.bind, "127.0.0.1:8080");
        assert_eq!(settings.persistence.mode(), PersistenceMode::File("registrar.db".into()));
        assert_eq!(settings.rendering, Rendering::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let text = r#"
            [server]
            default_owner = "admin"

            [persistence]
            mode = "memory"

            [rendering]
            date_format = "%Y-%m-%d"
            checkbox = "words"
        "#;
        let settings = Settings::from_text(text, FileFormat::Toml).unwrap();
        assert_eq!(settings.server.default_owner, "admin");
        assert_eq!(settings.persistence.mode(), PersistenceMode::InMemory);
        assert_eq!(settings.rendering.date_format, "%Y-%m-%d");
        assert_eq!(settings.rendering.checkbox, CheckboxStyle::Words);
    }

    #[test]
    fn broken_date_formats_are_refused() {
        let text = "[rendering]\ndate_format = \"%Q\"\n";
        let err = Settings::from_text(text, FileFormat::Toml).unwrap_err();
        assert!(matches!(err, RegistrarError::Config(_)));
    }
}
