use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub structure: StructureConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureConfig {
    /// Highest suffix tried by auto-unique property/group naming (`NAME_1` .. `NAME_n`)
    pub auto_unique_attempts: u32,
    /// First position of the sparse range used while renumbering siblings
    pub position_sparse_base: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Upper bound for generated instances per assignment in `Content::randomize`
    pub random_max_multiplicity: u32,
    /// Versions kept per cached content container
    pub max_cached_versions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            auto_unique_attempts: 200,
            position_sparse_base: 10000,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            random_max_multiplicity: 5,
            max_cached_versions: 16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional `content_repo` file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("content_repo")
    }

    /// Same as [`EngineConfig::load`] with an explicit config file base name
    pub fn load_from(file: &str) -> anyhow::Result<Self> {
        // Load environment variables from .env file if it exists
        dotenvy::dotenv().ok();

        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&EngineConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name(file).required(false));

        // Add environment variables with prefix "CONTENT_REPO__", e.g. CONTENT_REPO__LOGGING__LEVEL
        config = config.add_source(
            config::Environment::with_prefix("CONTENT_REPO")
                .separator("__")
                .prefix_separator("__"),
        );

        let config = config.build()?;
        let engine_config: EngineConfig = config.try_deserialize()?;

        Ok(engine_config)
    }

    /// Configured log level, falling back to `Info` for unknown names
    pub fn level_filter(&self) -> log::LevelFilter {
        self.logging
            .level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }

    /// Initialize `env_logger` with the configured level; a second call is a no-op
    pub fn init_logging(&self) {
        let _ = env_logger::Builder::new()
            .filter_level(self.level_filter())
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.structure.auto_unique_attempts, 200);
        assert_eq!(config.structure.position_sparse_base, 10000);
        assert_eq!(config.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[structure]").unwrap();
        writeln!(file, "auto_unique_attempts = 3").unwrap();
        writeln!(file, "position_sparse_base = 500").unwrap();
        writeln!(file, "[logging]").unwrap();
        writeln!(file, "level = \"debug\"").unwrap();

        let base = path.with_extension("");
        let config = EngineConfig::load_from(base.to_str().unwrap()).unwrap();
        assert_eq!(config.structure.auto_unique_attempts, 3);
        assert_eq!(config.structure.position_sparse_base, 500);
        assert_eq!(config.content, ContentConfig::default());
        assert_eq!(config.level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let mut config = EngineConfig::default();
        config.logging.level = "chatty".to_string();
        assert_eq!(config.level_filter(), log::LevelFilter::Info);
    }
}
