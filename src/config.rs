use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::SearchMode;
use crate::error::MolidError;

pub const DEFAULT_CONFIG_FILE: &str = "molid.json";
const ENV_PREFIX: &str = "MOLID_";

/// On-disk configuration; every field is optional and falls back to defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_db: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_db: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_folder: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_folder: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub master_db: Utf8PathBuf,
    pub cache_db: Utf8PathBuf,
    pub mode: SearchMode,
    pub cache_enabled: bool,
    pub download_folder: Utf8PathBuf,
    pub processed_folder: Utf8PathBuf,
    pub max_files: Option<usize>,
}

impl ResolvedConfig {
    pub fn search_configuration(&self) -> SearchConfiguration {
        SearchConfiguration {
            mode: self.mode,
            master_db: self.master_db.clone(),
            cache_db: self.cache_db.clone(),
            cache_enabled: self.cache_enabled,
        }
    }
}

/// Immutable settings handed to the search engine for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfiguration {
    pub mode: SearchMode,
    pub master_db: Utf8PathBuf,
    pub cache_db: Utf8PathBuf,
    pub cache_enabled: bool,
}

/// `MOLID_*` variables captured once so resolution stays deterministic.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    values: HashMap<String, String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let values = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        Self { values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

struct DefaultDirs {
    data: Utf8PathBuf,
    cache: Utf8PathBuf,
}

impl DefaultDirs {
    fn resolve() -> Result<Self, MolidError> {
        if let Some(dirs) = ProjectDirs::from("", "", "molid") {
            let data = Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf())
                .map_err(|_| MolidError::Filesystem("non-utf8 data directory".to_string()))?;
            let cache = Utf8PathBuf::from_path_buf(dirs.cache_dir().to_path_buf())
                .map_err(|_| MolidError::Filesystem("non-utf8 cache directory".to_string()))?;
            return Ok(Self { data, cache });
        }
        let cwd = std::env::current_dir().map_err(|err| MolidError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".molid"))
            .map_err(|_| MolidError::Filesystem("invalid working directory".to_string()))?;
        Ok(Self {
            data: root.clone(),
            cache: root,
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn config_path(path: Option<&str>) -> Utf8PathBuf {
        match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    /// Reads the config file. A missing default file means "all defaults";
    /// a missing explicit file is an error.
    pub fn load(path: Option<&str>) -> Result<Config, MolidError> {
        let config_path = Self::config_path(path);
        if !config_path.as_std_path().exists() {
            if path.is_none() {
                return Ok(Config::default());
            }
            return Err(MolidError::ConfigRead(config_path.into_std_path_buf()));
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| MolidError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| MolidError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MolidError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, &EnvOverrides::from_env())
    }

    pub fn resolve_config(
        config: Config,
        env: &EnvOverrides,
    ) -> Result<ResolvedConfig, MolidError> {
        let dirs = DefaultDirs::resolve()?;

        let mode = match env.get("MODE") {
            Some(value) => value.parse()?,
            None => config.mode.unwrap_or(SearchMode::OnlineCached),
        };
        let cache_enabled = match env.get("CACHE_ENABLED") {
            Some(value) => parse_bool(value)?,
            None => config.cache_enabled.unwrap_or(true),
        };
        let max_files = match env.get("MAX_FILES") {
            Some(value) => Some(value.parse::<usize>().map_err(|_| {
                MolidError::ConfigParse(format!("MOLID_MAX_FILES is not a count: {value}"))
            })?),
            None => config.max_files,
        };

        Ok(ResolvedConfig {
            master_db: env
                .get("MASTER_DB")
                .map(Utf8PathBuf::from)
                .or(config.master_db)
                .unwrap_or_else(|| dirs.data.join("master").join("pubchem_master.db")),
            cache_db: env
                .get("CACHE_DB")
                .map(Utf8PathBuf::from)
                .or(config.cache_db)
                .unwrap_or_else(|| dirs.data.join("cache").join("pubchem_cache.db")),
            mode,
            cache_enabled,
            download_folder: env
                .get("DOWNLOAD_FOLDER")
                .map(Utf8PathBuf::from)
                .or(config.download_folder)
                .unwrap_or_else(|| dirs.cache.join("downloads")),
            processed_folder: env
                .get("PROCESSED_FOLDER")
                .map(Utf8PathBuf::from)
                .or(config.processed_folder)
                .unwrap_or_else(|| dirs.data.join("processed")),
            max_files,
        })
    }

    /// Persists the config through a temp file so a crash never leaves half a file.
    pub fn save(path: &Utf8Path, config: &Config) -> Result<(), MolidError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        }
        let content = serde_json::to_vec_pretty(config)
            .map_err(|err| MolidError::ConfigParse(err.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| MolidError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool, MolidError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MolidError::ConfigParse(format!(
            "MOLID_CACHE_ENABLED is not a boolean: {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let resolved =
            ConfigLoader::resolve_config(Config::default(), &EnvOverrides::default()).unwrap();
        assert_eq!(resolved.mode, SearchMode::OnlineCached);
        assert!(resolved.cache_enabled);
        assert!(resolved.master_db.ends_with("master/pubchem_master.db"));
        assert!(resolved.cache_db.ends_with("cache/pubchem_cache.db"));
        assert_eq!(resolved.max_files, None);
    }

    #[test]
    fn parse_bool_values() {
        assert!(parse_bool("Yes").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
