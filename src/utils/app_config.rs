use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use config::Environment;

use super::error::Result;
use super::logging::prelude::*;

/// Base name of the configuration file, without extension
pub const CONFIG_NAME: &str = "config";
/// Prefix of environment variables overlaying the configuration
pub const ENV_PREFIX: &str = "CMDKIT";

const EXTENSIONS: [&str; 3] = ["toml", "yaml", "yml"];

/// The main structure holding application config
#[derive(Debug, Clone)]
pub struct AppConfig {
    inner: config::Config,
    source: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfig {
    pub fn new() -> Self {
        // Start with empty
        Self {
            inner: config::Config::new(),
            source: None,
        }
    }

    /// Directories searched for a config file, in priority order: `.` then `$HOME`
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".")];
        if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
            paths.push(PathBuf::from(home));
        }
        paths
    }

    /// Best-effort discovery: the first config file in `dirs`, then `CMDKIT_*` variables.
    ///
    /// An unreadable file or environment is reported and skipped.
    pub fn discover<P: AsRef<Path>>(dirs: &[P]) -> Self {
        let mut config = Self::new();

        if let Some(path) = Self::find_file(dirs) {
            match config.use_file(&path) {
                Ok(_) => debug!(path = %path.display(), "Using config file"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Ignoring config file");
                    config = Self::new();
                }
            }
        }

        let mut with_env = config.clone();
        match with_env.use_env() {
            Ok(_) => with_env,
            Err(err) => {
                warn!(error = %err, "Ignoring {}_* environment", ENV_PREFIX);
                config
            }
        }
    }

    /// First `config.<ext>` found in `dirs`
    pub fn find_file<P: AsRef<Path>>(dirs: &[P]) -> Option<PathBuf> {
        dirs.iter()
            .flat_map(|dir| {
                EXTENSIONS
                    .iter()
                    .map(move |ext| dir.as_ref().join(format!("{}.{}", CONFIG_NAME, ext)))
            })
            .find(|candidate| candidate.is_file())
    }

    /// Load config from a file
    pub fn use_file(&mut self, path: &Path) -> Result<&mut Self> {
        self.inner.merge(config::File::from(path))?;
        self.source = Some(path.to_owned());
        Ok(self)
    }

    /// Merge settings with env variables
    pub fn use_env(&mut self) -> Result<&mut Self> {
        self.inner
            .merge(Environment::with_prefix(ENV_PREFIX).separator("__"))?;
        Ok(self)
    }

    /// The file the configuration was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Get a single value and deserialize to the given type
    pub fn get<T, K>(&self, key: K) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        K: AsRef<str>,
    {
        Ok(self.inner.get(key.as_ref())?)
    }

    /// Deserialize the whole configuration into the given type
    pub fn fetch<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let t = self.inner.clone().try_into()?;
        Ok(t)
    }

    /// Every top-level key, sorted
    pub fn values(&self) -> Result<BTreeMap<String, serde_yaml::Value>> {
        self.fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn find_file_prefers_earlier_dirs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write(second.path(), "config.toml", "debug = true\n");
        let expected = write(first.path(), "config.yaml", "debug: false\n");

        let found = AppConfig::find_file(&[first.path(), second.path()]);
        assert_eq!(found, Some(expected));
    }

    #[test]
    fn find_file_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "other.toml", "a = 1\n");
        assert_eq!(AppConfig::find_file(&[dir.path()]), None);
    }

    #[test]
    fn fetch_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.toml",
            "debug = false\n[database]\nurl = \"custom database url\"\n",
        );

        let mut config = AppConfig::new();
        config.use_file(&path).unwrap();
        assert_eq!(config.source(), Some(path.as_path()));

        #[derive(Deserialize)]
        struct Database {
            url: String,
        }
        #[derive(Deserialize)]
        struct Fragment {
            debug: bool,
            database: Database,
        }

        let frag: Fragment = config.fetch().unwrap();
        assert!(!frag.debug);
        assert_eq!(frag.database.url, "custom database url");

        let url: String = config.get("database.url").unwrap();
        assert_eq!(url, "custom database url");
        assert!(config.values().unwrap().contains_key("database"));
    }

    #[test]
    fn discover_skips_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.toml", "this is = = not toml");

        let config = AppConfig::discover(&[dir.path()]);
        assert_eq!(config.source(), None);
        assert!(config.get::<String, _>("database.url").is_err());
    }

    #[test]
    fn discover_reads_first_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.yml", "greeting: hello\n");

        let config = AppConfig::discover(&[dir.path()]);
        assert_eq!(config.source(), Some(path.as_path()));
        assert_eq!(config.get::<String, _>("greeting").unwrap(), "hello");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "config.toml", "this is = = not toml");

        let mut config = AppConfig::new();
        assert!(config.use_file(&path).is_err());
        assert_eq!(config.source(), None);
    }
}
