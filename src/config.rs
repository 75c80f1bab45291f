use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::{StoreNames, WorkerSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the app is served from; app shell paths resolve against it
  pub origin: Url,
  /// Version token embedded in store names. Bump it to evict old stores.
  pub version: String,
  #[serde(default = "default_static_prefix")]
  pub static_prefix: String,
  #[serde(default = "default_data_prefix")]
  pub data_prefix: String,
  /// Root-relative paths making up the app shell
  #[serde(default)]
  pub app_shell: Vec<String>,
  /// CDN resources served cache-first (matched by origin prefix)
  #[serde(default)]
  pub third_party: Vec<Url>,
  /// Path suffixes treated as dynamic data
  #[serde(default = "default_data_suffixes")]
  pub data_suffixes: Vec<String>,
  /// HTTP client timeout in seconds
  pub timeout_secs: Option<u64>,
}

fn default_static_prefix() -> String {
  "shellcache-static".to_string()
}

fn default_data_prefix() -> String {
  "shellcache-data".to_string()
}

fn default_data_suffixes() -> Vec<String> {
  vec![".json".to_string()]
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// `SHELLCACHE_VERSION` overrides the version token.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/shellcache/config.yaml\n\
                 See shellcache.example.yaml for the format."
        ))
      }
    };

    if let Ok(version) = std::env::var("SHELLCACHE_VERSION") {
      config.version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Config field 'version' must not be empty"));
    }
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("Config field 'origin' must be an http(s) URL"));
    }
    let names = self.store_names();
    if names.static_store == names.data_store {
      return Err(eyre!(
        "Static and data stores share the name '{}'",
        names.static_store
      ));
    }
    Ok(())
  }

  pub fn store_names(&self) -> StoreNames {
    StoreNames::versioned(&self.static_prefix, &self.data_prefix, self.version.trim())
  }

  /// App shell paths resolved against the origin.
  pub fn app_shell_urls(&self) -> Result<Vec<Url>> {
    self
      .app_shell
      .iter()
      .map(|path| {
        self
          .origin
          .join(path)
          .map_err(|e| eyre!("Invalid app shell path '{}': {}", path, e))
      })
      .collect()
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }

  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    Ok(WorkerSettings {
      names: self.store_names(),
      app_shell: self.app_shell_urls()?,
      third_party: self.third_party.clone(),
      data_suffixes: self.data_suffixes.clone(),
    })
  }
}
