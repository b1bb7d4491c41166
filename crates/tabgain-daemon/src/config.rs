// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management: the controller snapshot and the per-domain
//! gain preference store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Domains untouched for this long are dropped by the maintenance pass.
pub const DOMAIN_RETENTION_DAYS: u64 = 30;

/// Domains shorter than this are rejected as preference keys.
pub const MIN_DOMAIN_LEN: usize = 3;

/// Escape markup-significant characters, trim surrounding whitespace, and cap
/// the result at 500 characters.
pub fn sanitize_string(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            '&' => escaped.push_str("&amp;"),
            _ => escaped.push(ch),
        }
    }
    escaped.trim().chars().take(500).collect()
}

/// Saved controller state for one tab, persisted across daemon restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedController {
    pub tab_id: u32,
    pub domain: String,
    pub original_muted: bool,
    pub current_gain: u32,
    #[serde(default)]
    pub is_muted: bool,
}

/// Whole-map snapshot of the controller table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    #[serde(default)]
    pub controllers: Vec<SavedController>,
}

/// A stored domain preference. Early releases persisted a bare gain integer;
/// those records are upgraded to the timestamped form before any other logic
/// reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredDomainPref {
    Stamped { gain: u32, last_accessed: u64 },
    Legacy(u32),
}

impl StoredDomainPref {
    /// Versioned-record upgrade step: legacy records get stamped with `now`.
    fn upgraded(&self, now: u64) -> (u32, u64) {
        match *self {
            StoredDomainPref::Stamped {
                gain,
                last_accessed,
            } => (gain, last_accessed),
            StoredDomainPref::Legacy(gain) => (gain, now),
        }
    }

    pub fn gain(&self) -> u32 {
        match *self {
            StoredDomainPref::Stamped { gain, .. } => gain,
            StoredDomainPref::Legacy(gain) => gain,
        }
    }
}

/// On-disk layout of `domains.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DomainStore {
    #[serde(default)]
    domains: BTreeMap<String, StoredDomainPref>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Configuration manager handles loading and saving config files.
pub struct ConfigManager {
    config_dir: PathBuf,
    retention: Duration,
}

impl ConfigManager {
    /// Create a new config manager rooted at the user config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("com", "tabgain", "tabgain")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;

        fs::create_dir_all(&config_dir)?;

        debug!("Config directory: {:?}", config_dir);
        Ok(Self {
            config_dir,
            retention: Duration::from_secs(DOMAIN_RETENTION_DAYS * 24 * 60 * 60),
        })
    }

    /// Create a config manager rooted at an explicit directory.
    #[allow(dead_code)]
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            retention: Duration::from_secs(DOMAIN_RETENTION_DAYS * 24 * 60 * 60),
        }
    }

    /// Override the domain retention window.
    #[allow(dead_code)]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Get the path to a config file.
    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }

    /// Load the persisted controller snapshot.
    pub fn load_controllers(&self) -> Result<ControllerSnapshot, ConfigError> {
        let path = self.config_path("controllers.toml");
        if !path.exists() {
            debug!("No controller snapshot found, starting empty");
            return Ok(ControllerSnapshot::default());
        }

        let content = fs::read_to_string(&path)?;
        let snapshot: ControllerSnapshot = toml::from_str(&content)?;
        info!(
            "Loaded {} saved controllers from {:?}",
            snapshot.controllers.len(),
            path
        );
        Ok(snapshot)
    }

    /// Overwrite the controller snapshot.
    pub fn save_controllers(&self, snapshot: &ControllerSnapshot) -> Result<(), ConfigError> {
        let path = self.config_path("controllers.toml");
        let content = toml::to_string_pretty(snapshot)?;
        fs::write(&path, content)?;
        debug!("Saved {} controllers to {:?}", snapshot.controllers.len(), path);
        Ok(())
    }

    fn load_domains(&self) -> Result<DomainStore, ConfigError> {
        let path = self.config_path("domains.toml");
        if !path.exists() {
            return Ok(DomainStore::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    fn save_domains(&self, store: &DomainStore) -> Result<(), ConfigError> {
        let path = self.config_path("domains.toml");
        let content = toml::to_string_pretty(store)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Look up the saved gain for a domain. Reads do not re-stamp the entry.
    pub fn load_domain_gain(&self, domain: &str) -> Result<Option<u32>, ConfigError> {
        let store = self.load_domains()?;
        Ok(store.domains.get(domain).map(StoredDomainPref::gain))
    }

    /// Save a domain preference, stamping it with the current time.
    pub fn save_domain_gain(&self, domain: &str, gain: u32) -> Result<(), ConfigError> {
        let mut store = self.load_domains()?;
        store.domains.insert(
            domain.to_string(),
            StoredDomainPref::Stamped {
                gain,
                last_accessed: now_millis(),
            },
        );
        self.save_domains(&store)
    }

    /// Maintenance pass: upgrade legacy records in place and drop entries
    /// unaccessed for longer than the retention window. Returns the number of
    /// removed entries.
    pub fn cleanup_stale_domains(&self) -> Result<usize, ConfigError> {
        let mut store = self.load_domains()?;
        let now = now_millis();
        let max_age = self.retention.as_millis() as u64;
        let before = store.domains.len();
        let mut changed = false;

        let entries = std::mem::take(&mut store.domains);
        store.domains = entries
            .into_iter()
            .filter_map(|(domain, pref)| {
                let (gain, last_accessed) = pref.upgraded(now);
                if now.saturating_sub(last_accessed) > max_age {
                    debug!("Dropping stale domain preference for {}", domain);
                    return None;
                }
                let stamped = StoredDomainPref::Stamped {
                    gain,
                    last_accessed,
                };
                if stamped != pref {
                    changed = true;
                }
                Some((domain, stamped))
            })
            .collect();

        let removed = before - store.domains.len();
        if removed > 0 || changed {
            self.save_domains(&store)?;
        }
        if removed > 0 {
            info!("Cleanup removed {} stale domain preferences", removed);
        }
        Ok(removed)
    }
}
