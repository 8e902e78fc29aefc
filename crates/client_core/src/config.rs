use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tracing::warn;

use crate::retry::RetryPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub relay_url: String,
    pub database_url: String,
    pub dedup_window_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub storage_retry_attempts: u32,
    pub search_timeout_ms: u64,
    pub resend_pending_on_reconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:3000/ws".into(),
            database_url: "sqlite://./data/messages.db".into(),
            dedup_window_ms: 3_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 10,
            storage_retry_attempts: 3,
            search_timeout_ms: 5_000,
            resend_pending_on_reconnect: true,
        }
    }
}

impl Settings {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_max_attempts,
        )
    }

    pub fn storage_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(50, 1_000, self.storage_retry_attempts)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    /// Applies one `key = value` override. Unknown keys and unparsable values
    /// are logged and ignored.
    fn apply(&mut self, key: &str, raw: &str) {
        let applied = match key {
            "relay_url" => {
                self.relay_url = raw.to_string();
                true
            }
            "database_url" => {
                self.database_url = raw.to_string();
                true
            }
            "dedup_window_ms" => parse_into(raw, &mut self.dedup_window_ms),
            "reconnect_base_delay_ms" => parse_into(raw, &mut self.reconnect_base_delay_ms),
            "reconnect_max_delay_ms" => parse_into(raw, &mut self.reconnect_max_delay_ms),
            "reconnect_max_attempts" => parse_into(raw, &mut self.reconnect_max_attempts),
            "storage_retry_attempts" => parse_into(raw, &mut self.storage_retry_attempts),
            "search_timeout_ms" => parse_into(raw, &mut self.search_timeout_ms),
            "resend_pending_on_reconnect" => parse_into(raw, &mut self.resend_pending_on_reconnect),
            _ => {
                warn!(key, "config: unknown setting ignored");
                return;
            }
        };
        if !applied {
            warn!(key, value = raw, "config: invalid value ignored");
        }
    }
}

const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("RELAY_URL", "relay_url"),
    ("APP__RELAY_URL", "relay_url"),
    ("DATABASE_URL", "database_url"),
    ("APP__DATABASE_URL", "database_url"),
    ("APP__DEDUP_WINDOW_MS", "dedup_window_ms"),
    ("APP__RECONNECT_BASE_DELAY_MS", "reconnect_base_delay_ms"),
    ("APP__RECONNECT_MAX_DELAY_MS", "reconnect_max_delay_ms"),
    ("APP__RECONNECT_MAX_ATTEMPTS", "reconnect_max_attempts"),
    ("APP__STORAGE_RETRY_ATTEMPTS", "storage_retry_attempts"),
    ("APP__SEARCH_TIMEOUT_MS", "search_timeout_ms"),
    ("APP__RESEND_PENDING_ON_RECONNECT", "resend_pending_on_reconnect"),
];

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |name| std::env::var(name).ok())
}

/// Defaults, then `path` if it exists, then environment overrides. `APP__*`
/// variables win over their bare counterparts.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    settings.apply(key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    for &(variable, key) in ENV_OVERRIDES {
        if let Some(value) = env(variable) {
            settings.apply(key, &value);
        }
    }

    settings
}

fn parse_into<T: std::str::FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.trim().parse::<T>() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => false,
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url).and_then(|path| path.parent().map(Path::to_path_buf))
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
