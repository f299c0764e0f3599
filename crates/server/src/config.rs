use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use session_auth::TokenConfig;
use tracing::warn;

pub const DEFAULT_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub handshake_timeout_ms: u64,
    pub typing_timeout_ms: u64,
    pub typing_sweep_interval_ms: u64,
    pub ping_interval_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            jwt_secret: DEFAULT_JWT_SECRET.into(),
            access_token_ttl_seconds: 15 * 60,
            refresh_token_ttl_seconds: 30 * 24 * 60 * 60,
            handshake_timeout_ms: 5_000,
            typing_timeout_ms: 3_000,
            typing_sweep_interval_ms: 500,
            ping_interval_seconds: 20,
            idle_timeout_seconds: 60,
        }
    }
}

/// Timeouts applied to each websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Settings {
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.jwt_secret.clone(),
            access_ttl_seconds: self.access_token_ttl_seconds,
            refresh_ttl_seconds: self.refresh_token_ttl_seconds,
        }
    }

    pub fn transport(&self) -> TransportSettings {
        TransportSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            ping_interval: Duration::from_secs(self.ping_interval_seconds.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_seconds.max(1)),
        }
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms.max(10))
    }
}

/// Defaults, then `server.toml`, then environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file(settings: &mut Settings, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable server.toml");
            return;
        }
    };
    let lookup = |key: &str| {
        table.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };
    apply(settings, lookup, "");
}

pub(crate) fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    apply(settings, lookup, "APP__");
}

fn apply(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>, prefix: &str) {
    let key = |name: &str| {
        if prefix.is_empty() {
            name.to_ascii_lowercase()
        } else {
            format!("{prefix}{name}")
        }
    };

    if let Some(v) = lookup(&key("BIND_ADDR")) {
        settings.bind_addr = v;
    }
    if let Some(v) = lookup(&key("DATABASE_URL")) {
        settings.database_url = v;
    }
    if let Some(v) = lookup(&key("JWT_SECRET")) {
        settings.jwt_secret = v;
    }
    set_number(&mut settings.access_token_ttl_seconds, &key("ACCESS_TOKEN_TTL_SECONDS"), &lookup);
    set_number(&mut settings.refresh_token_ttl_seconds, &key("REFRESH_TOKEN_TTL_SECONDS"), &lookup);
    set_number(&mut settings.handshake_timeout_ms, &key("HANDSHAKE_TIMEOUT_MS"), &lookup);
    set_number(&mut settings.typing_timeout_ms, &key("TYPING_TIMEOUT_MS"), &lookup);
    set_number(&mut settings.typing_sweep_interval_ms, &key("TYPING_SWEEP_INTERVAL_MS"), &lookup);
    set_number(&mut settings.ping_interval_seconds, &key("PING_INTERVAL_SECONDS"), &lookup);
    set_number(&mut settings.idle_timeout_seconds, &key("IDLE_TIMEOUT_SECONDS"), &lookup);
}

fn set_number<T: std::str::FromStr>(
    target: &mut T,
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(%key, value = %raw, "ignoring non-numeric setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub(crate) fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
