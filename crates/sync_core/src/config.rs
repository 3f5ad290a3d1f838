use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub server_url: String,
    pub api_url: Option<String>,
    pub business_phone: Option<String>,
    pub channel_origin: String,
    pub stability_delay_ms: u64,
    pub resync_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub broadcast_max_age_secs: u64,
    pub page_size: u32,
    pub max_seed_pages: u32,
    pub reconnect_delay_ms: u64,
    /// Emissions held while the transport is down; beyond it new ones fail.
    pub max_outbox: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            api_url: None,
            business_phone: None,
            channel_origin: "local".into(),
            stability_delay_ms: 1000,
            resync_window_ms: 2000,
            rate_limit_max_requests: 5,
            rate_limit_window_ms: 3000,
            broadcast_max_age_secs: 300,
            page_size: 50,
            max_seed_pages: 20,
            reconnect_delay_ms: 2000,
            max_outbox: 256,
        }
    }
}

impl SyncSettings {
    /// REST base; defaults to the push server URL.
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(&self.server_url)
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability_delay_ms)
    }

    pub fn resync_window(&self) -> Duration {
        Duration::from_millis(self.resync_window_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn broadcast_max_age(&self) -> Duration {
        Duration::from_secs(self.broadcast_max_age_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Unparseable numeric overrides keep the previous value.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<SyncSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config: ignoring invalid settings file"
                );
                SyncSettings::default()
            }
        },
        Err(_) => SyncSettings::default(),
    };

    let lookup = |names: &[&str]| names.iter().find_map(|name| env(*name));

    if let Some(v) = lookup(&["APP__SERVER_URL", "SYNC_SERVER_URL"]) {
        settings.server_url = v;
    }
    if let Some(v) = lookup(&["APP__API_URL", "SYNC_API_URL"]) {
        settings.api_url = Some(v);
    }
    if let Some(v) = lookup(&["APP__BUSINESS_PHONE", "SYNC_BUSINESS_PHONE"]) {
        settings.business_phone = Some(v);
    }
    if let Some(v) = lookup(&["APP__CHANNEL_ORIGIN", "SYNC_CHANNEL_ORIGIN"]) {
        settings.channel_origin = v;
    }

    override_number(&mut settings.stability_delay_ms, lookup(&["APP__STABILITY_DELAY_MS"]));
    override_number(&mut settings.resync_window_ms, lookup(&["APP__RESYNC_WINDOW_MS"]));
    override_number(
        &mut settings.rate_limit_max_requests,
        lookup(&["APP__RATE_LIMIT_MAX_REQUESTS"]),
    );
    override_number(&mut settings.rate_limit_window_ms, lookup(&["APP__RATE_LIMIT_WINDOW_MS"]));
    override_number(
        &mut settings.broadcast_max_age_secs,
        lookup(&["APP__BROADCAST_MAX_AGE_SECS"]),
    );
    override_number(&mut settings.page_size, lookup(&["APP__PAGE_SIZE"]));
    override_number(&mut settings.max_seed_pages, lookup(&["APP__MAX_SEED_PAGES"]));
    override_number(&mut settings.reconnect_delay_ms, lookup(&["APP__RECONNECT_DELAY_MS"]));
    override_number(&mut settings.max_outbox, lookup(&["APP__MAX_OUTBOX"]));

    settings
}

fn override_number<T: std::str::FromStr>(target: &mut T, raw: Option<String>) {
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *target = parsed;
    }
}
