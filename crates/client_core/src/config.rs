use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::warn;

const SETTINGS_FILE: &str = "sync_engine.toml";
const ENV_PREFIX: &str = "SYNC_ENGINE__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long a remote typing indicator stays alive without a refresh.
    pub typing_timeout_ms: u64,
    /// Minimum spacing between outgoing typing signals for one channel.
    pub typing_send_interval_ms: u64,
    /// Number of correlation keys remembered for deduplication.
    pub dedup_window: usize,
    pub history_page_size: u32,
    pub request_timeout_ms: u64,
    pub request_attempts: u32,
    pub retry_delay_ms: u64,
    /// Fetch members and history as soon as a channel becomes joined.
    pub auto_sync_joined_channels: bool,
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            typing_timeout_ms: 5_000,
            typing_send_interval_ms: 3_000,
            dedup_window: 1_024,
            history_page_size: 50,
            request_timeout_ms: 10_000,
            request_attempts: 1,
            retry_delay_ms: 250,
            auto_sync_joined_channels: true,
            event_buffer: 1_024,
        }
    }
}

impl Settings {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn typing_send_interval(&self) -> Duration {
        Duration::from_millis(self.typing_send_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.request_attempts.max(1)
    }
}

pub fn load_settings() -> Settings {
    let mut settings = load_settings_from(Path::new(SETTINGS_FILE));
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> Settings {
    let Ok(raw) = fs::read_to_string(path) else {
        return Settings::default();
    };
    match toml::from_str::<Settings>(&raw) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}");
            Settings::default()
        }
    }
}

/// Applies `SYNC_ENGINE__<FIELD>` overrides. Values that fail to parse are skipped.
pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_ascii_uppercase()));

    override_parsed(&mut settings.typing_timeout_ms, var("typing_timeout_ms"));
    override_parsed(
        &mut settings.typing_send_interval_ms,
        var("typing_send_interval_ms"),
    );
    override_parsed(&mut settings.dedup_window, var("dedup_window"));
    override_parsed(&mut settings.history_page_size, var("history_page_size"));
    override_parsed(&mut settings.request_timeout_ms, var("request_timeout_ms"));
    override_parsed(&mut settings.request_attempts, var("request_attempts"));
    override_parsed(&mut settings.retry_delay_ms, var("retry_delay_ms"));
    override_parsed(
        &mut settings.auto_sync_joined_channels,
        var("auto_sync_joined_channels"),
    );
    override_parsed(&mut settings.event_buffer, var("event_buffer"));
}

fn override_parsed<T: FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(value) = raw.and_then(|raw| raw.trim().parse::<T>().ok()) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let settings: Settings =
            toml::from_str("typing_timeout_ms = 1500\nauto_sync_joined_channels = false\n")
                .expect("parse");
        assert_eq!(settings.typing_timeout_ms, 1_500);
        assert!(!settings.auto_sync_joined_channels);
        assert_eq!(settings.dedup_window, Settings::default().dedup_window);
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SYNC_ENGINE__HISTORY_PAGE_SIZE", "20"),
            ("SYNC_ENGINE__REQUEST_ATTEMPTS", "three"),
            ("SYNC_ENGINE__AUTO_SYNC_JOINED_CHANNELS", "false"),
        ]);
        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.history_page_size, 20);
        assert_eq!(settings.request_attempts, 1);
        assert!(!settings.auto_sync_joined_channels);
    }

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("sync_engine_test_{suffix}.toml"));

        assert_eq!(load_settings_from(&path), Settings::default());

        fs::write(&path, "dedup_window = \"lots\"").expect("write");
        assert_eq!(load_settings_from(&path), Settings::default());

        fs::write(&path, "dedup_window = 8").expect("write");
        assert_eq!(load_settings_from(&path).dedup_window, 8);

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let settings = Settings {
            request_attempts: 0,
            ..Settings::default()
        };
        assert_eq!(settings.attempts(), 1);
    }
}
