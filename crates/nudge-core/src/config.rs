//! Nudge configuration system.

use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{NudgeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Write config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }

    /// Secrets from the environment take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("NUDGE_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(token) = std::env::var("NUDGE_WHATSAPP_TOKEN") {
            self.channel
                .whatsapp
                .get_or_insert_with(WhatsAppSettings::default)
                .access_token = token;
        }
        if let Ok(token) = std::env::var("NUDGE_TELEGRAM_BOT_TOKEN") {
            self.channel
                .telegram
                .get_or_insert_with(TelegramSettings::default)
                .bot_token = token;
        }
        if let Ok(key) = std::env::var("NUDGE_LLM_API_KEY") {
            self.composer.llm.get_or_insert_with(LlmSettings::default).api_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.business_hours.validate()?;
        if self.campaign.max_attempts == 0 {
            return Err(NudgeError::Config("campaign.max_attempts must be >= 1".into()));
        }
        if self.campaign.maintenance_interval_days == 0 {
            return Err(NudgeError::Config(
                "campaign.maintenance_interval_days must be >= 1".into(),
            ));
        }
        if let Some(stages) = &self.campaign.stages {
            if stages.is_empty() {
                return Err(NudgeError::Config("campaign.stages must not be empty".into()));
            }
            let mut seen = std::collections::HashSet::new();
            for entry in stages {
                if !seen.insert(entry.stage) {
                    return Err(NudgeError::Config(format!(
                        "campaign.stages lists stage {} twice",
                        entry.stage
                    )));
                }
            }
        }
        if self.dispatcher.worker_count == 0 {
            return Err(NudgeError::Config("dispatcher.worker_count must be >= 1".into()));
        }
        let outbound_budget = self.dispatcher.outbound_budget();
        if std::time::Duration::from_secs(self.dispatcher.lock_ttl_secs) <= outbound_budget {
            return Err(NudgeError::Config(format!(
                "dispatcher.lock_ttl_secs must exceed compose + send timeouts and backoff across retries ({:.1}s)",
                outbound_budget.as_secs_f64()
            )));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on another connection's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.nudge/nudge.db".into() }
fn default_busy_timeout_ms() -> u64 { 5_000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Weekday/hour window in which follow-ups may be sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    /// IANA timezone id; every local-hour decision happens in this zone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    /// Exclusive.
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<String>,
}

fn default_timezone() -> String { "UTC".into() }
fn default_start_hour() -> u32 { 9 }
fn default_end_hour() -> u32 { 21 }
fn default_weekdays() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri", "sat"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            weekdays: default_weekdays(),
        }
    }
}

impl BusinessHoursConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            NudgeError::Config(format!(
                "invalid timezone '{}'; expected IANA timezone id",
                self.timezone
            ))
        })
    }

    pub fn allowed_weekdays(&self) -> Result<Vec<Weekday>> {
        self.weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| NudgeError::Config(format!("invalid weekday '{d}'")))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.allowed_weekdays()?.is_empty() {
            return Err(NudgeError::Config("business_hours.weekdays must not be empty".into()));
        }
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(NudgeError::Config(format!(
                "business_hours window [{}, {}) is empty or out of range",
                self.start_hour, self.end_hour
            )));
        }
        Ok(())
    }
}

/// Built-in stage tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePreset {
    /// 8 stages: 1h, 6h, 24h, 48h, 72h, 5d, 7d, 14d.
    Standard,
    /// 14 decaying stages for long sales cycles.
    Extended,
}

/// Explicit stage table entry. `delay_secs` is measured from the previous send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_preset")]
    pub preset: StagePreset,
    /// Overrides `preset` when set.
    #[serde(default)]
    pub stages: Option<Vec<StageEntry>>,
    /// Numbered stages beyond this count fold into maintenance.
    #[serde(default)]
    pub max_stages: Option<u32>,
    /// Minimum gap between two follow-ups to the same user.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_maintenance_interval_days")]
    pub maintenance_interval_days: u32,
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Silence required before a user becomes a campaign candidate.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    /// Terminal jobs older than this are swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_preset() -> StagePreset { StagePreset::Standard }
fn default_cooldown_secs() -> u64 { 3_600 }
fn default_maintenance_interval_days() -> u32 { 14 }
fn default_daily_cap() -> u32 { 2 }
fn default_max_attempts() -> u32 { 3 }
fn default_inactivity_threshold_secs() -> u64 { 3_600 }
fn default_retention_days() -> u32 { 30 }

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            stages: None,
            max_stages: None,
            cooldown_secs: default_cooldown_secs(),
            maintenance_interval_days: default_maintenance_interval_days(),
            daily_cap: default_daily_cap(),
            max_attempts: default_max_attempts(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Due jobs processed concurrently per tick.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Overall budget for one tick.
    #[serde(default = "default_tick_deadline_secs")]
    pub tick_deadline_secs: u64,
    #[serde(default = "default_dispatch_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_compose_timeout_secs")]
    pub compose_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// In-call retries for a timed-out or failed outbound call.
    #[serde(default = "default_outbound_retries")]
    pub outbound_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Backoff used when the transport reports throttling.
    #[serde(default = "default_throttle_backoff_secs")]
    pub throttle_backoff_secs: u64,
}

fn default_tick_secs() -> u64 { 30 }
fn default_batch_size() -> usize { 100 }
fn default_worker_count() -> usize { 8 }
fn default_tick_deadline_secs() -> u64 { 120 }
fn default_dispatch_lock_ttl_secs() -> u64 { 90 }
fn default_compose_timeout_secs() -> u64 { 20 }
fn default_send_timeout_secs() -> u64 { 15 }
fn default_outbound_retries() -> u32 { 1 }
fn default_backoff_base_secs() -> u64 { 300 }
fn default_backoff_cap_secs() -> u64 { 6 * 3_600 }
fn default_throttle_backoff_secs() -> u64 { 900 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            worker_count: default_worker_count(),
            tick_deadline_secs: default_tick_deadline_secs(),
            lock_ttl_secs: default_dispatch_lock_ttl_secs(),
            compose_timeout_secs: default_compose_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            outbound_retries: default_outbound_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            throttle_backoff_secs: default_throttle_backoff_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Worst-case time one job spends in outbound calls: every compose and
    /// send attempt timing out, plus the in-call backoff between attempts.
    pub fn outbound_budget(&self) -> std::time::Duration {
        let attempts = self.outbound_retries + 1;
        let timeouts = std::time::Duration::from_secs(self.compose_timeout_secs + self.send_timeout_secs) * attempts;
        let backoff: std::time::Duration = (0..self.outbound_retries).map(outbound_backoff).sum();
        timeouts + backoff * 2
    }
}

/// In-call backoff between outbound retries: 200ms, 400ms, 800ms...
pub fn outbound_backoff(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(200u64.saturating_mul(1 << attempt.min(6)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_detector_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: usize,
}

fn default_scan_interval_secs() -> u64 { 300 }
fn default_detector_lock_ttl_secs() -> u64 { 30 }
fn default_scan_batch_size() -> usize { 500 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            lock_ttl_secs: default_detector_lock_ttl_secs(),
            batch_size: default_scan_batch_size(),
        }
    }
}

/// Transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// "console", "whatsapp", "telegram" or "webhook".
    #[serde(default = "default_channel_kind")]
    pub kind: String,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppSettings>,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

fn default_channel_kind() -> String { "console".into() }

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: default_channel_kind(),
            whatsapp: None,
            telegram: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppSettings {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,
}

fn default_graph_api_base() -> String { "https://graph.facebook.com/v21.0".into() }

impl Default for WhatsAppSettings {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            api_base: default_graph_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String { "https://api.telegram.org".into() }

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_telegram_api_base(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Message text generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// "template" or "llm". An LLM composer always falls back to templates.
    #[serde(default = "default_composer_kind")]
    pub kind: String,
    /// Stage key ("0", "1", ..., "maintenance") to template text.
    /// Placeholders: `{name}`, `{last_message}`, `{product}`.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
}

fn default_composer_kind() -> String { "template".into() }

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            kind: default_composer_kind(),
            templates: BTreeMap::new(),
            llm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_llm_endpoint() -> String { "https://api.openai.com/v1".into() }
fn default_llm_model() -> String { "gpt-4o-mini".into() }
fn default_llm_temperature() -> f32 { 0.7 }
fn default_llm_max_tokens() -> u32 { 200 }

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            api_key: String::new(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            system_prompt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_valid() {
        let config = NudgeConfig::from_toml("").unwrap();
        assert_eq!(config.business_hours.start_hour, 9);
        assert_eq!(config.business_hours.end_hour, 21);
        assert_eq!(config.campaign.preset, StagePreset::Standard);
        assert_eq!(config.channel.kind, "console");
    }

    #[test]
    fn test_parse_sections() {
        let config = NudgeConfig::from_toml(
            r#"
            [business_hours]
            timezone = "Asia/Ho_Chi_Minh"
            start_hour = 8
            end_hour = 20
            weekdays = ["mon", "tue", "wed", "thu", "fri"]

            [campaign]
            preset = "extended"
            daily_cap = 1
            stages = [{ stage = 0, delay_secs = 3600 }, { stage = 5, delay_secs = 7200 }]
            "#,
        )
        .unwrap();
        assert_eq!(config.business_hours.tz().unwrap(), chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(config.business_hours.allowed_weekdays().unwrap().len(), 5);
        assert_eq!(config.campaign.stages.as_ref().unwrap()[1].stage, 5);
        assert_eq!(config.campaign.daily_cap, 1);
    }

    #[test]
    fn test_rejects_bad_timezone_and_window() {
        assert!(NudgeConfig::from_toml("[business_hours]\ntimezone = \"Mars/Base\"").is_err());
        assert!(NudgeConfig::from_toml("[business_hours]\nstart_hour = 21\nend_hour = 9").is_err());
        assert!(NudgeConfig::from_toml("[business_hours]\nweekdays = [\"funday\"]").is_err());
    }

    #[test]
    fn test_rejects_duplicate_stage() {
        let err = NudgeConfig::from_toml(
            "[campaign]\nstages = [{ stage = 1, delay_secs = 1 }, { stage = 1, delay_secs = 2 }]",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_lock_ttl_must_cover_outbound_retries() {
        // (20 + 15) * 3 = 105s of outbound time against a 90s lock.
        assert!(NudgeConfig::from_toml("[dispatcher]\noutbound_retries = 2").is_err());
        assert!(NudgeConfig::from_toml("[dispatcher]\noutbound_retries = 2\nlock_ttl_secs = 120").is_ok());
    }

    #[test]
    fn test_lock_ttl_covers_in_call_backoff() {
        let tight = "[dispatcher]\ncompose_timeout_secs = 10\nsend_timeout_secs = 10\noutbound_retries = 3\n";
        // 4 * 20s of timeouts plus 2 * (0.2 + 0.4 + 0.8)s of backoff = 82.8s.
        let budget = NudgeConfig::from_toml(&format!("{tight}lock_ttl_secs = 83"))
            .unwrap()
            .dispatcher
            .outbound_budget();
        assert_eq!(budget, std::time::Duration::from_millis(82_800));
        assert!(NudgeConfig::from_toml(&format!("{tight}lock_ttl_secs = 81")).is_err());
    }

    #[test]
    fn test_database_path_expands_home() {
        let mut config = NudgeConfig::default();
        config.database.path = "/var/lib/nudge/nudge.db".into();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/nudge/nudge.db"));

        config.database.path = "~/.nudge/nudge.db".into();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.database_path(), home.join(".nudge/nudge.db"));
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("nudge-config-test");
        let path = dir.join("config.toml");
        let mut config = NudgeConfig::default();
        config.campaign.daily_cap = 5;
        config.save_to(&path).unwrap();
        let loaded = NudgeConfig::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.campaign.daily_cap, 5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
