//! # Configuration
//!
//! Everything comes from the environment (plus `.env` in development).
//! Out-of-range or malformed values fail startup with a precise message;
//! only the documented defaults are applied silently.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{FixedOffset, NaiveTime};
use regex::Regex;

pub const DEFAULT_GATE_NAME: &str = "mbbank";
pub const DEFAULT_APP_NAME: &str = "payment-gateway";
pub const DEFAULT_REPEAT_SEC: u64 = 30;
pub const DEFAULT_DAY_LIMIT: u32 = 14;
pub const DEFAULT_TZ_OFFSET_HOURS: i32 = 7;
pub const DEFAULT_DAILY_SYNC_AT: &str = "19:00";
pub const DEFAULT_API_BASE: &str = "https://online.mbbank.com.vn";
pub const DEFAULT_STATE_DIR: &str = "state";

/// What the poller does after a successful cycle: keep looping on the
/// repeat interval, or park until the next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Continuous,
    OneShot,
}

impl SyncMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "continuous" => Ok(Self::Continuous),
            "one-shot" | "oneshot" => Ok(Self::OneShot),
            other => bail!("MB_SYNC_MODE must be 'continuous' or 'one-shot', got {other:?}"),
        }
    }
}

/// Identity and polling parameters of one watched account. Immutable for
/// the process lifetime; owned by its poller.
#[derive(Debug, Clone)]
pub struct Gate {
    pub name: String,
    pub login_id: String,
    pub password: String,
    pub account: String,
    pub repeat_interval: Duration,
    pub day_limit: u32,
    pub sync_mode: SyncMode,
    /// Bank-local time of the daily kick-off; `None` disables it.
    pub daily_sync_at: Option<NaiveTime>,
    /// Offset of the bank's local timezone. No DST handling on purpose.
    pub tz: FixedOffset,
}

impl Gate {
    pub fn from_env() -> Result<Self> {
        let repeat_sec: u64 = parse_env("MB_REPEAT_SEC", DEFAULT_REPEAT_SEC)?;
        if !(1..=120).contains(&repeat_sec) {
            bail!("MB_REPEAT_SEC must be within 1..=120, got {repeat_sec}");
        }
        let day_limit: u32 = parse_env("MB_TXN_DAY_LIMIT", DEFAULT_DAY_LIMIT)?;
        if !(1..=100).contains(&day_limit) {
            bail!("MB_TXN_DAY_LIMIT must be within 1..=100, got {day_limit}");
        }
        let tz_hours: i32 = parse_env("MB_TZ_OFFSET_HOURS", DEFAULT_TZ_OFFSET_HOURS)?;
        if !(-12..=14).contains(&tz_hours) {
            bail!("MB_TZ_OFFSET_HOURS must be within -12..=14, got {tz_hours}");
        }
        let tz = FixedOffset::east_opt(tz_hours * 3600)
            .ok_or_else(|| anyhow!("MB_TZ_OFFSET_HOURS out of range: {tz_hours}"))?;
        let sync_mode = match env_var("MB_SYNC_MODE") {
            Some(raw) => SyncMode::parse(&raw)?,
            None => SyncMode::default(),
        };
        let daily_sync_at = parse_daily_sync_at(
            env_var("MB_DAILY_SYNC_AT")
                .as_deref()
                .unwrap_or(DEFAULT_DAILY_SYNC_AT),
        )?;
        Ok(Self {
            name: env_var("MB_NAME").unwrap_or_else(|| DEFAULT_GATE_NAME.to_string()),
            login_id: required("MB_LOGIN_ID")?,
            password: required("MB_PASSWORD")?,
            account: required("MB_ACCOUNT")?,
            repeat_interval: Duration::from_secs(repeat_sec),
            day_limit,
            sync_mode,
            daily_sync_at,
            tz,
        })
    }
}

fn parse_daily_sync_at(raw: &str) -> Result<Option<NaiveTime>> {
    if raw.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map(Some)
        .map_err(|_| anyhow!("MB_DAILY_SYNC_AT must be HH:MM or 'off', got {raw:?}"))
}

/// Delivery endpoint plus optional enqueue-time filters. An unset filter
/// admits everything.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub token: String,
    pub content_regex: Option<Regex>,
    pub account_regex: Option<Regex>,
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self> {
        let url = required("WEBHOOK_URL")?;
        let parsed = reqwest::Url::parse(&url)
            .with_context(|| format!("WEBHOOK_URL is not an absolute URL: {url:?}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("WEBHOOK_URL must be http(s), got {url:?}");
        }
        Ok(Self {
            url,
            token: env_var("WEBHOOK_TOKEN").unwrap_or_default(),
            content_regex: parse_regex("WEBHOOK_CONTENT_REGEX")?,
            account_regex: parse_regex("WEBHOOK_ACCOUNT_REGEX")?,
        })
    }
}

fn parse_regex(key: &str) -> Result<Option<Regex>> {
    match env_var(key) {
        Some(raw) => Regex::new(&raw)
            .map(Some)
            .with_context(|| format!("{key} is not a valid regex: {raw:?}")),
        None => Ok(None),
    }
}

/// Endpoints of the bank API and its two sidecars.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub api_base: String,
    pub captcha_base_url: String,
    pub login_base_url: String,
}

impl SourceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_base: env_var("MB_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            captcha_base_url: required("CAPTCHA_API_BASE_URL")?,
            login_base_url: required("LOGIN_AUTOMATION_BASE_URL")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub state_dir: PathBuf,
    /// Skip rehydration at boot (snapshots are still written).
    pub disable_sync: bool,
}

impl SnapshotConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: PathBuf::from(
                env_var("STATE_DIR").unwrap_or_else(|| DEFAULT_STATE_DIR.to_string()),
            ),
            disable_sync: flag_env("DISABLE_SNAPSHOT_SYNC"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env("PORT", 3000)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Name stamped into webhook envelopes as `source`.
    pub app_name: String,
    pub gate: Gate,
    pub webhook: WebhookConfig,
    pub source: SourceConfig,
    pub snapshot: SnapshotConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            app_name: env_var("APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            gate: Gate::from_env()?,
            webhook: WebhookConfig::from_env()?,
            source: SourceConfig::from_env()?,
            snapshot: SnapshotConfig::from_env(),
            server: ServerConfig::from_env()?,
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
    env_var(key).ok_or_else(|| anyhow!("{key} is required"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

fn flag_env(key: &str) -> bool {
    env_var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
