use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::paths::{project_root, resolve_path};
use super::validate::validate_config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub db_file: PathBuf,
    pub log_file: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,

    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit: usize,

    #[serde(default = "default_reaction_delay_min")]
    pub reaction_delay_min: f64,
    #[serde(default = "default_reaction_delay_max")]
    pub reaction_delay_max: f64,
    #[serde(default = "default_comment_delay_min")]
    pub comment_delay_min: f64,
    #[serde(default = "default_comment_delay_max")]
    pub comment_delay_max: f64,

    #[serde(default = "default_view_accounts_min")]
    pub view_accounts_min: usize,
    #[serde(default = "default_view_accounts_max")]
    pub view_accounts_max: usize,

    #[serde(default = "default_max_commenting_accounts")]
    pub max_commenting_accounts: usize,
    #[serde(default = "default_comment_batch")]
    pub comment_batch: usize,
    #[serde(default = "default_comment_regen_count")]
    pub comment_regen_count: usize,
    #[serde(default = "default_comment_usage_threshold")]
    pub comment_usage_threshold: usize,

    #[serde(default = "default_album_ttl")]
    pub album_ttl: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_account_start_interval")]
    pub account_start_interval: f64,
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: u64,
    #[serde(default = "default_shutdown_drain_timeout")]
    pub shutdown_drain_timeout: u64,
    #[serde(default = "default_generator_timeout")]
    pub generator_timeout: u64,

    #[serde(default = "default_chat_refresh_interval")]
    pub chat_refresh_interval: u64,
    #[serde(default = "default_db_checkpoint_interval")]
    pub db_checkpoint_interval: u64,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_log_max_lines() -> usize {
    1000
}
fn default_global_rate_limit() -> usize {
    5
}
fn default_reaction_delay_min() -> f64 {
    1.3
}
fn default_reaction_delay_max() -> f64 {
    3.1
}
fn default_comment_delay_min() -> f64 {
    20.3
}
fn default_comment_delay_max() -> f64 {
    50.6
}
fn default_view_accounts_min() -> usize {
    8
}
fn default_view_accounts_max() -> usize {
    10
}
fn default_max_commenting_accounts() -> usize {
    10
}
fn default_comment_batch() -> usize {
    50
}
fn default_comment_regen_count() -> usize {
    15
}
fn default_comment_usage_threshold() -> usize {
    5
}
fn default_album_ttl() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_account_start_interval() -> f64 {
    2.0
}
fn default_disconnect_timeout() -> u64 {
    10
}
fn default_shutdown_drain_timeout() -> u64 {
    60
}
fn default_generator_timeout() -> u64 {
    30
}
fn default_chat_refresh_interval() -> u64 {
    60
}
fn default_db_checkpoint_interval() -> u64 {
    300
}

impl Default for AppConfig {
    fn default() -> Self {
        let root = project_root();
        Self {
            db_file: root.join("bot_data.db"),
            log_file: root.join("logs.txt"),
            log_level: default_log_level(),
            log_max_lines: default_log_max_lines(),
            global_rate_limit: default_global_rate_limit(),
            reaction_delay_min: default_reaction_delay_min(),
            reaction_delay_max: default_reaction_delay_max(),
            comment_delay_min: default_comment_delay_min(),
            comment_delay_max: default_comment_delay_max(),
            view_accounts_min: default_view_accounts_min(),
            view_accounts_max: default_view_accounts_max(),
            max_commenting_accounts: default_max_commenting_accounts(),
            comment_batch: default_comment_batch(),
            comment_regen_count: default_comment_regen_count(),
            comment_usage_threshold: default_comment_usage_threshold(),
            album_ttl: default_album_ttl(),
            connect_timeout: default_connect_timeout(),
            account_start_interval: default_account_start_interval(),
            disconnect_timeout: default_disconnect_timeout(),
            shutdown_drain_timeout: default_shutdown_drain_timeout(),
            generator_timeout: default_generator_timeout(),
            chat_refresh_interval: default_chat_refresh_interval(),
            db_checkpoint_interval: default_db_checkpoint_interval(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            match trimmed.parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!("环境变量格式无效，使用默认值: {}={}", key, trimmed);
                    default
                }
            }
        }
        Err(_) => default,
    }
}

pub fn load_config() -> Result<AppConfig> {
    let project_root = project_root();
    let env_path = project_root.join(".env");

    if env_path.exists() {
        dotenv::from_path(&env_path)
            .with_context(|| format!("无法读取 .env 文件: {:?}", env_path))?;
    }

    let db_file_raw = env::var("ENGAGE_DB_FILE").unwrap_or_default();
    let db_file = resolve_path(db_file_raw.trim(), "bot_data.db");
    let log_file_raw = env::var("ENGAGE_LOG_FILE").unwrap_or_default();
    let log_file = resolve_path(log_file_raw.trim(), "logs.txt");

    let config = AppConfig {
        db_file,
        log_file,
        log_level: env::var("ENGAGE_LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        log_max_lines: env_or("ENGAGE_LOG_MAX_LINES", default_log_max_lines()),
        global_rate_limit: env_or("ENGAGE_GLOBAL_RATE_LIMIT", default_global_rate_limit()),
        reaction_delay_min: env_or("ENGAGE_REACTION_DELAY_MIN", default_reaction_delay_min()),
        reaction_delay_max: env_or("ENGAGE_REACTION_DELAY_MAX", default_reaction_delay_max()),
        comment_delay_min: env_or("ENGAGE_COMMENT_DELAY_MIN", default_comment_delay_min()),
        comment_delay_max: env_or("ENGAGE_COMMENT_DELAY_MAX", default_comment_delay_max()),
        view_accounts_min: env_or("ENGAGE_VIEW_ACCOUNTS_MIN", default_view_accounts_min()),
        view_accounts_max: env_or("ENGAGE_VIEW_ACCOUNTS_MAX", default_view_accounts_max()),
        max_commenting_accounts: env_or(
            "ENGAGE_MAX_COMMENTING_ACCOUNTS",
            default_max_commenting_accounts(),
        ),
        comment_batch: env_or("ENGAGE_COMMENT_BATCH", default_comment_batch()),
        comment_regen_count: env_or("ENGAGE_COMMENT_REGEN_COUNT", default_comment_regen_count()),
        comment_usage_threshold: env_or(
            "ENGAGE_COMMENT_USAGE_THRESHOLD",
            default_comment_usage_threshold(),
        ),
        album_ttl: env_or("ENGAGE_ALBUM_TTL", default_album_ttl()),
        connect_timeout: env_or("ENGAGE_CONNECT_TIMEOUT", default_connect_timeout()),
        account_start_interval: env_or(
            "ENGAGE_ACCOUNT_START_INTERVAL",
            default_account_start_interval(),
        ),
        disconnect_timeout: env_or("ENGAGE_DISCONNECT_TIMEOUT", default_disconnect_timeout()),
        shutdown_drain_timeout: env_or(
            "ENGAGE_SHUTDOWN_DRAIN_TIMEOUT",
            default_shutdown_drain_timeout(),
        ),
        generator_timeout: env_or("ENGAGE_GENERATOR_TIMEOUT", default_generator_timeout()),
        chat_refresh_interval: env_or(
            "ENGAGE_CHAT_REFRESH_INTERVAL",
            default_chat_refresh_interval(),
        ),
        db_checkpoint_interval: env_or(
            "ENGAGE_DB_CHECKPOINT_INTERVAL",
            default_db_checkpoint_interval(),
        ),
    };

    tracing::info!(
        "已加载配置: 并发上限={} 反应延迟={}-{}s 评论延迟={}-{}s",
        config.global_rate_limit,
        config.reaction_delay_min,
        config.reaction_delay_max,
        config.comment_delay_min,
        config.comment_delay_max
    );

    validate_config(&config)?;

    Ok(config)
}
