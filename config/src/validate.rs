use super::AppConfig;
use anyhow::Result;

fn check_range(name: &str, min: f64, max: f64) -> Result<()> {
    if min < 0.0 || max < 0.0 {
        anyhow::bail!("{} 不能为负数", name);
    }
    if min > max {
        anyhow::bail!("{} 下限 {} 大于上限 {}", name, min, max);
    }
    Ok(())
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.db_file.as_os_str().is_empty() {
        anyhow::bail!("ENGAGE_DB_FILE 不能为空");
    }
    if config.global_rate_limit == 0 {
        anyhow::bail!("ENGAGE_GLOBAL_RATE_LIMIT 必须大于 0");
    }

    check_range(
        "ENGAGE_REACTION_DELAY",
        config.reaction_delay_min,
        config.reaction_delay_max,
    )?;
    check_range(
        "ENGAGE_COMMENT_DELAY",
        config.comment_delay_min,
        config.comment_delay_max,
    )?;

    if config.view_accounts_min > config.view_accounts_max {
        anyhow::bail!(
            "ENGAGE_VIEW_ACCOUNTS 下限 {} 大于上限 {}",
            config.view_accounts_min,
            config.view_accounts_max
        );
    }

    if config.max_commenting_accounts == 0 {
        anyhow::bail!("ENGAGE_MAX_COMMENTING_ACCOUNTS 必须大于 0");
    }
    if config.comment_batch == 0 {
        anyhow::bail!("ENGAGE_COMMENT_BATCH 必须大于 0");
    }
    if config.comment_usage_threshold == 0 {
        anyhow::bail!("ENGAGE_COMMENT_USAGE_THRESHOLD 必须大于 0");
    }
    if config.album_ttl == 0 {
        anyhow::bail!("ENGAGE_ALBUM_TTL 必须大于 0");
    }
    if config.connect_timeout == 0 {
        anyhow::bail!("ENGAGE_CONNECT_TIMEOUT 必须大于 0");
    }
    if config.account_start_interval < 0.0 {
        anyhow::bail!("ENGAGE_ACCOUNT_START_INTERVAL 不能为负数");
    }
    if config.disconnect_timeout == 0 {
        anyhow::bail!("ENGAGE_DISCONNECT_TIMEOUT 必须大于 0");
    }
    if config.shutdown_drain_timeout == 0 {
        anyhow::bail!("ENGAGE_SHUTDOWN_DRAIN_TIMEOUT 必须大于 0");
    }
    if config.generator_timeout == 0 {
        anyhow::bail!("ENGAGE_GENERATOR_TIMEOUT 必须大于 0");
    }
    if config.chat_refresh_interval == 0 {
        anyhow::bail!("ENGAGE_CHAT_REFRESH_INTERVAL 必须大于 0");
    }
    if config.db_checkpoint_interval == 0 {
        anyhow::bail!("ENGAGE_DB_CHECKPOINT_INTERVAL 必须大于 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_inverted_delay_range() {
        let config = AppConfig {
            comment_delay_min: 10.0,
            comment_delay_max: 5.0,
            ..AppConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("ENGAGE_COMMENT_DELAY"));
    }

    #[test]
    fn test_rejects_zero_rate_limit() {
        let config = AppConfig {
            global_rate_limit: 0,
            ..AppConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_inverted_view_range() {
        let config = AppConfig {
            view_accounts_min: 11,
            view_accounts_max: 10,
            ..AppConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
