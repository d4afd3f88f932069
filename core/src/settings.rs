use crate::policy::DelayRange;
use std::time::Duration;

/// 调度引擎的运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub global_rate_limit: usize,
    pub reaction_delay: DelayRange,
    pub comment_delay: DelayRange,
    pub view_accounts: (usize, usize),
    pub max_commenting_accounts: usize,
    pub comment_batch: usize,
    pub comment_regen_count: usize,
    pub comment_usage_threshold: usize,
    pub album_ttl: Duration,
    pub album_scan_limit: usize,
    pub connect_timeout: Duration,
    pub account_start_interval: Duration,
    pub disconnect_timeout: Duration,
    pub shutdown_drain_timeout: Duration,
    pub generator_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            global_rate_limit: 5,
            reaction_delay: DelayRange::new(1.3, 3.1),
            comment_delay: DelayRange::new(20.3, 50.6),
            view_accounts: (8, 10),
            max_commenting_accounts: 10,
            comment_batch: 50,
            comment_regen_count: 15,
            comment_usage_threshold: 5,
            album_ttl: Duration::from_secs(10),
            album_scan_limit: 50,
            connect_timeout: Duration::from_secs(10),
            account_start_interval: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(10),
            shutdown_drain_timeout: Duration::from_secs(60),
            generator_timeout: Duration::from_secs(30),
        }
    }
}

/// 固定的各类动作延迟与抖动
pub const POLL_DELAY: DelayRange = DelayRange {
    min: 1.0,
    max: 5.0,
};
pub const VIEW_DELAY: DelayRange = DelayRange {
    min: 0.5,
    max: 2.0,
};
pub const COMMENT_SPACING: DelayRange = DelayRange {
    min: 3.5,
    max: 9.5,
};
pub const SLOT_JITTER: DelayRange = DelayRange {
    min: 0.1,
    max: 0.3,
};
