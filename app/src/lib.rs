use anyhow::{Context, Result};
use common::secs_to_duration;
use config::{ensure_parent_exists, load_config, AppConfig};
use engage_core::{ClientConnector, DelayRange, Engine, EngineSettings, TextGenerator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{rotate_log, Database, Repository};
use tokio::signal;
use tracing::{error, info, warn};

/// 把应用配置换算成调度引擎参数
pub fn engine_settings(config: &AppConfig) -> EngineSettings {
    EngineSettings {
        global_rate_limit: config.global_rate_limit,
        reaction_delay: DelayRange::new(config.reaction_delay_min, config.reaction_delay_max),
        comment_delay: DelayRange::new(config.comment_delay_min, config.comment_delay_max),
        view_accounts: (config.view_accounts_min, config.view_accounts_max),
        max_commenting_accounts: config.max_commenting_accounts,
        comment_batch: config.comment_batch,
        comment_regen_count: config.comment_regen_count,
        comment_usage_threshold: config.comment_usage_threshold,
        album_ttl: Duration::from_secs(config.album_ttl),
        connect_timeout: Duration::from_secs(config.connect_timeout),
        account_start_interval: secs_to_duration(config.account_start_interval),
        disconnect_timeout: Duration::from_secs(config.disconnect_timeout),
        shutdown_drain_timeout: Duration::from_secs(config.shutdown_drain_timeout),
        generator_timeout: Duration::from_secs(config.generator_timeout),
        ..EngineSettings::default()
    }
}

/// 启动调度服务并阻塞到收到 Ctrl-C
///
/// 平台连接与评论生成由调用方注入。
pub async fn run(
    connector: Arc<dyn ClientConnector>,
    generator: Arc<dyn TextGenerator>,
) -> Result<()> {
    let config = load_config()?;

    ensure_parent_exists(&config.log_file)?;
    if config.log_file.exists() {
        rotate_log(&config.log_file, config.log_max_lines)?;
    }
    logging::init(&config.log_file, &config.log_level).context("初始化日志失败")?;

    let db = Arc::new(Database::open(&config.db_file).await?);
    let repo = Repository::new(db.clone());
    repo.init_schema().await.context("初始化数据库结构失败")?;
    info!("数据库已就绪: {:?}", config.db_file);

    let engine = Arc::new(Engine::new(
        engine_settings(&config),
        repo,
        connector,
        generator,
    ));
    engine.start().await?;

    let shutdown = Arc::new(AtomicBool::new(false));

    let checkpoint_task = tokio::spawn(
        db.periodic_checkpoint(config.db_checkpoint_interval, shutdown.clone()),
    );

    // 定期刷新监听聊天并截断日志
    let maintenance_task = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let log_file = config.log_file.clone();
        let log_max_lines = config.log_max_lines;
        let interval = Duration::from_secs(config.chat_refresh_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = engine.refresh_watched_chats().await {
                    warn!("刷新监听聊天失败: {:#}", e);
                }
                if let Err(e) = rotate_log(&log_file, log_max_lines) {
                    error!("日志截断失败: {}", e);
                }
            }
        })
    };

    match signal::ctrl_c().await {
        Ok(()) => info!("收到退出信号，正在关闭..."),
        Err(e) => error!("监听退出信号失败: {}，立即关闭", e),
    }

    shutdown.store(true, Ordering::Relaxed);
    maintenance_task.abort();
    checkpoint_task.abort();

    engine.stop().await?;
    if let Err(e) = db.checkpoint().await {
        warn!("退出前 checkpoint 失败: {:#}", e);
    }
    info!("已退出");
    Ok(())
}
