use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use tracing_subscriber::{fmt, EnvFilter};

/// 限流事件使用的 target，带 `account` 和 `wait_secs` 字段。
/// 这类事件不直接输出，而是按账号聚合后每 10 秒汇总一次。
pub const RATE_LIMIT_TARGET: &str = "engage::rate_limit";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static SUMMARY_FLUSH: OnceLock<()> = OnceLock::new();

pub type LogGuard = WorkerGuard;

#[derive(Default)]
struct RateLimitAggregator {
    inner: std::sync::Mutex<HashMap<i64, RateLimitStat>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RateLimitStat {
    count: usize,
    max_wait: u64,
    total_wait: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RateLimitItem {
    account: i64,
    wait_secs: u64,
}

impl RateLimitAggregator {
    fn record(&self, item: RateLimitItem) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = inner.entry(item.account).or_insert(RateLimitStat {
            count: 0,
            max_wait: 0,
            total_wait: 0,
        });

        entry.count += 1;
        entry.total_wait = entry.total_wait.saturating_add(item.wait_secs);
        if item.wait_secs > entry.max_wait {
            entry.max_wait = item.wait_secs;
        }
    }

    fn drain(&self) -> Vec<(i64, RateLimitStat)> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut items: Vec<_> = inner.drain().collect();
        items.sort_by_key(|(account, _)| *account);
        items
    }
}

struct RateLimitLayer {
    aggregator: Arc<RateLimitAggregator>,
}

impl<S> Layer<S> for RateLimitLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if let Some(item) = extract_rate_limit(event) {
            self.aggregator.record(item);
        }
    }
}

/// 过滤掉已被聚合的限流事件，其余事件交给内层格式化。
#[derive(Clone)]
struct SummaryFilterFormat<F> {
    inner: F,
}

impl<S, N, F> FormatEvent<S, N> for SummaryFilterFormat<F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if event.metadata().target() == RATE_LIMIT_TARGET {
            return Ok(());
        }

        self.inner.format_event(ctx, writer, event)
    }
}

#[derive(Default)]
struct RateLimitVisitor {
    account: Option<i64>,
    wait_secs: Option<u64>,
}

impl Visit for RateLimitVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        match field.name() {
            "account" => self.account = Some(value),
            "wait_secs" => self.wait_secs = Some(value.max(0) as u64),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "account" => self.account = i64::try_from(value).ok(),
            "wait_secs" => self.wait_secs = Some(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // 兼容以 `?` 或 `%` 形式记录的数字字段
        let text = format!("{:?}", value);
        match field.name() {
            "account" if self.account.is_none() => self.account = text.parse().ok(),
            "wait_secs" if self.wait_secs.is_none() => self.wait_secs = text.parse().ok(),
            _ => {}
        }
    }
}

fn extract_rate_limit(event: &Event<'_>) -> Option<RateLimitItem> {
    if event.metadata().target() != RATE_LIMIT_TARGET {
        return None;
    }

    let mut visitor = RateLimitVisitor::default();
    event.record(&mut visitor);

    Some(RateLimitItem {
        account: visitor.account?,
        wait_secs: visitor.wait_secs.unwrap_or(0),
    })
}

fn start_summary_flush_task(aggregator: Arc<RateLimitAggregator>) {
    if SUMMARY_FLUSH.set(()).is_err() {
        return;
    }

    // 在 runtime 之外初始化时无法启动汇总任务，限流事件仅被静默聚合
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    handle.spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            for (account, stat) in aggregator.drain() {
                tracing::warn!(
                    target: "engage::summary",
                    "限流汇总: 账号={} 次数={} 最长等待={}s 累计等待={}s",
                    account,
                    stat.count,
                    stat.max_wait,
                    stat.total_wait
                );
            }
        }
    });
}

fn ensure_log_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level.trim().to_ascii_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level))
}

/// 初始化全局日志，只在第一次调用时生效。
pub fn init(log_file: &Path, level: &str) -> std::io::Result<&'static WorkerGuard> {
    if let Some(guard) = LOG_GUARD.get() {
        return Ok(guard);
    }

    ensure_log_dir(log_file)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    let guard = LOG_GUARD.get_or_init(|| {
        let (non_blocking, guard) = tracing_appender::non_blocking(file);

        let aggregator = Arc::new(RateLimitAggregator::default());
        let summary_layer = RateLimitLayer {
            aggregator: aggregator.clone(),
        };
        let format = SummaryFilterFormat {
            inner: fmt::format(),
        };

        let installed = tracing_subscriber::registry()
            .with(build_filter(level))
            .with(summary_layer)
            .with(
                fmt::layer()
                    .event_format(format.clone())
                    .with_writer(std::io::stdout),
            )
            .with(
                fmt::layer()
                    .event_format(format)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init();

        if installed.is_ok() {
            start_summary_flush_task(aggregator);
        }
        guard
    });

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregator_tracks_count_and_max() {
        let agg = RateLimitAggregator::default();
        agg.record(RateLimitItem {
            account: 7,
            wait_secs: 30,
        });
        agg.record(RateLimitItem {
            account: 7,
            wait_secs: 90,
        });
        agg.record(RateLimitItem {
            account: 3,
            wait_secs: 5,
        });

        let drained = agg.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 3);
        assert_eq!(
            drained[1].1,
            RateLimitStat {
                count: 2,
                max_wait: 90,
                total_wait: 120
            }
        );
        assert!(agg.drain().is_empty());
    }

    #[test]
    fn test_level_filter_accepts_uppercase_level() {
        assert_eq!(level_filter("DEBUG").to_string(), "debug");
        assert_eq!(level_filter("app=nope").to_string(), "info");
    }
}
