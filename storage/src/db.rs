use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

/// 一行查询结果，按列顺序保存
pub type Row = Vec<Value>;

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// SQLite 数据库句柄
///
/// 连接运行在 tokio-rusqlite 的专用线程上，所有语句经 `call` 串行执行，
/// 不占用 runtime 线程；遇到 `SQLITE_BUSY` / `SQLITE_LOCKED` 时按 0.5s
/// 起步、每次翻倍的间隔重试，最多 5 次。
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> anyhow::Error {
    anyhow::anyhow!("数据库连接不可用: {}", e)
}

fn read_row(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(columns);
    for idx in 0..columns {
        values.push(row.get::<_, Value>(idx)?);
    }
    Ok(values)
}

impl Database {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("无法创建数据库目录: {:?}", parent))?;
            }
        }

        let conn = Connection::open(&path)
            .await
            .map_err(|e| map_tr_err(e.into()))
            .with_context(|| format!("无法打开数据库: {:?}", path))?;
        conn.call(|conn| -> Result<(), rusqlite::Error> {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)
        .context("设置数据库 PRAGMA 失败")?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| map_tr_err(e.into()))
            .context("无法创建内存数据库")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 在连接线程上执行 `op`，锁冲突时退避重试
    ///
    /// 每次尝试都克隆一份 `op`（连同其持有的 SQL 与参数）交给连接线程。
    async fn with_retry<T, F>(&self, label: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut rusqlite::Connection) -> rusqlite::Result<T> + Clone + Send + 'static,
    {
        let mut delay = RETRY_INITIAL_DELAY;
        let mut attempt = 1;
        loop {
            let attempt_op = op.clone();
            let result = self
                .conn
                .call(move |conn| Ok::<_, rusqlite::Error>(attempt_op(conn)))
                .await
                .map_err(map_tr_err)?;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "数据库被锁定，{}ms 后重试 ({}/{}): {}",
                        delay.as_millis(),
                        attempt,
                        RETRY_ATTEMPTS,
                        label
                    );
                    tokio::time::sleep(delay).await;
                    delay = common::next_backoff(delay, Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("数据库操作失败 (尝试 {} 次): {}", attempt, label)))
                }
            }
        }
    }

    /// 执行单条语句，返回受影响行数
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<usize> {
        let owned = sql.to_string();
        self.with_retry(sql, move |conn| {
            conn.execute(&owned, params_from_iter(params.iter()))
        })
        .await
    }

    /// 执行插入并返回新行 id
    pub async fn insert(&self, sql: &str, params: Vec<Value>) -> Result<i64> {
        let owned = sql.to_string();
        self.with_retry(sql, move |conn| {
            conn.execute(&owned, params_from_iter(params.iter()))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn fetch_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<Row>> {
        let owned = sql.to_string();
        self.with_retry(sql, move |conn| {
            let mut stmt = conn.prepare(&owned)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(read_row(row, columns)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn fetch_all(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let owned = sql.to_string();
        self.with_retry(sql, move |conn| {
            let mut stmt = conn.prepare(&owned)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_row(row, columns)?);
            }
            Ok(out)
        })
        .await
    }

    /// 同一语句绑定多组参数，在一个事务内执行
    pub async fn execute_batch(&self, sql: &str, batch: Vec<Vec<Value>>) -> Result<usize> {
        let owned = sql.to_string();
        self.with_retry(sql, move |conn| {
            let tx = conn.transaction()?;
            let mut affected = 0;
            {
                let mut stmt = tx.prepare(&owned)?;
                for params in &batch {
                    affected += stmt.execute(params_from_iter(params.iter()))?;
                }
            }
            tx.commit()?;
            Ok(affected)
        })
        .await
    }

    /// 执行多条无参数语句（建表、迁移）
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let owned = sql.to_string();
        self.with_retry("script", move |conn| conn.execute_batch(&owned))
            .await
    }

    /// 将 WAL 内容写回主数据库
    ///
    /// 内存数据库直接返回 `Ok(false)`
    pub async fn checkpoint(&self) -> Result<bool> {
        if self.path.is_none() {
            return Ok(false);
        }
        self.with_retry("wal_checkpoint", |conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        })
        .await?;
        debug!("SQLite WAL checkpoint 成功");
        Ok(true)
    }

    /// 定期执行 checkpoint 的异步任务，`shutdown` 置位后退出
    pub fn periodic_checkpoint(
        self: &Arc<Self>,
        interval_sec: u64,
        shutdown: Arc<AtomicBool>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let db = Arc::clone(self);
        let interval = Duration::from_secs(interval_sec.max(1));

        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    debug!("收到关闭信号，停止定期 checkpoint");
                    break;
                }

                if let Err(e) = db.checkpoint().await {
                    warn!("定期 checkpoint 失败: {:#}", e);
                }
            }
        }
    }
}
