use anyhow::Result;
use rusqlite::types::Value;
use std::sync::Arc;
use tracing::info;

use super::db::{Database, Row};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_path TEXT UNIQUE NOT NULL,
    phone TEXT,
    added_at TEXT,
    proxy TEXT,
    banned INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS subscriptions (
    account_id INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,
    chat_title TEXT,
    chat_type TEXT
);
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER,
    action TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS auto_reactions (
    chat_id INTEGER PRIMARY KEY,
    reaction TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS auto_comments (
    chat_id INTEGER PRIMARY KEY,
    comments TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    chat_id INTEGER PRIMARY KEY,
    max_accounts INTEGER,
    comment_delay_min REAL,
    comment_delay_max REAL,
    reaction_delay_min REAL,
    reaction_delay_max REAL,
    view_min INTEGER,
    view_max INTEGER
);
";

const SUBSCRIPTION_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_account_chat \
     ON subscriptions (account_id, chat_id);";

/// 评论池文本可能带有语言前缀，例如 `English:a|b|c`
const LANGUAGE_PREFIXES: [&str; 4] = ["English:", "Ukrainian:", "Russian:", "Spanish:"];

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub id: i64,
    pub session_path: String,
    pub phone: Option<String>,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSettingsRow {
    pub max_accounts: Option<i64>,
    pub comment_delay_min: Option<f64>,
    pub comment_delay_max: Option<f64>,
    pub reaction_delay_min: Option<f64>,
    pub reaction_delay_max: Option<f64>,
    pub view_min: Option<i64>,
    pub view_max: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub account_id: i64,
    pub action: String,
    pub details: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub duplicates: usize,
    pub orphans: usize,
}

fn int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Integer(i) => Some(*i),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn real(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Real(f) => Some(*f),
        Value::Integer(i) => Some(*i as f64),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn opt_text(v: Option<&str>) -> Value {
    v.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null)
}

fn opt_int(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Null)
}

fn opt_real(v: Option<f64>) -> Value {
    v.map(Value::Real).unwrap_or(Value::Null)
}

/// 拆分存储的评论池字符串，去掉语言前缀和空项
pub fn split_comment_pool(raw: &str) -> Vec<String> {
    let mut body = raw.trim();
    for prefix in LANGUAGE_PREFIXES {
        if let Some(rest) = body.strip_prefix(prefix) {
            body = rest;
            break;
        }
    }
    body.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 调度器使用的持久化查询
#[derive(Clone)]
pub struct Repository {
    db: Arc<Database>,
}

impl Repository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// 建表并在清理重复订阅后加上唯一索引
    pub async fn init_schema(&self) -> Result<()> {
        self.db.execute_script(SCHEMA).await?;
        self.remove_duplicate_subscriptions().await?;
        self.db.execute_script(SUBSCRIPTION_INDEX).await?;
        Ok(())
    }

    // ---- accounts ----

    pub async fn insert_account(
        &self,
        session_path: &str,
        phone: Option<&str>,
        proxy: Option<&str>,
    ) -> Result<i64> {
        self.db
            .insert(
                "INSERT INTO accounts (session_path, phone, added_at, proxy, banned) \
                 VALUES (?1, ?2, ?3, ?4, 0)",
                vec![
                    Value::Text(session_path.to_string()),
                    opt_text(phone),
                    Value::Text(chrono::Utc::now().to_rfc3339()),
                    opt_text(proxy),
                ],
            )
            .await
    }

    pub async fn active_accounts(&self) -> Result<Vec<AccountRow>> {
        let rows = self
            .db
            .fetch_all(
                "SELECT id, session_path, phone, proxy FROM accounts WHERE banned = 0 ORDER BY id",
                vec![],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(AccountRow {
                    id: int(row.first())?,
                    session_path: text(row.get(1))?,
                    phone: text(row.get(2)),
                    proxy: text(row.get(3)),
                })
            })
            .collect())
    }

    pub async fn account(&self, id: i64) -> Result<Option<AccountRow>> {
        let row = self
            .db
            .fetch_one(
                "SELECT id, session_path, phone, proxy FROM accounts WHERE id = ?1",
                vec![Value::Integer(id)],
            )
            .await?;
        Ok(row.and_then(|row| {
            Some(AccountRow {
                id: int(row.first())?,
                session_path: text(row.get(1))?,
                phone: text(row.get(2)),
                proxy: text(row.get(3)),
            })
        }))
    }

    /// 删除账号及其全部订阅，历史记录保留
    pub async fn delete_account(&self, id: i64) -> Result<()> {
        self.db
            .execute(
                "DELETE FROM subscriptions WHERE account_id = ?1",
                vec![Value::Integer(id)],
            )
            .await?;
        self.db
            .execute("DELETE FROM accounts WHERE id = ?1", vec![Value::Integer(id)])
            .await?;
        Ok(())
    }

    // ---- subscriptions ----

    /// 返回是否新插入
    pub async fn add_subscription(
        &self,
        account_id: i64,
        chat_id: i64,
        title: Option<&str>,
        chat_type: Option<&str>,
    ) -> Result<bool> {
        let affected = self
            .db
            .execute(
                "INSERT OR IGNORE INTO subscriptions (account_id, chat_id, chat_title, chat_type) \
                 VALUES (?1, ?2, ?3, ?4)",
                vec![
                    Value::Integer(account_id),
                    Value::Integer(chat_id),
                    opt_text(title),
                    opt_text(chat_type),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn subscribed_accounts(&self, chat_id: i64) -> Result<Vec<i64>> {
        let rows = self
            .db
            .fetch_all(
                "SELECT DISTINCT account_id FROM subscriptions \
                 WHERE chat_id = ?1 ORDER BY account_id",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(rows.iter().filter_map(|row| int(row.first())).collect())
    }

    /// 删除重复订阅（保留最早一条）以及已删除账号的订阅
    pub async fn remove_duplicate_subscriptions(&self) -> Result<CleanupReport> {
        let duplicates = self
            .db
            .execute(
                "DELETE FROM subscriptions WHERE rowid NOT IN ( \
                     SELECT MIN(rowid) FROM subscriptions GROUP BY account_id, chat_id)",
                vec![],
            )
            .await?;
        let orphans = self
            .db
            .execute(
                "DELETE FROM subscriptions WHERE account_id NOT IN (SELECT id FROM accounts)",
                vec![],
            )
            .await?;

        if duplicates > 0 || orphans > 0 {
            info!("订阅清理完成: 重复={} 无主={}", duplicates, orphans);
        }
        Ok(CleanupReport { duplicates, orphans })
    }

    // ---- chat policies ----

    pub async fn reaction_policy_raw(&self, chat_id: i64) -> Result<Option<String>> {
        let row = self
            .db
            .fetch_one(
                "SELECT reaction FROM auto_reactions WHERE chat_id = ?1",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(row.and_then(|row| text(row.first())))
    }

    pub async fn set_reaction_policy_raw(&self, chat_id: i64, raw: &str) -> Result<()> {
        self.db
            .execute(
                "INSERT OR REPLACE INTO auto_reactions (chat_id, reaction) VALUES (?1, ?2)",
                vec![Value::Integer(chat_id), Value::Text(raw.to_string())],
            )
            .await?;
        Ok(())
    }

    pub async fn remove_reaction_policy(&self, chat_id: i64) -> Result<()> {
        self.db
            .execute(
                "DELETE FROM auto_reactions WHERE chat_id = ?1",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(())
    }

    /// 没有配置评论池时返回 `None`
    pub async fn comment_pool(&self, chat_id: i64) -> Result<Option<Vec<String>>> {
        let row = self
            .db
            .fetch_one(
                "SELECT comments FROM auto_comments WHERE chat_id = ?1",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(row
            .and_then(|row| text(row.first()))
            .map(|raw| split_comment_pool(&raw)))
    }

    pub async fn save_comment_pool(&self, chat_id: i64, pool: &[String]) -> Result<()> {
        let joined = pool
            .iter()
            .map(|s| s.replace('|', " "))
            .collect::<Vec<_>>()
            .join("|");
        self.db
            .execute(
                "INSERT OR REPLACE INTO auto_comments (chat_id, comments) VALUES (?1, ?2)",
                vec![Value::Integer(chat_id), Value::Text(joined)],
            )
            .await?;
        Ok(())
    }

    pub async fn remove_comment_pool(&self, chat_id: i64) -> Result<()> {
        self.db
            .execute(
                "DELETE FROM auto_comments WHERE chat_id = ?1",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(())
    }

    pub async fn chat_settings(&self, chat_id: i64) -> Result<Option<ChatSettingsRow>> {
        let row: Option<Row> = self
            .db
            .fetch_one(
                "SELECT max_accounts, comment_delay_min, comment_delay_max, \
                        reaction_delay_min, reaction_delay_max, view_min, view_max \
                 FROM settings WHERE chat_id = ?1",
                vec![Value::Integer(chat_id)],
            )
            .await?;
        Ok(row.map(|row| ChatSettingsRow {
            max_accounts: int(row.first()),
            comment_delay_min: real(row.get(1)),
            comment_delay_max: real(row.get(2)),
            reaction_delay_min: real(row.get(3)),
            reaction_delay_max: real(row.get(4)),
            view_min: int(row.get(5)),
            view_max: int(row.get(6)),
        }))
    }

    pub async fn save_chat_settings(&self, chat_id: i64, settings: &ChatSettingsRow) -> Result<()> {
        self.db
            .execute(
                "INSERT OR REPLACE INTO settings (chat_id, max_accounts, comment_delay_min, \
                     comment_delay_max, reaction_delay_min, reaction_delay_max, \
                     view_min, view_max) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                vec![
                    Value::Integer(chat_id),
                    opt_int(settings.max_accounts),
                    opt_real(settings.comment_delay_min),
                    opt_real(settings.comment_delay_max),
                    opt_real(settings.reaction_delay_min),
                    opt_real(settings.reaction_delay_max),
                    opt_int(settings.view_min),
                    opt_int(settings.view_max),
                ],
            )
            .await?;
        Ok(())
    }

    /// 配置了自动反应或自动评论的聊天集合
    pub async fn watched_chats(&self) -> Result<Vec<i64>> {
        let rows = self
            .db
            .fetch_all(
                "SELECT chat_id FROM auto_reactions UNION SELECT chat_id FROM auto_comments \
                 ORDER BY chat_id",
                vec![],
            )
            .await?;
        Ok(rows.iter().filter_map(|row| int(row.first())).collect())
    }

    // ---- history ----

    pub async fn insert_history(&self, account_id: i64, action: &str, details: &str) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO history (account_id, action, details, timestamp) \
                 VALUES (?1, ?2, ?3, ?4)",
                vec![
                    Value::Integer(account_id),
                    Value::Text(action.to_string()),
                    Value::Text(details.to_string()),
                    Value::Text(chrono::Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn history_for(&self, account_id: i64) -> Result<Vec<HistoryRow>> {
        let rows = self
            .db
            .fetch_all(
                "SELECT account_id, action, details, timestamp FROM history \
                 WHERE account_id = ?1 ORDER BY id",
                vec![Value::Integer(account_id)],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(HistoryRow {
                    account_id: int(row.first())?,
                    action: text(row.get(1))?,
                    details: text(row.get(2)).unwrap_or_default(),
                    timestamp: text(row.get(3))?,
                })
            })
            .collect())
    }
}
