//! Chat Store
//!
//! SQLite persistence for the four learned record kinds:
//! messages, contexts (stimulus signatures), answers (per-group reply
//! bundles) and the blacklist. No business logic lives here.
//!
//! Context/answer ownership is an id back-reference (`answer.context_id`).
//! Deleting a context always deletes its answers explicitly; foreign-key
//! cascades are not relied upon.

use anyhow::{Context as _, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::message::ChatMessage;

/// Learned stimulus signature
#[derive(Debug, Clone, PartialEq)]
pub struct ChatContext {
    /// Row id, 0 until persisted
    pub id: i64,
    pub keywords: String,
    pub time: i64,
    pub count: i64,
}

impl ChatContext {
    pub fn new(keywords: &str, time: i64) -> Self {
        Self {
            id: 0,
            keywords: keywords.to_string(),
            time,
            count: 1,
        }
    }
}

/// Reply texts learned for one context in one group, sharing a signature
#[derive(Debug, Clone, PartialEq)]
pub struct ChatAnswer {
    /// Row id, 0 until persisted
    pub id: i64,
    pub keywords: String,
    pub group_id: i64,
    pub count: i64,
    pub time: i64,
    /// Distinct literal texts, insertion ordered
    pub messages: Vec<String>,
    pub context_id: Option<i64>,
}

impl ChatAnswer {
    pub fn new(keywords: &str, group_id: i64, time: i64, context_id: i64, text: &str) -> Self {
        Self {
            id: 0,
            keywords: keywords.to_string(),
            group_id,
            count: 1,
            time,
            messages: vec![text.to_string()],
            context_id: Some(context_id),
        }
    }
}

/// Banned signature
#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistEntry {
    /// Row id, 0 until persisted
    pub id: i64,
    pub keywords: String,
    pub global_ban: bool,
    /// Groups where the signature is banned locally
    pub ban_group_id: Vec<i64>,
}

impl BlacklistEntry {
    pub fn new(keywords: &str, ban_group_id: Vec<i64>, global_ban: bool) -> Self {
        Self {
            id: 0,
            keywords: keywords.to_string(),
            global_ban,
            ban_group_id,
        }
    }

    /// Banned everywhere, or locally in `group_id`
    pub fn blocks(&self, group_id: i64) -> bool {
        self.global_ban || self.ban_group_id.contains(&group_id)
    }

    /// "global" or the first banning group, for listings
    pub fn scope_label(&self) -> String {
        if self.global_ban {
            "global".to_string()
        } else {
            self.ban_group_id
                .first()
                .map(|g| g.to_string())
                .unwrap_or_default()
        }
    }
}

/// Paging and ordering for listings
#[derive(Debug, Clone)]
pub struct PageQuery {
    /// 1-based
    pub page: usize,
    pub per_page: usize,
    /// Column to order by; unknown columns fall back to the table default
    pub order_by: Option<String>,
    pub descending: bool,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
            order_by: None,
            descending: true,
        }
    }
}

impl PageQuery {
    fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.per_page
    }

    fn order_clause(&self, allowed: &[&str], default: &str) -> String {
        let column = self
            .order_by
            .as_deref()
            .filter(|c| allowed.contains(c))
            .unwrap_or(default);
        let dir = if self.descending { "DESC" } else { "ASC" };
        format!("ORDER BY {column} {dir}, id {dir}")
    }
}

/// One page of records plus the unpaged total
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Contains-filters for message listings
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub text: Option<String>,
}

/// Contains-filters for answer listings
#[derive(Debug, Clone, Default)]
pub struct AnswerFilter {
    pub context_id: Option<i64>,
    pub keywords: Option<String>,
}

const MESSAGE_COLUMNS: &str =
    "id, group_id, user_id, message_id, message, raw_message, plain_text, time";
const CONTEXT_COLUMNS: &str = "id, keywords, time, count";
const ANSWER_COLUMNS: &str = "id, keywords, group_id, count, time, messages, context_id";
const BLACKLIST_COLUMNS: &str = "id, keywords, global_ban, ban_group_id";

/// Store with SQLite backend
pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let store = Self::from_connection(conn)?;

        info!("Chat store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS message (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                raw_message TEXT NOT NULL,
                plain_text TEXT NOT NULL,
                time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_message_group_time ON message(group_id, time DESC);
            CREATE INDEX IF NOT EXISTS idx_message_message_id ON message(message_id);

            CREATE TABLE IF NOT EXISTS context (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keywords TEXT NOT NULL,
                time INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_context_keywords ON context(keywords);

            CREATE TABLE IF NOT EXISTS answer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keywords TEXT NOT NULL,
                group_id INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 1,
                time INTEGER NOT NULL,
                messages TEXT NOT NULL DEFAULT '[]',
                context_id INTEGER REFERENCES context(id)
            );

            CREATE INDEX IF NOT EXISTS idx_answer_keywords ON answer(keywords);
            CREATE INDEX IF NOT EXISTS idx_answer_context ON answer(context_id, group_id);

            CREATE TABLE IF NOT EXISTS blacklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keywords TEXT NOT NULL,
                global_ban INTEGER NOT NULL DEFAULT 0,
                ban_group_id TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_blacklist_keywords ON blacklist(keywords);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persist a message, returning its row id
    pub async fn insert_message(&self, message: &mut ChatMessage) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO message (group_id, user_id, message_id, message, raw_message, plain_text, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.group_id,
                message.user_id,
                message.message_id,
                message.message,
                message.raw_message,
                message.plain_text,
                message.time
            ],
        )?;
        message.id = conn.last_insert_rowid();
        Ok(message.id)
    }

    /// Most recent message with a platform id
    pub async fn message_by_platform_id(&self, message_id: i64) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE message_id = ?1
             ORDER BY time DESC, id DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![message_id], message_from_row)
            .optional()?)
    }

    pub async fn message_by_id(&self, id: i64) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], message_from_row).optional()?)
    }

    /// Newest-first messages of a group at or after `since`
    pub async fn recent_messages(
        &self,
        group_id: i64,
        since: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE group_id = ?1 AND time >= ?2
             ORDER BY time DESC, id DESC LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![group_id, since, limit as i64], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All newest-first messages of a group at or after `since`
    pub async fn messages_since(&self, group_id: i64, since: i64) -> Result<Vec<ChatMessage>> {
        self.recent_messages(group_id, since, i64::MAX as usize).await
    }

    /// Latest message a user sent in a group
    pub async fn last_message_from(&self, group_id: i64, user_id: i64) -> Result<Option<ChatMessage>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE group_id = ?1 AND user_id = ?2
             ORDER BY time DESC, id DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![group_id, user_id], message_from_row)
            .optional()?)
    }

    /// Whether `user_id` sent `text` among the newest `window` group messages since `since`
    pub async fn sent_recently(
        &self,
        group_id: i64,
        user_id: i64,
        text: &str,
        since: i64,
        window: usize,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM (
                    SELECT user_id, message FROM message
                    WHERE group_id = ?1 AND time >= ?2
                    ORDER BY time DESC, id DESC LIMIT ?3
                ) WHERE user_id = ?4 AND message = ?5
             )",
            params![group_id, since, window as i64, user_id, text],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Groups with at least `min_count` messages since `since`, by group id
    pub async fn active_groups(&self, since: i64, min_count: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT group_id FROM message WHERE time >= ?1
             GROUP BY group_id HAVING COUNT(id) >= ?2
             ORDER BY group_id",
        )?;
        let rows = stmt.query_map(params![since, min_count as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub async fn list_messages(
        &self,
        filter: &MessageFilter,
        query: &PageQuery,
    ) -> Result<Page<ChatMessage>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        for (column, needle) in [
            ("CAST(group_id AS TEXT)", &filter.group_id),
            ("CAST(user_id AS TEXT)", &filter.user_id),
            ("raw_message", &filter.text),
        ] {
            if let Some(needle) = needle.as_deref().filter(|n| !n.is_empty()) {
                clauses.push(format!("{column} LIKE ?"));
                values.push(Value::Text(like_pattern(needle)));
            }
        }
        let order = query.order_clause(&["time", "group_id", "user_id", "id"], "time");
        self.paged("message", MESSAGE_COLUMNS, &clauses, values, &order, query, message_from_row)
            .await
    }

    pub async fn delete_message(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM message WHERE id = ?1", params![id])? > 0)
    }

    pub async fn delete_all_messages(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM message", [])?)
    }

    /// Retention cleanup
    pub async fn delete_messages_before(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM message WHERE time < ?1", params![before])?;
        debug!("Purged {} messages older than {}", deleted, before);
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Newest context with a signature
    pub async fn context_by_keywords(&self, keywords: &str) -> Result<Option<ChatContext>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM context WHERE keywords = ?1
             ORDER BY time DESC, id DESC LIMIT 1"
        );
        Ok(conn.query_row(&sql, params![keywords], context_from_row).optional()?)
    }

    pub async fn context_by_id(&self, id: i64) -> Result<Option<ChatContext>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {CONTEXT_COLUMNS} FROM context WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], context_from_row).optional()?)
    }

    /// Contexts reinforced at least `min_count` times, newest first
    pub async fn contexts_with_min_count(&self, min_count: i64) -> Result<Vec<ChatContext>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM context WHERE count >= ?1 ORDER BY time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![min_count], context_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert or update
    pub async fn save_context(&self, context: &mut ChatContext) -> Result<()> {
        let conn = self.conn.lock().await;
        if context.id == 0 {
            conn.execute(
                "INSERT INTO context (keywords, time, count) VALUES (?1, ?2, ?3)",
                params![context.keywords, context.time, context.count],
            )?;
            context.id = conn.last_insert_rowid();
        } else {
            conn.execute(
                "UPDATE context SET keywords = ?1, time = ?2, count = ?3 WHERE id = ?4",
                params![context.keywords, context.time, context.count, context.id],
            )?;
        }
        Ok(())
    }

    /// Delete every context with a signature, and their answers
    pub async fn delete_contexts_by_keywords(&self, keywords: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM answer WHERE context_id IN (SELECT id FROM context WHERE keywords = ?1)",
            params![keywords],
        )?;
        Ok(conn.execute("DELETE FROM context WHERE keywords = ?1", params![keywords])?)
    }

    /// Delete one context and its answers
    pub async fn delete_context(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM answer WHERE context_id = ?1", params![id])?;
        Ok(conn.execute("DELETE FROM context WHERE id = ?1", params![id])? > 0)
    }

    /// Delete all contexts and every answer owned by one
    pub async fn delete_all_contexts(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM answer WHERE context_id IS NOT NULL", [])?;
        Ok(conn.execute("DELETE FROM context", [])?)
    }

    pub async fn list_contexts(
        &self,
        keywords: Option<&str>,
        query: &PageQuery,
    ) -> Result<Page<ChatContext>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(needle) = keywords.filter(|k| !k.is_empty()) {
            clauses.push("keywords LIKE ?".to_string());
            values.push(Value::Text(like_pattern(needle)));
        }
        let order = query.order_clause(&["time", "count", "keywords", "id"], "time");
        self.paged("context", CONTEXT_COLUMNS, &clauses, values, &order, query, context_from_row)
            .await
    }

    /// Lower every context and answer count above `max` to `max`
    pub async fn clamp_counts(&self, max: i64) -> Result<(usize, usize)> {
        let conn = self.conn.lock().await;
        let contexts = conn.execute(
            "UPDATE context SET count = ?1 WHERE count > ?1",
            params![max],
        )?;
        let answers = conn.execute(
            "UPDATE answer SET count = ?1 WHERE count > ?1",
            params![max],
        )?;
        Ok((contexts, answers))
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    /// Answer bundle for (context, group, response signature)
    pub async fn find_answer(
        &self,
        context_id: i64,
        group_id: i64,
        keywords: &str,
    ) -> Result<Option<ChatAnswer>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ANSWER_COLUMNS} FROM answer
             WHERE context_id = ?1 AND group_id = ?2 AND keywords = ?3
             ORDER BY time DESC, id DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, params![context_id, group_id, keywords], answer_from_row)
            .optional()?)
    }

    pub async fn answer_by_id(&self, id: i64) -> Result<Option<ChatAnswer>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {ANSWER_COLUMNS} FROM answer WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], answer_from_row).optional()?)
    }

    /// Answers of a context with `count >= min_count`, optionally one group only
    pub async fn answers_for_context(
        &self,
        context_id: i64,
        min_count: i64,
        group_id: Option<i64>,
    ) -> Result<Vec<ChatAnswer>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ANSWER_COLUMNS} FROM answer
             WHERE context_id = ?1 AND count >= ?2 AND (?3 IS NULL OR group_id = ?3)
             ORDER BY time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![context_id, min_count, group_id], answer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Answers of a context with `count >= min_count` whose signature is
    /// learned in at least `min_groups` distinct groups
    pub async fn cross_group_answers(
        &self,
        context_id: i64,
        min_count: i64,
        min_groups: i64,
    ) -> Result<Vec<ChatAnswer>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {ANSWER_COLUMNS} FROM answer
             WHERE context_id = ?1 AND count >= ?2 AND keywords IN (
                SELECT keywords FROM answer GROUP BY keywords
                HAVING COUNT(DISTINCT group_id) >= ?3
             )
             ORDER BY time DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![context_id, min_count, min_groups], answer_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Signatures learned as answers in at least `min_groups` distinct groups
    pub async fn cross_group_keywords(&self, min_groups: i64) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT keywords FROM answer GROUP BY keywords HAVING COUNT(DISTINCT group_id) >= ?1",
        )?;
        let rows = stmt.query_map(params![min_groups], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<String>>>()?)
    }

    /// Insert or update
    pub async fn save_answer(&self, answer: &mut ChatAnswer) -> Result<()> {
        let messages = serde_json::to_string(&answer.messages)?;
        let conn = self.conn.lock().await;
        if answer.id == 0 {
            conn.execute(
                "INSERT INTO answer (keywords, group_id, count, time, messages, context_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    answer.keywords,
                    answer.group_id,
                    answer.count,
                    answer.time,
                    messages,
                    answer.context_id
                ],
            )?;
            answer.id = conn.last_insert_rowid();
        } else {
            conn.execute(
                "UPDATE answer SET keywords = ?1, group_id = ?2, count = ?3, time = ?4,
                 messages = ?5, context_id = ?6 WHERE id = ?7",
                params![
                    answer.keywords,
                    answer.group_id,
                    answer.count,
                    answer.time,
                    messages,
                    answer.context_id,
                    answer.id
                ],
            )?;
        }
        Ok(())
    }

    /// Delete answers with a signature, everywhere or in one group
    pub async fn delete_answers_by_keywords(
        &self,
        keywords: &str,
        group_id: Option<i64>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(
            "DELETE FROM answer WHERE keywords = ?1 AND (?2 IS NULL OR group_id = ?2)",
            params![keywords, group_id],
        )?)
    }

    pub async fn delete_answer(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM answer WHERE id = ?1", params![id])? > 0)
    }

    pub async fn delete_answers_for_context(&self, context_id: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM answer WHERE context_id = ?1", params![context_id])?)
    }

    pub async fn delete_all_answers(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM answer", [])?)
    }

    pub async fn list_answers(
        &self,
        filter: &AnswerFilter,
        query: &PageQuery,
    ) -> Result<Page<ChatAnswer>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(context_id) = filter.context_id {
            clauses.push("context_id = ?".to_string());
            values.push(Value::Integer(context_id));
        }
        if let Some(needle) = filter.keywords.as_deref().filter(|k| !k.is_empty()) {
            clauses.push("keywords LIKE ?".to_string());
            values.push(Value::Text(like_pattern(needle)));
        }
        let order = query.order_clause(&["count", "time", "group_id", "keywords", "id"], "count");
        self.paged("answer", ANSWER_COLUMNS, &clauses, values, &order, query, answer_from_row)
            .await
    }

    // ------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------

    pub async fn blacklist_by_keywords(&self, keywords: &str) -> Result<Option<BlacklistEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {BLACKLIST_COLUMNS} FROM blacklist WHERE keywords = ?1 ORDER BY id LIMIT 1"
        );
        Ok(conn.query_row(&sql, params![keywords], blacklist_from_row).optional()?)
    }

    /// Insert or update
    pub async fn save_blacklist(&self, entry: &mut BlacklistEntry) -> Result<()> {
        let groups = serde_json::to_string(&entry.ban_group_id)?;
        let conn = self.conn.lock().await;
        if entry.id == 0 {
            conn.execute(
                "INSERT INTO blacklist (keywords, global_ban, ban_group_id) VALUES (?1, ?2, ?3)",
                params![entry.keywords, entry.global_ban, groups],
            )?;
            entry.id = conn.last_insert_rowid();
        } else {
            conn.execute(
                "UPDATE blacklist SET keywords = ?1, global_ban = ?2, ban_group_id = ?3 WHERE id = ?4",
                params![entry.keywords, entry.global_ban, groups, entry.id],
            )?;
        }
        Ok(())
    }

    pub async fn delete_blacklist(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM blacklist WHERE id = ?1", params![id])? > 0)
    }

    pub async fn delete_all_blacklist(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM blacklist", [])?)
    }

    /// Blacklist page. `scope` matches the scope label: "global" or the
    /// first banning group.
    pub async fn list_blacklist(
        &self,
        keywords: Option<&str>,
        scope: Option<&str>,
        query: &PageQuery,
    ) -> Result<Page<BlacklistEntry>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(needle) = keywords.filter(|k| !k.is_empty()) {
            clauses.push("keywords LIKE ?".to_string());
            values.push(Value::Text(like_pattern(needle)));
        }
        if let Some(needle) = scope.filter(|s| !s.is_empty()) {
            clauses.push(
                "(CASE WHEN global_ban THEN 'global' \
                 ELSE COALESCE(CAST(json_extract(ban_group_id, '$[0]') AS TEXT), '') END) LIKE ?"
                    .to_string(),
            );
            values.push(Value::Text(like_pattern(needle)));
        }
        let order = query.order_clause(&["keywords", "id"], "id");
        self.paged("blacklist", BLACKLIST_COLUMNS, &clauses, values, &order, query, blacklist_from_row)
            .await
    }

    // ------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn paged<T, F>(
        &self,
        table: &str,
        columns: &str,
        clauses: &[String],
        values: Vec<Value>,
        order: &str,
        query: &PageQuery,
        map: F,
    ) -> Result<Page<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().await;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {columns} FROM {table} {where_sql} {order} LIMIT {} OFFSET {}",
            query.per_page,
            query.offset()
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), map)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total as usize,
        })
    }
}

fn like_pattern(needle: &str) -> String {
    format!("%{}%", needle.replace('%', "").replace('_', ""))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage::from_parts(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<ChatContext> {
    Ok(ChatContext {
        id: row.get(0)?,
        keywords: row.get(1)?,
        time: row.get(2)?,
        count: row.get(3)?,
    })
}

fn answer_from_row(row: &Row<'_>) -> rusqlite::Result<ChatAnswer> {
    let messages: String = row.get(5)?;
    Ok(ChatAnswer {
        id: row.get(0)?,
        keywords: row.get(1)?,
        group_id: row.get(2)?,
        count: row.get(3)?,
        time: row.get(4)?,
        messages: json_column(5, &messages)?,
        context_id: row.get(6)?,
    })
}

fn blacklist_from_row(row: &Row<'_>) -> rusqlite::Result<BlacklistEntry> {
    let groups: String = row.get(3)?;
    Ok(BlacklistEntry {
        id: row.get(0)?,
        keywords: row.get(1)?,
        global_ban: row.get(2)?,
        ban_group_id: json_column(3, &groups)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(index: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(group: i64, user: i64, id: i64, text: &str, time: i64) -> ChatMessage {
        ChatMessage::new(group, user, id, text, text, time)
    }

    #[tokio::test]
    async fn test_recent_messages_newest_first() {
        let store = ChatStore::open_in_memory().unwrap();
        for (i, t) in [100, 200, 300].iter().enumerate() {
            store.insert_message(&mut msg(1, 10, i as i64, "hi", *t)).await.unwrap();
        }
        store.insert_message(&mut msg(2, 10, 9, "other", 400)).await.unwrap();

        let recent = store.recent_messages(1, 150, 5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].time, 300);
        assert_eq!(recent[1].time, 200);
    }

    #[tokio::test]
    async fn test_context_answer_roundtrip() {
        let store = ChatStore::open_in_memory().unwrap();
        let mut context = ChatContext::new("weather today", 10);
        store.save_context(&mut context).await.unwrap();
        assert!(context.id > 0);

        let mut answer = ChatAnswer::new("sunny warm", 1, 10, context.id, "sunny and warm");
        store.save_answer(&mut answer).await.unwrap();

        answer.count = 2;
        answer.messages.push("warm and sunny".into());
        store.save_answer(&mut answer).await.unwrap();

        let found = store
            .find_answer(context.id, 1, "sunny warm")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.count, 2);
        assert_eq!(found.messages.len(), 2);
        assert_eq!(found.context_id, Some(context.id));
    }

    #[tokio::test]
    async fn test_delete_context_cascades_answers() {
        let store = ChatStore::open_in_memory().unwrap();
        let mut context = ChatContext::new("a b", 10);
        store.save_context(&mut context).await.unwrap();
        store
            .save_answer(&mut ChatAnswer::new("c d", 1, 10, context.id, "c d"))
            .await
            .unwrap();

        assert_eq!(store.delete_contexts_by_keywords("a b").await.unwrap(), 1);
        assert!(store.context_by_keywords("a b").await.unwrap().is_none());
        let page = store
            .list_answers(&AnswerFilter::default(), &PageQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_cross_group_counts_distinct_groups() {
        let store = ChatStore::open_in_memory().unwrap();
        let mut context = ChatContext::new("x y", 10);
        store.save_context(&mut context).await.unwrap();
        let mut other = ChatContext::new("z w", 10);
        store.save_context(&mut other).await.unwrap();

        // Same group twice under different contexts: still one group
        store.save_answer(&mut ChatAnswer::new("hello", 1, 10, context.id, "hello")).await.unwrap();
        store.save_answer(&mut ChatAnswer::new("hello", 1, 10, other.id, "hello")).await.unwrap();
        assert!(store.cross_group_answers(context.id, 1, 2).await.unwrap().is_empty());

        store.save_answer(&mut ChatAnswer::new("hello", 2, 10, other.id, "hello")).await.unwrap();
        let cross = store.cross_group_answers(context.id, 1, 2).await.unwrap();
        assert_eq!(cross.len(), 1);
        assert!(store.cross_group_keywords(2).await.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_active_groups_and_sent_recently() {
        let store = ChatStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.insert_message(&mut msg(1, 10, i, "x", 100 + i)).await.unwrap();
        }
        store.insert_message(&mut msg(2, 10, 50, "x", 100)).await.unwrap();
        assert_eq!(store.active_groups(0, 3).await.unwrap(), vec![1]);

        store
            .insert_message(&mut ChatMessage::outbound(1, 99, 60, "echo", 200))
            .await
            .unwrap();
        assert!(store.sent_recently(1, 99, "echo", 0, 5).await.unwrap());
        assert!(!store.sent_recently(1, 99, "other", 0, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklist_and_paging() {
        let store = ChatStore::open_in_memory().unwrap();
        let mut entry = BlacklistEntry::new("bad words", vec![1], false);
        store.save_blacklist(&mut entry).await.unwrap();
        entry.ban_group_id.push(2);
        entry.global_ban = true;
        store.save_blacklist(&mut entry).await.unwrap();

        let loaded = store.blacklist_by_keywords("bad words").await.unwrap().unwrap();
        assert!(loaded.global_ban);
        assert_eq!(loaded.ban_group_id, vec![1, 2]);
        assert_eq!(loaded.scope_label(), "global");

        for i in 0..25 {
            store.insert_message(&mut msg(7, i, i, "page me", i)).await.unwrap();
        }
        let query = PageQuery {
            page: 3,
            per_page: 10,
            ..Default::default()
        };
        let page = store.list_messages(&MessageFilter::default(), &query).await.unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 5);
    }

    #[tokio::test]
    async fn test_blacklist_scope_counts_every_page() {
        let store = ChatStore::open_in_memory().unwrap();
        for i in 0..12 {
            let mut entry = BlacklistEntry::new(&format!("local {i}"), vec![100, 7], false);
            store.save_blacklist(&mut entry).await.unwrap();
        }
        store
            .save_blacklist(&mut BlacklistEntry::new("other group", vec![200], false))
            .await
            .unwrap();
        store
            .save_blacklist(&mut BlacklistEntry::new("everywhere", vec![100], true))
            .await
            .unwrap();

        let query = PageQuery {
            per_page: 5,
            ..Default::default()
        };
        let local = store.list_blacklist(None, Some("100"), &query).await.unwrap();
        assert_eq!(local.total, 12);
        assert_eq!(local.items.len(), 5);
        assert!(local.items.iter().all(|e| e.scope_label() == "100"));

        let global = store.list_blacklist(None, Some("global"), &query).await.unwrap();
        assert_eq!(global.total, 1);
        assert_eq!(global.items[0].keywords, "everywhere");

        let all = store.list_blacklist(None, None, &query).await.unwrap();
        assert_eq!(all.total, 14);
    }

    #[tokio::test]
    async fn test_clamp_and_retention() {
        let store = ChatStore::open_in_memory().unwrap();
        let mut context = ChatContext::new("a b", 10);
        context.count = 9;
        store.save_context(&mut context).await.unwrap();
        let (contexts, answers) = store.clamp_counts(6).await.unwrap();
        assert_eq!((contexts, answers), (1, 0));
        assert_eq!(store.context_by_id(context.id).await.unwrap().unwrap().count, 6);

        store.insert_message(&mut msg(1, 1, 1, "old", 10)).await.unwrap();
        store.insert_message(&mut msg(1, 1, 2, "new", 1000)).await.unwrap();
        assert_eq!(store.delete_messages_before(500).await.unwrap(), 1);
    }
}
