use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use uuid::Uuid;

use quorum_types::{Message, MessageContent, MessageDraft, RECEIVER_BROADCAST};

use crate::error::{payload_head, LedgerError, LedgerResult};

/// Record selection for `query` / `find_last` / `count`. Time bounds are
/// epoch milliseconds; `since` is inclusive, `before` exclusive.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub topic: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub since: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl MessageFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::default()
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn before(mut self, before: i64) -> Self {
        self.before = Some(before);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse a filter out of a JSON object, as trigger logic and hook
    /// placeholders pass them. `since` accepts epoch millis or ISO-8601.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let Some(obj) = value.as_object() else {
            return Err(format!("filter must be an object, got {value}"));
        };
        let mut filter = MessageFilter::default();
        for (key, val) in obj {
            match key.as_str() {
                "topic" => filter.topic = Some(string_field(key, val)?),
                "sender" => filter.sender = Some(string_field(key, val)?),
                "receiver" => filter.receiver = Some(string_field(key, val)?),
                "since" => filter.since = Some(time_field(key, val)?),
                "before" => filter.before = Some(time_field(key, val)?),
                "limit" => {
                    filter.limit = Some(
                        val.as_u64()
                            .and_then(|v| u32::try_from(v).ok())
                            .ok_or_else(|| format!("`limit` must be a small integer, got {val}"))?,
                    )
                }
                other => return Err(format!("unknown filter key `{other}`")),
            }
        }
        Ok(filter)
    }
}

fn string_field(key: &str, value: &Value) -> Result<String, String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("`{key}` must be a string, got {value}"))
}

fn time_field(key: &str, value: &Value) -> Result<i64, String> {
    if let Some(ms) = value.as_i64() {
        return Ok(ms);
    }
    if let Some(raw) = value.as_str() {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc).timestamp_millis());
        }
    }
    Err(format!("`{key}` must be epoch millis or ISO-8601, got {value}"))
}

/// Append-only message log for one cluster, backed by a SQLite file at
/// `<state_dir>/<cluster_id>.db`.
pub struct Ledger {
    cluster_id: String,
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(state_dir: &Path, cluster_id: &str) -> LedgerResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let db_path = Self::db_file(state_dir, cluster_id);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // WAL for concurrent readers; PRAGMA journal_mode returns a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let ledger = Self {
            cluster_id: cluster_id.to_string(),
            db_path,
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        ledger.validate_integrity()?;
        Ok(ledger)
    }

    pub fn db_file(state_dir: &Path, cluster_id: &str) -> PathBuf {
        state_dir.join(format!("{cluster_id}.db"))
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> LedgerResult<()> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                topic TEXT NOT NULL,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                content_text TEXT,
                content_data TEXT,
                metadata TEXT,
                cluster_id TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_cluster_topic_time
             ON messages(cluster_id, topic, timestamp)",
            [],
        )?;
        Ok(())
    }

    fn validate_integrity(&self) -> LedgerResult<()> {
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let check: String = conn.query_row("PRAGMA quick_check(1)", [], |row| row.get(0))?;
        if check.trim().eq_ignore_ascii_case("ok") {
            return Ok(());
        }
        Err(LedgerError::Corrupt {
            id: self.cluster_id.clone(),
            column: "database".to_string(),
            detail: "integrity check failed".to_string(),
            payload_head: payload_head(&check),
        })
    }

    /// Assign identity and order to a draft and persist it. The stored
    /// timestamp is clamped so it never runs backwards within the ledger;
    /// the append counter breaks ties.
    pub fn append(&self, draft: MessageDraft) -> LedgerResult<Message> {
        let mut out = self.append_all(vec![draft])?;
        Ok(out.remove(0))
    }

    /// Append several drafts in one transaction. Readers observe either all
    /// of them or none; used by cluster-operations processing.
    pub fn append_all(&self, drafts: Vec<MessageDraft>) -> LedgerResult<Vec<Message>> {
        let mut conn = self.conn.lock().expect("ledger connection poisoned");
        let tx = conn.transaction()?;
        let (mut last_ts, mut last_seq): (i64, i64) = tx.query_row(
            "SELECT COALESCE(MAX(timestamp), 0), COALESCE(MAX(seq), 0) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stored = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let wall = Utc::now().timestamp_millis();
            last_ts = wall.max(last_ts);
            last_seq += 1;
            let message = Message {
                id: Uuid::new_v4().to_string(),
                seq: last_seq,
                timestamp: last_ts,
                cluster_id: draft.cluster_id,
                topic: draft.topic,
                sender: draft.sender,
                receiver: draft
                    .receiver
                    .unwrap_or_else(|| RECEIVER_BROADCAST.to_string()),
                content: draft.content,
                metadata: draft.metadata,
            };
            tx.execute(
                "INSERT INTO messages
                 (id, seq, timestamp, topic, sender, receiver,
                  content_text, content_data, metadata, cluster_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.seq,
                    message.timestamp,
                    message.topic,
                    message.sender,
                    message.receiver,
                    message.content.text,
                    message
                        .content
                        .data
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    if message.metadata.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&message.metadata)?)
                    },
                    message.cluster_id,
                ],
            )?;
            stored.push(message);
        }
        tx.commit()?;
        Ok(stored)
    }

    /// Matching records in ascending `(timestamp, seq)` order.
    pub fn query(&self, filter: &MessageFilter) -> LedgerResult<Vec<Message>> {
        let (where_sql, args) = build_where(&self.cluster_id, filter);
        let mut sql = format!(
            "SELECT id, seq, timestamp, topic, sender, receiver,
                    content_text, content_data, metadata, cluster_id
             FROM messages WHERE {where_sql} ORDER BY timestamp ASC, seq ASC"
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), parse_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// The newest matching record, or `None`.
    pub fn find_last(&self, filter: &MessageFilter) -> LedgerResult<Option<Message>> {
        let (where_sql, args) = build_where(&self.cluster_id, filter);
        let sql = format!(
            "SELECT id, seq, timestamp, topic, sender, receiver,
                    content_text, content_data, metadata, cluster_id
             FROM messages WHERE {where_sql} ORDER BY timestamp DESC, seq DESC LIMIT 1"
        );
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_row(rusqlite::params_from_iter(args), parse_row)
            .optional()?;
        found.transpose()
    }

    pub fn count(&self, filter: &MessageFilter) -> LedgerResult<u64> {
        let (where_sql, args) = build_where(&self.cluster_id, filter);
        let sql = format!("SELECT COUNT(*) FROM messages WHERE {where_sql}");
        let conn = self.conn.lock().expect("ledger connection poisoned");
        let count: i64 = conn.query_row(&sql, rusqlite::params_from_iter(args), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Flush and release the underlying connection.
    pub fn close(self) -> LedgerResult<()> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.close().map_err(|(_, err)| LedgerError::from(err))
    }

    /// Delete the ledger file for a cluster. The caller is responsible for
    /// closing any open handle first.
    pub fn purge(state_dir: &Path, cluster_id: &str) -> LedgerResult<()> {
        let db = Self::db_file(state_dir, cluster_id);
        for path in [
            db.clone(),
            db.with_extension("db-wal"),
            db.with_extension("db-shm"),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn build_where(cluster_id: &str, filter: &MessageFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["cluster_id = ?".to_string()];
    let mut args = vec![SqlValue::Text(cluster_id.to_string())];
    if let Some(topic) = &filter.topic {
        clauses.push("topic = ?".to_string());
        args.push(SqlValue::Text(topic.clone()));
    }
    if let Some(sender) = &filter.sender {
        clauses.push("sender = ?".to_string());
        args.push(SqlValue::Text(sender.clone()));
    }
    if let Some(receiver) = &filter.receiver {
        clauses.push("receiver = ?".to_string());
        args.push(SqlValue::Text(receiver.clone()));
    }
    if let Some(since) = filter.since {
        clauses.push("timestamp >= ?".to_string());
        args.push(SqlValue::Integer(since));
    }
    if let Some(before) = filter.before {
        clauses.push("timestamp < ?".to_string());
        args.push(SqlValue::Integer(before));
    }
    (clauses.join(" AND "), args)
}

fn parse_row(row: &Row<'_>) -> rusqlite::Result<LedgerResult<Message>> {
    let id: String = row.get(0)?;
    let content_text: Option<String> = row.get(6)?;
    let content_data: Option<String> = row.get(7)?;
    let metadata: Option<String> = row.get(8)?;

    let data = match content_data
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
    {
        Ok(data) => data,
        Err(err) => {
            return Ok(Err(LedgerError::Corrupt {
                id,
                column: "content_data".to_string(),
                detail: err.to_string(),
                payload_head: payload_head(content_data.as_deref().unwrap_or_default()),
            }))
        }
    };
    let metadata_map = match metadata
        .as_deref()
        .map(serde_json::from_str::<Map<String, Value>>)
        .transpose()
    {
        Ok(map) => map.unwrap_or_default(),
        Err(err) => {
            return Ok(Err(LedgerError::Corrupt {
                id,
                column: "metadata".to_string(),
                detail: err.to_string(),
                payload_head: payload_head(metadata.as_deref().unwrap_or_default()),
            }))
        }
    };

    Ok(Ok(Message {
        id,
        seq: row.get(1)?,
        timestamp: row.get(2)?,
        topic: row.get(3)?,
        sender: row.get(4)?,
        receiver: row.get(5)?,
        content: MessageContent {
            text: content_text,
            data,
        },
        metadata: metadata_map,
        cluster_id: row.get(9)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::topics;
    use serde_json::json;
    use tempfile::TempDir;

    fn draft(topic: &str, sender: &str) -> MessageDraft {
        MessageDraft::new("c-1", topic, sender)
    }

    #[test]
    fn append_assigns_monotonic_order() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let first = ledger.append(draft(topics::ISSUE_OPENED, "user")).unwrap();
        let second = ledger.append(draft(topics::TASK_STARTED, "worker")).unwrap();
        assert!(second.timestamp >= first.timestamp);
        assert!(second.seq > first.seq);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn append_is_visible_to_immediate_query() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let stored = ledger
            .append(
                draft(topics::VALIDATION_RESULT, "validator")
                    .content(MessageContent::data(json!({ "approved": false }))),
            )
            .unwrap();
        let found = ledger
            .query(&MessageFilter::topic(topics::VALIDATION_RESULT))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stored.id);
        assert_eq!(found[0].content.data, Some(json!({ "approved": false })));
    }

    #[test]
    fn query_filters_by_sender_and_since() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let a = ledger
            .append(draft(topics::VALIDATION_RESULT, "validator"))
            .unwrap();
        ledger.append(draft(topics::VALIDATION_RESULT, "other")).unwrap();
        let b = ledger
            .append(draft(topics::VALIDATION_RESULT, "validator"))
            .unwrap();

        let by_sender = ledger
            .query(&MessageFilter::topic(topics::VALIDATION_RESULT).sender("validator"))
            .unwrap();
        assert_eq!(by_sender.len(), 2);

        // since is inclusive on timestamp; use the seq tiebreak to ensure
        // both records are in range, then filter the earlier one out.
        let since_b = ledger
            .query(
                &MessageFilter::topic(topics::VALIDATION_RESULT)
                    .sender("validator")
                    .since(b.timestamp),
            )
            .unwrap();
        assert!(since_b.iter().any(|m| m.id == b.id));
        if b.timestamp > a.timestamp {
            assert!(since_b.iter().all(|m| m.id != a.id));
        }
    }

    #[test]
    fn find_last_returns_newest_match() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        ledger.append(draft(topics::TASK_COMPLETED, "worker")).unwrap();
        let last = ledger.append(draft(topics::TASK_COMPLETED, "worker")).unwrap();
        let found = ledger
            .find_last(&MessageFilter::topic(topics::TASK_COMPLETED))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, last.id);

        let none = ledger
            .find_last(&MessageFilter::topic("NO_SUCH_TOPIC"))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn count_matches_query_cardinality() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        for _ in 0..3 {
            ledger.append(draft(topics::TASK_STARTED, "worker")).unwrap();
        }
        assert_eq!(
            ledger
                .count(&MessageFilter::topic(topics::TASK_STARTED))
                .unwrap(),
            3
        );
        assert_eq!(
            ledger
                .count(&MessageFilter::topic(topics::TASK_STARTED).sender("other"))
                .unwrap(),
            0
        );
    }

    #[test]
    fn append_all_is_atomic_in_order() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let stored = ledger
            .append_all(vec![
                draft(topics::CLUSTER_OPERATIONS, "conductor"),
                draft(topics::ISSUE_OPENED, "system"),
            ])
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[1].seq > stored[0].seq);
        let all = ledger.query(&MessageFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].topic, topics::CLUSTER_OPERATIONS);
    }

    #[test]
    fn corrupt_payload_is_fatal_with_diagnostic_head() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let stored = ledger.append(draft(topics::ISSUE_OPENED, "user")).unwrap();
        {
            let conn = ledger.conn.lock().unwrap();
            conn.execute(
                "UPDATE messages SET content_data = ?1 WHERE id = ?2",
                params!["{not json".repeat(40), stored.id],
            )
            .unwrap();
        }
        let err = ledger.query(&MessageFilter::default()).unwrap_err();
        match err {
            LedgerError::Corrupt { payload_head, .. } => {
                assert_eq!(payload_head.len(), 200);
                assert!(payload_head.starts_with("{not json"));
            }
            other => panic!("expected corruption error, got {other}"),
        }
    }

    #[test]
    fn filter_from_value_accepts_iso_and_millis() {
        let filter = MessageFilter::from_value(&json!({
            "topic": "VALIDATION_RESULT",
            "sender": "validator",
            "since": "2026-01-01T00:00:00Z",
            "limit": 5
        }))
        .unwrap();
        assert_eq!(filter.topic.as_deref(), Some("VALIDATION_RESULT"));
        assert!(filter.since.is_some());
        assert_eq!(filter.limit, Some(5));

        assert!(MessageFilter::from_value(&json!({ "bogus": 1 })).is_err());
        assert!(MessageFilter::from_value(&json!("nope")).is_err());
    }

    #[test]
    fn purge_removes_the_db_file() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path(), "c-1").unwrap();
        let path = ledger.db_path().to_path_buf();
        ledger.close().unwrap();
        assert!(path.exists());
        Ledger::purge(dir.path(), "c-1").unwrap();
        assert!(!path.exists());
    }
}
