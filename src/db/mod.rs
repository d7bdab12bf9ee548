pub mod models;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::functions::{auto_reply::AutoReply, LocalFunction, SEND_AUTO_REPLY};
use crate::platform::{
    ByteStream, ChangeEvent, ChangeFeed, ChangeKind, ChannelSpec, FilterOp, Platform, Query,
    Session,
};
use models::*;

struct LocalChannel {
    id: u64,
    spec: ChannelSpec,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

type Channels = Arc<Mutex<Vec<LocalChannel>>>;

/// Local backend: the platform's tables kept as JSON documents in SQLite,
/// with an in-process change feed and locally mounted functions.
pub struct Database {
    conn: Mutex<Connection>,
    session: Mutex<Option<Session>>,
    channels: Channels,
    functions: Mutex<HashMap<String, Arc<dyn LocalFunction>>>,
    clock: Mutex<DateTime<Utc>>,
    next_channel: AtomicU64,
}

impl Database {
    pub fn new(app_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(app_dir).map_err(|e| {
            Error::Config(format!("cannot create {}: {}", app_dir.display(), e))
        })?;
        let db_path = app_dir.join("whatsmind.db");
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            session: Mutex::new(None),
            channels: Arc::new(Mutex::new(Vec::new())),
            functions: Mutex::new(HashMap::new()),
            clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            next_channel: AtomicU64::new(1),
        };
        db.migrate()?;
        db.register_function(SEND_AUTO_REPLY, AutoReply)?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS rows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                UNIQUE (tbl, id)
            );

            CREATE INDEX IF NOT EXISTS idx_rows_tbl ON rows(tbl);

            CREATE UNIQUE INDEX IF NOT EXISTS ux_membership
                ON rows(json_extract(data, '$.user_id'), json_extract(data, '$.conversation_id'))
                WHERE tbl = 'user_conversations';

            CREATE UNIQUE INDEX IF NOT EXISTS ux_profile
                ON rows(json_extract(data, '$.user_id'))
                WHERE tbl = 'profiles';
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    // ── Session ──

    pub fn sign_in_as(&self, user_id: &str) -> Result<Session> {
        let session = Session {
            user_id: user_id.to_string(),
            access_token: format!("local-{}", uuid::Uuid::new_v4()),
        };
        *self.session.lock().map_err(|_| Error::Poisoned)? = Some(session.clone());
        Ok(session)
    }

    pub fn sign_out(&self) -> Result<()> {
        *self.session.lock().map_err(|_| Error::Poisoned)? = None;
        Ok(())
    }

    // ── Functions ──

    pub fn register_function(
        &self,
        name: &str,
        function: impl LocalFunction + 'static,
    ) -> Result<()> {
        self.functions
            .lock()
            .map_err(|_| Error::Poisoned)?
            .insert(name.to_string(), Arc::new(function));
        Ok(())
    }

    /// Strictly increasing within this backend, so rows written back to back
    /// never share a timestamp.
    fn stamp(&self) -> Result<String> {
        let mut last = self.clock.lock().map_err(|_| Error::Poisoned)?;
        let mut at = Utc::now().trunc_subsecs(6);
        if at <= *last {
            at = *last + Duration::microseconds(1);
        }
        *last = at;
        Ok(timestamp(at))
    }

    // ── Rows ──

    fn select_rows(&self, query: &Query) -> Result<Vec<Value>> {
        let (where_sql, mut args) = where_clause(query);
        let mut sql = format!("SELECT data FROM rows WHERE {}", where_sql);

        let mut order_terms = Vec::new();
        for order in &query.order {
            order_terms.push(format!(
                "json_extract(data, ?) {}",
                if order.ascending { "ASC" } else { "DESC" }
            ));
            args.push(SqlValue::Text(json_path(&order.column)));
        }
        let seq_dir = match query.order.last() {
            Some(order) if !order.ascending => "DESC",
            _ => "ASC",
        };
        order_terms.push(format!("seq {}", seq_dir));
        sql.push_str(&format!(" ORDER BY {}", order_terms.join(", ")));

        if query.limit.is_some() || query.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
            let clamp = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
            args.push(SqlValue::Integer(query.limit.map(clamp).unwrap_or(-1)));
            args.push(SqlValue::Integer(query.offset.map(clamp).unwrap_or(0)));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(serde_json::from_str(&data?)?);
        }
        Ok(out)
    }

    fn count_rows(&self, query: &Query) -> Result<usize> {
        let (where_sql, args) = where_clause(query);
        let sql = format!("SELECT COUNT(*) FROM rows WHERE {}", where_sql);
        let conn = self.conn()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    fn matching(&self, conn: &Connection, query: &Query) -> Result<Vec<(i64, Value)>> {
        let (where_sql, args) = where_clause(query);
        let sql = format!("SELECT seq, data FROM rows WHERE {} ORDER BY seq", where_sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, data) = row?;
            out.push((seq, serde_json::from_str(&data)?));
        }
        Ok(out)
    }

    fn insert_rows(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let Value::Object(mut map) = row else {
                return Err(bad_request("insert payload must be an object"));
            };
            let now = self.stamp()?;
            let defaults = column_defaults(table, &now)
                .ok_or_else(|| bad_request(&format!("unknown table: {}", table)))?;
            for (column, value) in defaults {
                map.entry(column.to_string()).or_insert(value);
            }
            map.entry("id".to_string())
                .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
            stored.push(Value::Object(map));
        }

        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for row in &stored {
                let id = row.get("id").and_then(Value::as_str).unwrap_or_default();
                tx.execute(
                    "INSERT INTO rows (tbl, id, data) VALUES (?1, ?2, ?3)",
                    params![table, id, row.to_string()],
                )
                .map_err(conflict)?;
            }
            tx.commit()?;
        }

        debug!(table, count = stored.len(), "inserted rows");
        for row in &stored {
            self.dispatch(table, ChangeKind::Insert, Some(row.clone()), None);
        }
        Ok(stored)
    }

    fn update_rows(&self, query: &Query, patch: Value) -> Result<Vec<Value>> {
        let Value::Object(patch) = patch else {
            return Err(bad_request("update payload must be an object"));
        };
        let now = self.stamp()?;
        let mut changes = Vec::new();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for (seq, old) in self.matching(&tx, query)? {
                let mut new = old.clone();
                if let Value::Object(map) = &mut new {
                    for (column, value) in &patch {
                        map.insert(column.clone(), value.clone());
                    }
                    if map.contains_key("updated_at") && !patch.contains_key("updated_at") {
                        map.insert("updated_at".to_string(), Value::String(now.clone()));
                    }
                }
                tx.execute(
                    "UPDATE rows SET data = ?1 WHERE seq = ?2",
                    params![new.to_string(), seq],
                )
                .map_err(conflict)?;
                changes.push((old, new));
            }
            tx.commit()?;
        }

        let mut updated = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            self.dispatch(&query.table, ChangeKind::Update, Some(new.clone()), Some(old));
            updated.push(new);
        }
        Ok(updated)
    }

    fn delete_rows(&self, query: &Query) -> Result<usize> {
        let removed = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let removed = self.matching(&tx, query)?;
            for (seq, _) in &removed {
                tx.execute("DELETE FROM rows WHERE seq = ?1", params![seq])?;
            }
            tx.commit()?;
            removed
        };

        let count = removed.len();
        for (_, old) in removed {
            self.dispatch(&query.table, ChangeKind::Delete, None, Some(old));
        }
        Ok(count)
    }

    // ── Change feed ──

    fn dispatch(&self, table: &str, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        channels.retain(|channel| !channel.sender.is_closed());
        let event = ChangeEvent {
            table: table.to_string(),
            kind,
            new,
            old,
        };
        for channel in channels.iter() {
            if channel.spec.matches(table, kind, event.record()) {
                let _ = channel.sender.send(event.clone());
            }
        }
    }

    pub fn live_channels(&self) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Platform for Database {
    fn session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        self.select_rows(query)
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        self.count_rows(query)
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        self.insert_rows(table, rows)
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>> {
        self.update_rows(query, patch)
    }

    async fn delete(&self, query: &Query) -> Result<usize> {
        self.delete_rows(query)
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<ChangeFeed> {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let topic = spec.topic.clone();
        self.channels
            .lock()
            .map_err(|_| Error::Poisoned)?
            .push(LocalChannel { id, spec, sender });
        info!(topic = %topic, "local channel subscribed");

        let channels = Arc::downgrade(&self.channels);
        let released_topic = topic.clone();
        Ok(ChangeFeed::new(topic, receiver, move || {
            if let Some(channels) = channels.upgrade() {
                if let Ok(mut channels) = channels.lock() {
                    channels.retain(|channel| channel.id != id);
                }
            }
            info!(topic = %released_topic, "local channel released");
        }))
    }

    async fn invoke(&self, function: &str, body: Value) -> Result<ByteStream> {
        let handler = {
            let functions = self.functions.lock().map_err(|_| Error::Poisoned)?;
            functions.get(function).cloned()
        };
        let handler = handler.ok_or_else(|| Error::Function {
            status: 404,
            message: format!("Function not found: {}", function),
        })?;
        debug!(function, "invoking local function");
        handler.call(self, self.session(), body).await
    }
}

fn json_path(column: &str) -> String {
    format!("$.{}", column)
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn where_clause(query: &Query) -> (String, Vec<SqlValue>) {
    let mut terms = vec!["tbl = ?".to_string()];
    let mut args = vec![SqlValue::Text(query.table.clone())];
    for filter in &query.filters {
        let column = "json_extract(data, ?)";
        args.push(SqlValue::Text(json_path(&filter.column)));
        let term = match &filter.op {
            FilterOp::Eq(Value::Null) | FilterOp::IsNull => format!("{} IS NULL", column),
            FilterOp::Eq(value) => {
                args.push(sql_value(value));
                format!("{} = ?", column)
            }
            FilterOp::Neq(value) => {
                args.push(sql_value(value));
                format!("{} <> ?", column)
            }
            FilterOp::Gt(value) => {
                args.push(sql_value(value));
                format!("{} > ?", column)
            }
            FilterOp::Gte(value) => {
                args.push(sql_value(value));
                format!("{} >= ?", column)
            }
            FilterOp::Lt(value) => {
                args.push(sql_value(value));
                format!("{} < ?", column)
            }
            FilterOp::In(values) if values.is_empty() => format!("({} IS NULL) AND 0", column),
            FilterOp::In(values) => {
                args.extend(values.iter().map(sql_value));
                let marks = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", column, marks)
            }
            FilterOp::ILike(pattern) => {
                args.push(SqlValue::Text(pattern.clone()));
                format!("{} LIKE ? ESCAPE '\\'", column)
            }
        };
        terms.push(term);
    }
    (terms.join(" AND "), args)
}

fn column_defaults(table: &str, now: &str) -> Option<Vec<(&'static str, Value)>> {
    let defaults = match table {
        CONVERSATIONS => vec![
            ("name", Value::Null),
            ("is_group", json!(false)),
            ("avatar_url", Value::Null),
            ("category", json!("other")),
            ("created_by", Value::Null),
            ("created_at", json!(now)),
            ("updated_at", json!(now)),
        ],
        USER_CONVERSATIONS => vec![
            ("is_pinned", json!(false)),
            ("last_read_at", Value::Null),
            ("joined_at", json!(now)),
        ],
        MESSAGES => vec![
            ("content", Value::Null),
            ("message_type", json!("text")),
            ("file_url", Value::Null),
            ("file_name", Value::Null),
            ("voice_duration", Value::Null),
            ("created_at", json!(now)),
            ("updated_at", json!(now)),
        ],
        TASKS => vec![
            ("description", Value::Null),
            ("priority", json!("medium")),
            ("category_id", Value::Null),
            ("due_date", Value::Null),
            ("is_completed", json!(false)),
            ("completed_at", Value::Null),
            ("created_from_message_id", Value::Null),
            ("created_at", json!(now)),
            ("updated_at", json!(now)),
        ],
        CATEGORIES => vec![("color", json!("#8b5cf6")), ("created_at", json!(now))],
        PROFILES => vec![
            ("display_name", Value::Null),
            ("username", Value::Null),
            ("avatar_url", Value::Null),
            ("bio", Value::Null),
            ("phone_number", Value::Null),
            ("notification_preferences", Value::Object(Map::new())),
            ("app_preferences", Value::Object(Map::new())),
            ("created_at", json!(now)),
            ("updated_at", json!(now)),
        ],
        FOCUS_SESSIONS => vec![
            ("task_id", Value::Null),
            ("completed_at", json!(now)),
            ("created_at", json!(now)),
        ],
        NOTIFICATIONS => vec![
            ("message", Value::Null),
            ("is_read", json!(false)),
            ("created_at", json!(now)),
        ],
        _ => return None,
    };
    Some(defaults)
}

fn bad_request(message: &str) -> Error {
    Error::Api {
        status: 400,
        message: message.to_string(),
    }
}

fn conflict(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(
                message
                    .clone()
                    .unwrap_or_else(|| "duplicate key value".to_string()),
            )
        }
        _ => Error::Database(err),
    }
}
