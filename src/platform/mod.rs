pub mod rest;
pub mod socket;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Streamed response body of a serverless function.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

/// The hosted backend as seen by this client: row storage, change feeds and
/// serverless functions. Implemented by [`rest::RestPlatform`] and by the
/// local SQLite backend in [`crate::db`].
#[async_trait]
pub trait Platform: Send + Sync {
    fn session(&self) -> Option<Session>;

    async fn select(&self, query: &Query) -> Result<Vec<Value>>;

    async fn count(&self, query: &Query) -> Result<usize>;

    /// Inserts rows and returns them as stored, defaults filled in.
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>>;

    /// Applies `patch` to every row matching `query` and returns the new rows.
    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>>;

    async fn delete(&self, query: &Query) -> Result<usize>;

    async fn subscribe(&self, spec: ChannelSpec) -> Result<ChangeFeed>;

    async fn invoke(&self, function: &str, body: Value) -> Result<ByteStream>;
}

/// Fails before any remote call when nobody is signed in.
pub fn require_session(platform: &dyn Platform) -> Result<Session> {
    platform.session().ok_or(Error::NotAuthenticated)
}

pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Error::from))
        .collect()
}

/// Decodes exactly one row, as a `.single()` select would.
pub fn decode_single<T: DeserializeOwned>(rows: Vec<Value>, what: &str) -> Result<T> {
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(what.to_string()))?;
    Ok(serde_json::from_value(row)?)
}

/// Serializes a payload and merges extra columns into it.
pub fn to_row<T: Serialize>(payload: &T, extra: &[(&str, Value)]) -> Result<Value> {
    let mut row = serde_json::to_value(payload)?;
    if let Value::Object(map) = &mut row {
        for (column, value) in extra {
            map.insert((*column).to_string(), value.clone());
        }
    }
    Ok(row)
}

// ── Queries ──

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Neq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    In(Vec<Value>),
    /// Case-insensitive match. `%` and `_` are wildcards and `\` makes the
    /// next character literal.
    ILike(String),
    IsNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    fn filter(mut self, column: &str, op: FilterOp) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
        });
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq(value.into()))
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Neq(value.into()))
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Gt(value.into()))
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Gte(value.into()))
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Lt(value.into()))
    }

    pub fn is_in<V: Into<Value>>(self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.filter(column, FilterOp::In(values))
    }

    pub fn ilike(self, column: &str, pattern: impl Into<String>) -> Self {
        self.filter(column, FilterOp::ILike(pattern.into()))
    }

    /// Case-insensitive substring match with `text` taken literally.
    pub fn contains(self, column: &str, text: &str) -> Self {
        self.ilike(column, format!("%{}%", escape_like(text)))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(column, FilterOp::IsNull)
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row range, like `.range(from, to)`.
    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from) + 1);
        self
    }
}

/// Escapes the `LIKE` metacharacters in `text`.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ── Change feeds ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// Which events a channel listens for; `None` means all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub topic: String,
    pub table: String,
    pub event: Option<ChangeKind>,
    /// `column = value` scope, rendered as `column=eq.value`.
    pub filter: Option<(String, String)>,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>, table: &str) -> Self {
        Self {
            topic: topic.into(),
            table: table.to_string(),
            event: None,
            filter: None,
        }
    }

    pub fn on(mut self, event: ChangeKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filter = Some((column.to_string(), value.into()));
        self
    }

    pub fn event_name(&self) -> &'static str {
        self.event.map(ChangeKind::as_str).unwrap_or("*")
    }

    pub fn filter_expr(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|(column, value)| format!("{}=eq.{}", column, value))
    }

    /// Whether a change to `table` of `kind` touching `record` belongs here.
    pub fn matches(&self, table: &str, kind: ChangeKind, record: Option<&Value>) -> bool {
        if self.table != table {
            return false;
        }
        if self.event.is_some_and(|event| event != kind) {
            return false;
        }
        match (&self.filter, record) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((column, expected)), Some(record)) => match record.get(column) {
                Some(Value::String(actual)) => actual == expected,
                Some(Value::Null) | None => false,
                Some(other) => other.to_string() == *expected,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// The row the event is about: the new row, or the old one for deletes.
    pub fn record(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// A live channel: the event receiver plus the action that closes it on the
/// backend. The release runs once, either explicitly or on drop.
pub struct ChangeFeed {
    pub topic: String,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeFeed {
    pub fn new(
        topic: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Moves the receiver out, leaving a closed one behind; the feed keeps
    /// ownership of the release.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (_, mut closed) = mpsc::unbounded_channel();
        closed.close();
        std::mem::replace(&mut self.events, closed)
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            self.events.close();
            release();
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("topic", &self.topic)
            .field("released", &self.release.is_none())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use axum::http::StatusCode;
    use axum::{Json, Router};
    use serde_json::Value;
    use tokio::net::TcpListener;

    /// Local HTTP server answering every request with `status` and a JSON
    /// `body`. Returns its base URL.
    pub async fn serve_status(status: u16, body: Value) -> String {
        let status = StatusCode::from_u16(status).unwrap();
        let app = Router::new().fallback(move || {
            let body = body.clone();
            async move { (status, Json(body)) }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", address)
    }
}
