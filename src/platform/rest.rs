use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::socket::{self, SocketConfig};
use super::{ByteStream, ChangeFeed, ChannelSpec, FilterOp, Platform, Query, Session};
use crate::error::{Error, Result};

/// The hosted backend: PostgREST tables, edge functions and the realtime
/// websocket under one project URL.
pub struct RestPlatform {
    http: Client,
    base_url: Url,
    anon_key: String,
    session: RwLock<Option<Session>>,
    heartbeat: Duration,
}

impl RestPlatform {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url.trim_end_matches('/'))?,
            anon_key: anon_key.to_string(),
            session: RwLock::new(None),
            heartbeat: Duration::from_secs(25),
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn set_session(&self, session: Option<Session>) -> Result<()> {
        *self.session.write().map_err(|_| Error::Poisoned)? = session;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.endpoint(&format!("/rest/v1/{}", table))
    }

    fn bearer(&self) -> String {
        self.session()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
    }
}

/// PostgREST query parameters for a [`Query`].
pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for filter in &query.filters {
        let value = match &filter.op {
            FilterOp::Eq(Value::Null) | FilterOp::IsNull => "is.null".to_string(),
            FilterOp::Eq(v) => format!("eq.{}", literal(v)),
            FilterOp::Neq(v) => format!("neq.{}", literal(v)),
            FilterOp::Gt(v) => format!("gt.{}", literal(v)),
            FilterOp::Gte(v) => format!("gte.{}", literal(v)),
            FilterOp::Lt(v) => format!("lt.{}", literal(v)),
            FilterOp::In(values) => {
                let items: Vec<String> = values.iter().map(quoted).collect();
                format!("in.({})", items.join(","))
            }
            FilterOp::ILike(pattern) => format!("ilike.{}", like_wildcards(pattern)),
        };
        params.push((filter.column.clone(), value));
    }
    if !query.order.is_empty() {
        let order: Vec<String> = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect();
        params.push(("order".to_string(), order.join(",")));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

/// Swaps unescaped `%` for PostgREST's `*`; escaped characters pass through
/// with their backslash. PostgREST reads every `*` as a wildcard.
fn like_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '%' => out.push('*'),
            _ => out.push(c),
        }
    }
    out
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quoted(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => other.to_string(),
    }
}

async fn api_error(resp: Response) -> Error {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| {
            body.get("message")
                .or_else(|| body.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(text);
    Error::Api { status, message }
}

/// Edge function failures: the `{error}` body text, with 429 and 402
/// surfaced as their own kinds.
async fn function_error(resp: Response) -> Error {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(message),
        StatusCode::PAYMENT_REQUIRED => Error::QuotaExceeded(message),
        _ => Error::Function {
            status: status.as_u16(),
            message,
        },
    }
}

/// Parses the total out of a `Content-Range: 0-24/3573` header.
pub fn content_range_total(header: &str) -> Option<usize> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Platform for RestPlatform {
    fn session(&self) -> Option<Session> {
        self.session.read().ok().and_then(|session| session.clone())
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        debug!(table = %query.table, "select");
        let req = self
            .http
            .get(self.table_url(&query.table)?)
            .query(&[("select", "*")])
            .query(&query_params(query));
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn count(&self, query: &Query) -> Result<usize> {
        debug!(table = %query.table, "count");
        let mut counted = query.clone();
        counted.order.clear();
        counted.limit = None;
        counted.offset = None;
        let req = self
            .http
            .head(self.table_url(&query.table)?)
            .query(&[("select", "id")])
            .query(&query_params(&counted))
            .header("Prefer", "count=exact");
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        resp.headers()
            .get("content-range")
            .and_then(|h| h.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| Error::Api {
                status: resp.status().as_u16(),
                message: "missing Content-Range".to_string(),
            })
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>> {
        debug!(table, count = rows.len(), "insert");
        let req = self
            .http
            .post(self.table_url(table)?)
            .header("Prefer", "return=representation")
            .json(&rows);
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>> {
        debug!(table = %query.table, "update");
        let req = self
            .http
            .patch(self.table_url(&query.table)?)
            .query(&query_params(query))
            .header("Prefer", "return=representation")
            .json(&patch);
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn delete(&self, query: &Query) -> Result<usize> {
        debug!(table = %query.table, "delete");
        let req = self
            .http
            .delete(self.table_url(&query.table)?)
            .query(&query_params(query))
            .header("Prefer", "return=representation");
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let removed: Vec<Value> = resp.json().await?;
        Ok(removed.len())
    }

    async fn subscribe(&self, spec: ChannelSpec) -> Result<ChangeFeed> {
        let config = SocketConfig {
            url: socket::websocket_url(&self.base_url, &self.anon_key)?,
            access_token: self.bearer(),
            heartbeat: self.heartbeat,
        };
        socket::open_channel(config, spec).await
    }

    async fn invoke(&self, function: &str, body: Value) -> Result<ByteStream> {
        debug!(function, "invoke");
        let req = self
            .http
            .post(self.endpoint(&format!("/functions/v1/{}", function))?)
            .header("Content-Type", "application/json")
            .json(&body);
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(function_error(resp).await);
        }
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::serve_status;
    use serde_json::json;

    async fn invoke_error(status: u16, body: Value) -> Error {
        let url = serve_status(status, body).await;
        let platform = RestPlatform::new(&url, "anon").unwrap();
        match platform.invoke("ai-chat", json!({"messages": []})).await {
            Err(err) => err,
            Ok(_) => panic!("expected {} to fail", status),
        }
    }

    #[tokio::test]
    async fn test_function_rate_limit_and_quota() {
        let err = invoke_error(429, json!({"error": "Rate limit exceeded. Please try again in a moment."})).await;
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "Rate limit exceeded. Please try again in a moment.");

        let err = invoke_error(402, json!({"error": "AI usage limit reached. Please contact support."})).await;
        assert!(err.is_quota_exceeded());
        assert_eq!(err.to_string(), "AI usage limit reached. Please contact support.");
    }

    #[tokio::test]
    async fn test_function_other_failure_keeps_status_and_error_text() {
        let err = invoke_error(500, json!({"error": "gateway down"})).await;
        match err {
            Error::Function { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "gateway down");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_query_params_render_postgrest_filters() {
        let query = Query::table("messages")
            .eq("conversation_id", "c1")
            .neq("sender_id", "u1")
            .gt("created_at", "2025-01-01T00:00:00.000000+00:00")
            .eq("is_read", false)
            .is_null("last_read_at")
            .order("created_at", false)
            .range(0, 49);
        let params = query_params(&query);
        assert_eq!(
            params,
            vec![
                ("conversation_id".into(), "eq.c1".into()),
                ("sender_id".into(), "neq.u1".into()),
                ("created_at".into(), "gt.2025-01-01T00:00:00.000000+00:00".into()),
                ("is_read".into(), "eq.false".into()),
                ("last_read_at".into(), "is.null".into()),
                ("order".into(), "created_at.desc".into()),
                ("limit".into(), "50".into()),
                ("offset".into(), "0".into()),
            ]
        );
    }

    #[test]
    fn test_in_and_ilike_params() {
        let query = Query::table("messages")
            .is_in("conversation_id", ["a", "b"])
            .ilike("content", "%milk%");
        let params = query_params(&query);
        assert_eq!(params[0].1, "in.(\"a\",\"b\")");
        assert_eq!(params[1].1, "ilike.*milk*");

        let literal = query_params(&Query::table("messages").contains("content", "50%_off\\"));
        assert_eq!(literal[0].1, "ilike.*50\\%\\_off\\\\*");
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("0-24/3573"), Some(3573));
        assert_eq!(content_range_total("*/0"), Some(0));
        assert_eq!(content_range_total("0-24/*"), None);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            RestPlatform::new("not a url", "anon"),
            Err(Error::Url(_))
        ));
    }

    #[test]
    fn test_session_round_trip() {
        let platform = RestPlatform::new("https://demo.supabase.co", "anon").unwrap();
        assert!(platform.session().is_none());
        assert_eq!(platform.bearer(), "anon");
        platform
            .set_session(Some(Session {
                user_id: "u1".into(),
                access_token: "tok".into(),
            }))
            .unwrap();
        assert_eq!(platform.bearer(), "tok");
    }
}
