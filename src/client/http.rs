//! HTTP/JSON query client
//!
//! Talks to a query gateway that fronts the vendor SDK:
//!
//! | Operation        | Request                                  | Response            |
//! |------------------|------------------------------------------|---------------------|
//! | login            | `POST /login`                            | `{"token": "..."}`  |
//! | list databases   | `GET /databases`                         | `["..."]`           |
//! | list tables      | `GET /databases/{db}/tables`             | `["..."]`           |
//! | list fields      | `GET /tables/{table}/fields`             | strings or objects  |
//! | count            | `POST /count`                            | `{"count": n}`      |
//! | query            | `POST /query`                            | `{"rows": [{..}]}`  |
//!
//! Every call after login carries the session token as a bearer token. This
//! client never retries; the rate governor owns retries.

use super::{
    Credentials, QueryClient, QueryError, QueryRequest, QueryResult, QueryWindow, Session,
    TableInfo,
};
use crate::{Record, Value};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// HTTP request timeout (seconds). Full pages of 200,000 rows take minutes to serialize.
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Longest error body excerpt kept in messages
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Keys under which a field listing names a column
const FIELD_NAME_KEYS: [&str; 3] = ["field", "Field", "字段"];

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct QueryBody<'a> {
    table: &'a str,
    columns: &'a [String],
    condition: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

impl<'a> QueryBody<'a> {
    fn new(request: &'a QueryRequest, window: Option<QueryWindow>) -> Self {
        Self {
            table: &request.table,
            columns: &request.columns,
            condition: &request.condition,
            start_date: request.date_range.map(|r| r.start_str()),
            end_date: request.date_range.map(|r| r.end_str()),
            offset: window.map(|w| w.offset()),
            limit: window.map(|w| w.limit()),
        }
    }
}

#[derive(Deserialize)]
struct CountResponse {
    count: Value,
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<Record>,
}

/// Query client for the JSON gateway
#[derive(Debug, Clone)]
pub struct HttpQueryClient {
    client: Client,
    base_url: Url,
}

impl HttpQueryClient {
    /// Create a client for the gateway at `base_url`
    pub fn new(base_url: &str) -> QueryResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| QueryError::RemoteQuery {
            message: format!("Invalid gateway URL '{base_url}': {e}"),
            retryable: false,
        })?;
        if base_url.cannot_be_a_base() {
            return Err(QueryError::RemoteQuery {
                message: format!("Gateway URL '{base_url}' cannot be a base URL"),
                retryable: false,
            });
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| QueryError::RemoteQuery {
                message: format!("Failed to build HTTP client: {e}"),
                retryable: false,
            })?;

        Ok(Self { client, base_url })
    }

    /// Gateway URL with `segments` appended (each segment percent-encoded)
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> QueryResult<T> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_status(status.as_u16(), &body);
            warn!(status = status.as_u16(), error = %error, "Gateway returned an error");
            return Err(error);
        }

        response.json::<T>().await.map_err(|e| QueryError::RemoteQuery {
            message: format!("Failed to deserialize response: {e}"),
            retryable: false,
        })
    }
}

#[async_trait]
impl QueryClient for HttpQueryClient {
    async fn login(&self, credentials: &Credentials) -> QueryResult<Session> {
        debug!(username = %credentials.username, "Logging in");
        let body = LoginBody {
            username: &credentials.username,
            password: &credentials.password,
            language: &credentials.language,
        };
        let response: LoginResponse = self
            .send(self.client.post(self.endpoint(&["login"])).json(&body))
            .await?;
        Ok(Session::new(&credentials.username, response.token))
    }

    async fn list_databases(&self, session: &Session) -> QueryResult<Vec<String>> {
        let request = self
            .client
            .get(self.endpoint(&["databases"]))
            .bearer_auth(session.token());
        self.send(request).await
    }

    async fn list_tables(
        &self,
        session: &Session,
        database: &str,
    ) -> QueryResult<Vec<TableInfo>> {
        let request = self
            .client
            .get(self.endpoint(&["databases", database, "tables"]))
            .bearer_auth(session.token());
        self.send(request).await
    }

    async fn list_fields(&self, session: &Session, table: &str) -> QueryResult<Vec<String>> {
        let request = self
            .client
            .get(self.endpoint(&["tables", table, "fields"]))
            .bearer_auth(session.token());
        let raw: Vec<Value> = self.send(request).await?;
        Ok(extract_field_names(&raw))
    }

    async fn query_count(&self, session: &Session, request: &QueryRequest) -> QueryResult<u64> {
        let body = QueryBody::new(request, None);
        let response: CountResponse = self
            .send(
                self.client
                    .post(self.endpoint(&["count"]))
                    .bearer_auth(session.token())
                    .json(&body),
            )
            .await?;
        normalize_count(&response.count).ok_or_else(|| QueryError::RemoteQuery {
            message: format!("Unrecognized count value: {}", response.count),
            retryable: false,
        })
    }

    async fn fetch(
        &self,
        session: &Session,
        request: &QueryRequest,
        window: QueryWindow,
    ) -> QueryResult<Vec<Record>> {
        let body = QueryBody::new(request, Some(window));
        let response: RowsResponse = self
            .send(
                self.client
                    .post(self.endpoint(&["query"]))
                    .bearer_auth(session.token())
                    .json(&body),
            )
            .await?;
        Ok(response.rows)
    }
}

/// Map an HTTP error status to a [`QueryError`]
///
/// 401/403 are authentication failures, 429 is a cooldown violation, 408 and 5xx
/// are transient. Any other status is a non-retryable rejection.
pub fn classify_status(status: u16, body: &str) -> QueryError {
    let message = error_message(status, body);
    match status {
        401 | 403 => QueryError::Authentication(message),
        429 => QueryError::RateLimited,
        408 | 500..=599 => QueryError::transient(message),
        _ => QueryError::RemoteQuery {
            message,
            retryable: false,
        },
    }
}

fn classify_transport(err: reqwest::Error) -> QueryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        QueryError::transient(format!("network error: {err}"))
    } else {
        QueryError::remote(format!("network error: {err}"))
    }
}

/// Prefer a JSON `message`/`error` field; fall back to a truncated body
fn error_message(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect());

    if detail.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", detail.trim())
    }
}

/// Interpret a count value, which the service reports as a number or a formatted string
///
/// # Examples
/// ```
/// use csmar_bulk_downloader::client::http::normalize_count;
/// use serde_json::json;
///
/// assert_eq!(normalize_count(&json!(42)), Some(42));
/// assert_eq!(normalize_count(&json!("1,234,567 rows")), Some(1_234_567));
/// assert_eq!(normalize_count(&json!(null)), None);
/// ```
pub fn normalize_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            if s.trim_start().starts_with('-') {
                return None;
            }
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Column names from a field listing of strings or `{"field": name, ...}` objects
///
/// Returned sorted and deduplicated.
pub fn extract_field_names(raw: &[Value]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for entry in raw {
        match entry {
            Value::String(s) if !s.is_empty() => {
                names.insert(s.clone());
            }
            Value::Object(map) => {
                let name = FIELD_NAME_KEYS
                    .iter()
                    .find_map(|k| map.get(*k))
                    .and_then(|v| match v {
                        Value::String(s) if !s.is_empty() => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    });
                if let Some(name) = name {
                    names.insert(name);
                }
            }
            _ => {}
        }
    }
    names.into_iter().collect()
}
