//! Feishu (Lark) chat gateway.
//!
//! Implements [`ChatGateway`] over the Feishu Open Platform REST API:
//! tenant access token lifecycle, paged message listing and plain-text
//! replies.  Authentication uses app credentials (app_id + app_secret); the
//! tenant token is cached and renewed shortly before it expires.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use taskbridge_intent::Message;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Result};
use crate::traits::{ChatGateway, MessagePage};

/// Default Feishu Open Platform API base URL.
pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Per-request HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// A cached token is renewed this long before its stated expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

const PAGE_SIZE: &str = "20";

/// `create_time` values above this are milliseconds, not seconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    expire: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: ListData,
}

#[derive(Debug, Default, Deserialize)]
struct ListData {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(default)]
    page_token: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListItem {
    message_id: String,
    chat_id: String,
    create_time: String,
    sender: Sender,
    body: Body,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sender {
    sender_id: SenderId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SenderId {
    open_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Body {
    content: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Feishu Open Platform implementation of [`ChatGateway`].
pub struct FeishuGateway {
    app_id: String,
    app_secret: String,
    /// Base URL for the Feishu API, without a trailing slash.
    base_url: String,
    client: reqwest::Client,
    /// Tenant access token and its expiry.  Never held across an await.
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for FeishuGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeishuGateway")
            .field("app_id", &self.app_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FeishuGateway {
    /// Create a gateway for the given app credentials against the public
    /// Feishu endpoint.
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("taskbridge/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| AdapterError::Http {
                operation: "build http client",
                source,
            })?;

        Ok(Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            token: Mutex::new(None),
        })
    }

    /// Point the gateway at a different API base (self-hosted Lark, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build a full API URL from a path segment.
    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -----------------------------------------------------------------------
    // Token management
    // -----------------------------------------------------------------------

    /// Return a valid tenant access token, renewing it if needed.
    ///
    /// Two concurrent callers may both renew; the tokens overlap so either
    /// one is usable.
    async fn tenant_access_token(&self) -> Result<String> {
        let now = Utc::now();
        if let Some(cached) = self.cached_token(now) {
            return Ok(cached);
        }

        let fresh = self.request_tenant_access_token(now).await?;
        let token = fresh.token.clone();
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = Some(fresh);
        Ok(token)
    }

    fn cached_token(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.token.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .filter(|t| now < t.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS))
            .map(|t| t.token.clone())
    }

    async fn request_tenant_access_token(&self, now: DateTime<Utc>) -> Result<CachedToken> {
        const OP: &str = "tenant access token";
        let url = self.api_url("/auth/v3/tenant_access_token/internal");
        debug!(url = %url, "requesting tenant access token");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .map_err(|source| AdapterError::Http {
                operation: OP,
                source,
            })?;

        let parsed: TokenResponse = read_json(response, OP).await?;
        check_code(OP, parsed.code, &parsed.msg)?;

        info!(expire_secs = parsed.expire, "tenant access token renewed");
        Ok(CachedToken {
            token: parsed.tenant_access_token,
            expires_at: now + chrono::Duration::seconds(parsed.expire),
        })
    }
}

#[async_trait]
impl ChatGateway for FeishuGateway {
    async fn fetch_messages(&self, start: DateTime<Utc>, page_token: &str) -> Result<MessagePage> {
        const OP: &str = "list messages";
        let token = self.tenant_access_token().await?;

        let start_time = start.timestamp().to_string();
        let mut query = vec![
            ("page_size", PAGE_SIZE),
            ("sort_type", "ByCreateTimeAsc"),
            ("start_time", start_time.as_str()),
        ];
        if !page_token.is_empty() {
            query.push(("page_token", page_token));
        }

        let response = self
            .client
            .get(self.api_url("/im/v1/messages"))
            .bearer_auth(&token)
            .query(&query)
            .send()
            .await
            .map_err(|source| AdapterError::Http {
                operation: OP,
                source,
            })?;

        let parsed: ListResponse = read_json(response, OP).await?;
        check_code(OP, parsed.code, &parsed.msg)?;

        let data = parsed.data;
        let total = data.items.len();
        let messages: Vec<Message> = data
            .items
            .into_iter()
            .filter_map(|item| {
                let text = extract_text(&item.body.content);
                if text.trim().is_empty() {
                    return None;
                }
                Some(Message {
                    message_id: item.message_id,
                    chat_id: item.chat_id,
                    sender_id: item.sender.sender_id.open_id,
                    text,
                    create_time: parse_create_time(&item.create_time),
                })
            })
            .collect();

        let next_cursor = if data.has_more {
            data.page_token
        } else {
            String::new()
        };

        debug!(
            total,
            kept = messages.len(),
            has_more = data.has_more,
            "fetched message page"
        );
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        const OP: &str = "send message";
        let token = self.tenant_access_token().await?;
        let body = build_message_body(chat_id, text)?;

        let response = self
            .client
            .post(self.api_url("/im/v1/messages"))
            .bearer_auth(&token)
            .query(&[("receive_id_type", "chat_id")])
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&body)
            .send()
            .await
            .map_err(|source| AdapterError::Http {
                operation: OP,
                source,
            })?;

        let status = response.status().as_u16();
        if status >= 300 {
            let body = response.text().await.unwrap_or_default();
            warn!(chat_id, status, "reply rejected");
            return Err(AdapterError::Status {
                operation: OP,
                status,
                body,
            });
        }

        debug!(chat_id, chars = text.chars().count(), "reply sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build the JSON body for a text message.  `content` is itself a JSON
/// document encoded as a string, as the Feishu API requires.
pub fn build_message_body(chat_id: &str, text: &str) -> Result<Value> {
    let content = serde_json::to_string(&json!({ "text": text }))?;
    Ok(json!({
        "receive_id": chat_id,
        "msg_type": "text",
        "content": content,
    }))
}

/// Pull the human text out of a message `body.content` document.  Content
/// that is not JSON, or has no string `text` field, is returned as is.
pub fn extract_text(content: &str) -> String {
    if content.trim().is_empty() {
        return String::new();
    }
    match serde_json::from_str::<Value>(content) {
        Ok(parsed) => match parsed.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => content.to_string(),
        },
        Err(_) => content.to_string(),
    }
}

/// Parse a decimal `create_time` in seconds or milliseconds.  Unparseable
/// values map to the Unix epoch.
pub fn parse_create_time(raw: &str) -> DateTime<Utc> {
    let mut value = raw.trim().parse::<i64>().unwrap_or(0);
    if value > MILLIS_THRESHOLD {
        value /= 1000;
    }
    DateTime::from_timestamp(value, 0).unwrap_or_default()
}

/// Reject non-2xx responses (keeping the body for diagnostics) and decode
/// the rest as JSON.
async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<T> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|source| AdapterError::Http { operation, source })?;
    if status >= 300 {
        return Err(AdapterError::Status {
            operation,
            status,
            body,
        });
    }
    Ok(serde_json::from_str(&body)?)
}

/// Feishu responses carry `{ "code": 0, "msg": "success", ... }`.
fn check_code(operation: &'static str, code: i64, msg: &str) -> Result<()> {
    if code != 0 {
        return Err(AdapterError::Api {
            operation,
            code,
            msg: msg.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;

    fn token_mock(server: &MockServer, expire: i64) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/auth/v3/tenant_access_token/internal")
                .json_body(json!({"app_id": "cli_a", "app_secret": "s3cret"}));
            then.status(200).json_body(json!({
                "code": 0,
                "msg": "ok",
                "tenant_access_token": "t-123",
                "expire": expire
            }));
        })
    }

    fn gateway(server: &MockServer) -> FeishuGateway {
        FeishuGateway::new("cli_a", "s3cret")
            .unwrap()
            .with_base_url(server.base_url())
    }

    fn item(id: &str, create_time: &str, content: &str) -> Value {
        json!({
            "message_id": id,
            "chat_id": "oc_1",
            "create_time": create_time,
            "sender": {"sender_id": {"open_id": "ou_alice"}},
            "body": {"content": content}
        })
    }

    #[test]
    fn extract_text_reads_text_field() {
        assert_eq!(extract_text(r#"{"text":"hello"}"#), "hello");
    }

    #[test]
    fn extract_text_falls_back_to_raw() {
        assert_eq!(extract_text("plain words"), "plain words");
    }

    #[test]
    fn extract_text_keeps_non_text_content() {
        let image = r#"{"image_key":"img_v2_abc"}"#;
        assert_eq!(extract_text(image), image);
        let numeric = r#"{"text":42}"#;
        assert_eq!(extract_text(numeric), numeric);
        assert_eq!(extract_text("  "), "");
    }

    #[test]
    fn parse_create_time_handles_seconds_and_millis() {
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(parse_create_time("1700000000"), expected);
        assert_eq!(parse_create_time("1700000000123"), expected);
        assert_eq!(parse_create_time("garbage"), DateTime::<Utc>::default());
    }

    #[test]
    fn build_message_body_encodes_content_as_string() {
        let body = build_message_body("oc_1", "say \"hi\"\nbye").unwrap();
        assert_eq!(body["receive_id"], "oc_1");
        assert_eq!(body["msg_type"], "text");
        let content = body["content"].as_str().unwrap();
        let inner: Value = serde_json::from_str(content).unwrap();
        assert_eq!(inner["text"], "say \"hi\"\nbye");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let gw = FeishuGateway::new("a", "b")
            .unwrap()
            .with_base_url("http://localhost:9/");
        assert_eq!(gw.api_url("/x"), "http://localhost:9/x");
    }

    #[tokio::test]
    async fn fetch_maps_items_and_filters_empty_text() {
        let server = MockServer::start();
        let token = token_mock(&server, 7200);
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/im/v1/messages")
                .header("authorization", "Bearer t-123")
                .query_param("page_size", "20")
                .query_param("sort_type", "ByCreateTimeAsc")
                .query_param("start_time", "1700000000");
            then.status(200).json_body(json!({
                "code": 0,
                "data": {
                    "items": [
                        item("om_1", "1700000001000", r##"{"text":"#repo=aoi fix it"}"##),
                        item("om_2", "1700000002", r#"{"text":"   "}"#),
                        item("om_3", "1700000003", "not json"),
                        item("om_4", "1700000004", r#"{"image_key":"img_v2_abc"}"#)
                    ],
                    "page_token": "p2",
                    "has_more": false
                }
            }));
        });

        let gw = gateway(&server);
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let page = gw.fetch_messages(start, "").await.unwrap();

        token.assert_calls(1);
        list.assert_calls(1);
        assert_eq!(page.messages.len(), 3);
        assert_eq!(page.messages[0].message_id, "om_1");
        assert_eq!(page.messages[0].sender_id, "ou_alice");
        assert_eq!(page.messages[0].chat_id, "oc_1");
        assert_eq!(page.messages[0].text, "#repo=aoi fix it");
        assert_eq!(
            page.messages[0].create_time,
            Utc.timestamp_opt(1_700_000_001, 0).unwrap()
        );
        assert_eq!(page.messages[1].text, "not json");
        // Non-text bodies are delivered raw so the sender gets a parse error.
        assert_eq!(page.messages[2].text, r#"{"image_key":"img_v2_abc"}"#);
        // page_token is ignored when has_more is false.
        assert_eq!(page.next_cursor, "");
    }

    #[tokio::test]
    async fn fetch_forwards_page_token_and_returns_cursor_when_more() {
        let server = MockServer::start();
        token_mock(&server, 7200);
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/im/v1/messages")
                .query_param("page_token", "p2");
            then.status(200).json_body(json!({
                "code": 0,
                "data": {"items": [], "page_token": "p3", "has_more": true}
            }));
        });

        let page = gateway(&server)
            .fetch_messages(Utc::now(), "p2")
            .await
            .unwrap();
        list.assert_calls(1);
        assert!(page.messages.is_empty());
        assert_eq!(page.next_cursor, "p3");
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let server = MockServer::start();
        let token = token_mock(&server, 7200);
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/im/v1/messages")
                .query_param("receive_id_type", "chat_id");
            then.status(200).json_body(json!({"code": 0}));
        });

        let gw = gateway(&server);
        gw.send_text("oc_1", "one").await.unwrap();
        gw.send_text("oc_1", "two").await.unwrap();

        token.assert_calls(1);
        send.assert_calls(2);
    }

    #[tokio::test]
    async fn token_near_expiry_is_renewed() {
        let server = MockServer::start();
        // Lifetime inside the refresh margin: every call renews.
        let token = token_mock(&server, 30);
        server.mock(|when, then| {
            when.method(POST).path("/im/v1/messages");
            then.status(200).json_body(json!({"code": 0}));
        });

        let gw = gateway(&server);
        gw.send_text("oc_1", "one").await.unwrap();
        gw.send_text("oc_1", "two").await.unwrap();
        token.assert_calls(2);
    }

    #[tokio::test]
    async fn send_text_posts_expected_body() {
        let server = MockServer::start();
        token_mock(&server, 7200);
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/im/v1/messages")
                .query_param("receive_id_type", "chat_id")
                .header("authorization", "Bearer t-123")
                .json_body(json!({
                    "receive_id": "oc_9",
                    "msg_type": "text",
                    "content": "{\"text\":\"✅ 任务已接收\"}"
                }));
            then.status(200).json_body(json!({"code": 0}));
        });

        gateway(&server)
            .send_text("oc_9", "✅ 任务已接收")
            .await
            .unwrap();
        send.assert_calls(1);
    }

    #[tokio::test]
    async fn send_text_status_error_carries_body() {
        let server = MockServer::start();
        token_mock(&server, 7200);
        server.mock(|when, then| {
            when.method(POST).path("/im/v1/messages");
            then.status(400).body("bad receive_id");
        });

        let err = gateway(&server).send_text("oc_1", "x").await.unwrap_err();
        match err {
            AdapterError::Status { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad receive_id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn token_api_error_is_reported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/v3/tenant_access_token/internal");
            then.status(200)
                .json_body(json!({"code": 10003, "msg": "invalid app_secret"}));
        });

        let err = gateway(&server)
            .fetch_messages(Utc::now(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Api { code: 10003, .. }));
        assert!(err.to_string().contains("invalid app_secret"));
    }

    #[tokio::test]
    async fn fetch_api_error_is_reported() {
        let server = MockServer::start();
        token_mock(&server, 7200);
        server.mock(|when, then| {
            when.method(GET).path("/im/v1/messages");
            then.status(200)
                .json_body(json!({"code": 230002, "msg": "bot not in chat"}));
        });

        let err = gateway(&server)
            .fetch_messages(Utc::now(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Api { code: 230002, .. }));
    }

    #[tokio::test]
    async fn fetch_status_error_is_reported() {
        let server = MockServer::start();
        token_mock(&server, 7200);
        server.mock(|when, then| {
            when.method(GET).path("/im/v1/messages");
            then.status(503).body("unavailable");
        });

        let err = gateway(&server)
            .fetch_messages(Utc::now(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Status { status: 503, .. }));
    }
}
