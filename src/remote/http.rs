//! HTTP collaborators - REST communication with the Craftbook backend
//!
//! Handles all calls to the hosted stores:
//! - Record queries with cursor pagination
//! - Record save/delete
//! - Push subscription save/delete
//! - Private key-value get/set

use super::{
    Cursor, KeyValueStore, Query, QueryPage, Record, RemoteError, RemoteStore, Subscription,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Connection settings shared by both HTTP stores
struct Transport {
    client: Client,
    base_url: Url,
    /// Bearer token, fixed for the life of the store
    access_token: Option<String>,
}

impl Transport {
    fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            access_token: token,
        })
    }

    /// Build `base_url/segment/segment/...` with each segment escaped
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        self.authorize(request)
            .send()
            .await
            .map_err(map_request_error)
    }
}

/// Shared record store over HTTPS
pub struct HttpRemoteStore {
    transport: Transport,
}

impl HttpRemoteStore {
    /// Create new store client
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            transport: Transport::new(base_url, timeout, token)?,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn current_user_id(&self) -> Result<String, RemoteError> {
        let url = self.transport.endpoint(&["users", "me"])?;
        let response = self.transport.send(self.transport.client.get(url)).await?;

        let user: UserResponse = handle_response(response).await?;
        Ok(user.user_id)
    }

    async fn query(&self, query: &Query, cursor: Option<&Cursor>) -> Result<QueryPage, RemoteError> {
        let url = self.transport.endpoint(&["records", "query"])?;
        let body = QueryRequest { query, cursor };
        let response = self
            .transport
            .send(self.transport.client.post(url).json(&body))
            .await?;

        handle_response(response).await
    }

    async fn save_record(&self, record: &Record) -> Result<Record, RemoteError> {
        let url = self
            .transport
            .endpoint(&["records", &record.record_type, &record.id])?;
        let response = self
            .transport
            .send(self.transport.client.put(url).json(record))
            .await?;

        handle_response(response).await
    }

    async fn delete_record(&self, record_type: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.transport.endpoint(&["records", record_type, id])?;
        let response = self.transport.send(self.transport.client.delete(url)).await?;

        handle_empty(response).await
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), RemoteError> {
        let url = self.transport.endpoint(&["subscriptions", &subscription.id])?;
        let response = self
            .transport
            .send(self.transport.client.put(url).json(subscription))
            .await?;

        handle_empty(response).await
    }

    async fn delete_subscription(&self, id: &str) -> Result<(), RemoteError> {
        let url = self.transport.endpoint(&["subscriptions", id])?;
        let response = self.transport.send(self.transport.client.delete(url)).await?;

        handle_empty(response).await
    }
}

/// Private key-value store over HTTPS
pub struct HttpKeyValueStore {
    transport: Transport,
}

impl HttpKeyValueStore {
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            transport: Transport::new(base_url, timeout, token)?,
        })
    }
}

#[async_trait]
impl KeyValueStore for HttpKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RemoteError> {
        let url = self.transport.endpoint(&["kv", key])?;
        let response = self.transport.send(self.transport.client.get(url)).await?;

        // Handle 404 as unset key (first launch)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let entry: KeyValueEntry = handle_response(response).await?;
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), RemoteError> {
        let url = self.transport.endpoint(&["kv", key])?;
        let body = KeyValueEntry {
            value: value.clone(),
        };
        let response = self
            .transport
            .send(self.transport.client.put(url).json(&body))
            .await?;

        handle_empty(response).await
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a Query,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a Cursor>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyValueEntry {
    value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Error Handling
// ============================================================================

fn map_request_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else if error.is_connect() {
        RemoteError::NetworkError(error.to_string())
    } else {
        RemoteError::Request(error)
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Handle a response whose body is ignored
async fn handle_empty(response: reqwest::Response) -> Result<(), RemoteError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(path),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimitExceeded,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        s if s.is_server_error() => RemoteError::ServerError(format!("{}: {}", s, message)),
        _ => RemoteError::NetworkError(format!("{}: {}", status, message)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Predicate, RECIPE_RECORD};
    use mockito::{Matcher, Server};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpRemoteStore::new("not a url", TIMEOUT, None),
            Err(RemoteError::InvalidUrl(_))
        ));
        assert!(HttpKeyValueStore::new("mailto:someone@example.com", TIMEOUT, None).is_err());
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let transport = Transport::new("https://example.com/api/v1/", TIMEOUT, None).unwrap();
        let url = transport.endpoint(&["kv", "recent searches"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/v1/kv/recent%20searches");
    }

    #[tokio::test]
    async fn test_query_sends_cursor_and_token() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("POST", "/records/query")
            .match_header("authorization", "Bearer test_token")
            .match_body(Matcher::PartialJson(json!({
                "query": {"record_type": "Recipe"},
                "cursor": "page-2"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "records": [{"record_type": "Recipe", "id": "1", "fields": {"id": 1}}],
                    "cursor": null
                }"#,
            )
            .create_async()
            .await;

        let store = HttpRemoteStore::new(&server.url(), TIMEOUT, Some("test_token".to_string())).unwrap();
        let query = Query::new(RECIPE_RECORD, Predicate::All, 50);
        let page = store
            .query(&query, Some(&Cursor("page-2".to_string())))
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert!(page.cursor.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_current_user() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/users/me")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"user_id": "user-42"}"#)
            .create_async()
            .await;

        let store = HttpRemoteStore::new(&server.url(), TIMEOUT, None).unwrap();
        assert_eq!(store.current_user_id().await.unwrap(), "user-42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_missing_record_is_not_found() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/records/Report/r-1")
            .with_status(404)
            .with_body(r#"{"error": "record not found"}"#)
            .create_async()
            .await;

        let store = HttpRemoteStore::new(&server.url(), TIMEOUT, None).unwrap();
        let err = store.delete_record("Report", "r-1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let mut server = Server::new_async().await;
        let _unauthorized = server
            .mock("PUT", "/subscriptions/sub-1")
            .with_status(401)
            .create_async()
            .await;
        let _limited = server
            .mock("DELETE", "/subscriptions/sub-1")
            .with_status(429)
            .create_async()
            .await;
        let _server_error = server
            .mock("GET", "/users/me")
            .with_status(500)
            .with_body(r#"{"error": "database down"}"#)
            .create_async()
            .await;

        let store = HttpRemoteStore::new(&server.url(), TIMEOUT, None).unwrap();
        let subscription = Subscription {
            id: "sub-1".to_string(),
            record_type: "Report".to_string(),
            predicate: Predicate::All,
            fires_on: vec![],
            alert_body: String::new(),
        };

        assert!(matches!(
            store.save_subscription(&subscription).await,
            Err(RemoteError::Unauthorized)
        ));
        assert!(matches!(
            store.delete_subscription("sub-1").await,
            Err(RemoteError::RateLimitExceeded)
        ));
        match store.current_user_id().await {
            Err(RemoteError::ServerError(msg)) => assert!(msg.contains("database down")),
            other => panic!("Expected ServerError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_value_get_missing_is_none() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/kv/favorites")
            .with_status(404)
            .create_async()
            .await;

        let store = HttpKeyValueStore::new(&server.url(), TIMEOUT, None).unwrap();
        assert!(store.get("favorites").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_value_set_and_get() {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/kv/recent_searches")
            .match_body(Matcher::Json(json!({"value": ["Torch"]})))
            .with_status(204)
            .create_async()
            .await;
        let _get = server
            .mock("GET", "/kv/recent_searches")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": ["Torch"]}"#)
            .create_async()
            .await;

        let store = HttpKeyValueStore::new(&server.url(), TIMEOUT, None).unwrap();
        store.set("recent_searches", &json!(["Torch"])).await.unwrap();
        put.assert_async().await;

        assert_eq!(
            store.get("recent_searches").await.unwrap(),
            Some(json!(["Torch"]))
        );
    }

    #[tokio::test]
    async fn test_invalid_json_response() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/records/query")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let store = HttpRemoteStore::new(&server.url(), TIMEOUT, None).unwrap();
        let query = Query::new(RECIPE_RECORD, Predicate::All, 50);
        assert!(matches!(
            store.query(&query, None).await,
            Err(RemoteError::InvalidResponse(_))
        ));
    }
}
