use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::gmail::{
    oauth::{
        DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens, TOKEN_ENDPOINT, TokenStore,
        refresh_access_token_with_endpoint,
    },
    types::{
        ListHistoryResponse, ListMessagesResponse, Message, ModifyMessageRequest, Profile,
        WatchRequest, WatchResponse,
    },
};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("token persistence error: {0}")]
    TokenStore(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized after refresh")]
    Unauthorized,
}

/// Authenticated Gmail API client for a single mailbox. Refreshes the access
/// token ahead of expiry and retries once after a 401.
pub struct GmailClient<S: TokenStore> {
    http: Client,
    user_id: String,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_endpoint: String,
    tokens: RwLock<OAuthTokens>,
    refresh_lock: Mutex<()>,
    token_store: Arc<S>,
}

impl<S: TokenStore> GmailClient<S> {
    pub fn new(
        http: Client,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        initial_tokens: OAuthTokens,
        token_store: Arc<S>,
    ) -> Self {
        Self {
            http,
            user_id: user_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            tokens: RwLock::new(initial_tokens),
            refresh_lock: Mutex::new(()),
            token_store,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_token_endpoint(mut self, token_endpoint: impl Into<String>) -> Self {
        self.token_endpoint = token_endpoint.into();
        self
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message, GmailClientError> {
        let url = format!("{}/{}/messages/{}", self.api_base, self.user_id, message_id);
        self.send_json(|| self.http.get(&url).query(&[("format", "full")]))
            .await
    }

    pub async fn list_history(
        &self,
        start_history_id: &str,
        label_id: Option<&str>,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, GmailClientError> {
        let url = format!("{}/{}/history", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self
                .http
                .get(&url)
                .query(&[("startHistoryId", start_history_id)])
                .query(&[("historyTypes", "messageAdded")]);
            if let Some(label) = label_id {
                builder = builder.query(&[("labelId", label)]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    pub async fn list_messages(
        &self,
        query: Option<&str>,
        page_token: Option<&str>,
        include_spam_trash: bool,
        max_results: Option<u32>,
    ) -> Result<ListMessagesResponse, GmailClientError> {
        let url = format!("{}/{}/messages", self.api_base, self.user_id);
        self.send_json(|| {
            let mut builder = self.http.get(&url);
            if let Some(q) = query {
                builder = builder.query(&[("q", q)]);
            }
            if let Some(token) = page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            if include_spam_trash {
                builder = builder.query(&[("includeSpamTrash", "true")]);
            }
            if let Some(max) = max_results {
                builder = builder.query(&[("maxResults", max)]);
            }
            builder
        })
        .await
    }

    /// Fetches the user's Gmail profile, including the current historyId.
    pub async fn get_profile(&self) -> Result<Profile, GmailClientError> {
        let url = format!("{}/{}/profile", self.api_base, self.user_id);
        self.send_json(|| self.http.get(&url)).await
    }

    /// Adds and removes labels on a message in one call.
    pub async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    ) -> Result<Message, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/modify",
            self.api_base, self.user_id, message_id
        );
        let body = ModifyMessageRequest {
            add_label_ids,
            remove_label_ids,
        };
        self.send_json(|| self.http.post(&url).json(&body)).await
    }

    /// Registers push notifications for this mailbox on the given topic.
    pub async fn watch(&self, request: &WatchRequest) -> Result<WatchResponse, GmailClientError> {
        let url = format!("{}/{}/watch", self.api_base, self.user_id);
        self.send_json(|| self.http.post(&url).json(request)).await
    }

    /// Stops push notifications for this mailbox. Gmail returns an empty body.
    pub async fn stop_watch(&self) -> Result<(), GmailClientError> {
        let url = format!("{}/{}/stop", self.api_base, self.user_id);
        self.perform_authenticated(|| self.http.post(&url)).await?;
        Ok(())
    }

    async fn send_json<T, B>(&self, build: B) -> Result<T, GmailClientError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = self.perform_authenticated(build).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(GmailClientError::Decode)
    }

    async fn perform_authenticated<B>(
        &self,
        build: B,
    ) -> Result<reqwest::Response, GmailClientError>
    where
        B: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let tokens = self.ensure_fresh_token(false).await?;
        let mut response = build().bearer_auth(&tokens.access_token).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let tokens = self.ensure_fresh_token(true).await?;
            response = build().bearer_auth(&tokens.access_token).send().await?;
        }

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::Unauthorized);
        }

        Ok(response.error_for_status()?)
    }

    async fn ensure_fresh_token(
        &self,
        force_refresh: bool,
    ) -> Result<OAuthTokens, GmailClientError> {
        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        {
            let tokens = self.tokens.read().await;
            if !force_refresh && !tokens.needs_refresh(Utc::now(), DEFAULT_REFRESH_BUFFER) {
                return Ok(tokens.clone());
            }
        }

        let current = { self.tokens.read().await.clone() };
        let refreshed = refresh_access_token_with_endpoint(
            &self.http,
            &self.client_id,
            &self.client_secret,
            &current,
            &self.token_endpoint,
        )
        .await?;

        {
            let mut tokens = self.tokens.write().await;
            *tokens = refreshed.clone();
        }

        self.token_store
            .save_tokens(&refreshed)
            .await
            .map_err(|err| GmailClientError::TokenStore(err.to_string()))?;

        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingStore {
        saved: TokioMutex<Vec<OAuthTokens>>,
    }

    #[async_trait]
    impl TokenStore for RecordingStore {
        type Error = std::convert::Infallible;

        async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
            self.saved.lock().await.push(tokens.clone());
            Ok(())
        }
    }

    fn make_client(
        server: &MockServer,
        tokens: OAuthTokens,
        store: Arc<RecordingStore>,
    ) -> GmailClient<RecordingStore> {
        GmailClient::new(
            reqwest::Client::new(),
            "me",
            "client",
            "secret",
            tokens,
            store,
        )
        .with_api_base(format!("{}/gmail/v1/users", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()))
    }

    fn fresh_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn refreshes_before_request_when_expiring() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_token",
                "refresh_token": "refresh_two",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/abc"))
            .and(header("authorization", "Bearer new_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "labelIds": [],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_one".into(),
            expires_at: Utc::now() + Duration::minutes(1),
        };
        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, tokens, store.clone());

        let message = client.get_message("abc").await.expect("message loads");

        assert_eq!(message.id, "abc");
        let saved = store.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].access_token, "new_token");
    }

    #[tokio::test]
    async fn retries_after_unauthorized_and_uses_refreshed_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh_token",
                "refresh_token": "refresh_new",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/abc"))
            .and(header("authorization", "Bearer old_token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/abc"))
            .and(header("authorization", "Bearer fresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "abc",
                "labelIds": [],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_old".into(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, tokens, store.clone());

        let message = client.get_message("abc").await.expect("message loads");
        assert_eq!(message.id, "abc");

        let saved = store.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].access_token, "fresh_token");
    }

    #[tokio::test]
    async fn returns_unauthorized_if_retry_still_fails() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh_token",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/abc"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let tokens = OAuthTokens {
            access_token: "old_token".into(),
            refresh_token: "refresh_old".into(),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, tokens, store);

        let err = client
            .get_message("abc")
            .await
            .expect_err("should surface unauthorized");

        assert!(matches!(err, GmailClientError::Unauthorized));
    }

    #[tokio::test]
    async fn surfaces_not_found_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let err = client
            .get_message("missing")
            .await
            .expect_err("should surface 404");

        match err {
            GmailClientError::Http(e) => {
                assert_eq!(e.status(), Some(StatusCode::NOT_FOUND));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn surfaces_rate_limit_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let err = client
            .list_messages(None, None, false, None)
            .await
            .expect_err("should surface 429");

        match err {
            GmailClientError::Http(e) => {
                assert_eq!(e.status(), Some(StatusCode::TOO_MANY_REQUESTS));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn parses_list_history_response() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {
                        "id": "10",
                        "messagesAdded": [
                            { "message": { "id": "m2", "threadId": "t2" } }
                        ],
                        "labelsAdded": [
                            { "message": { "id": "m4", "threadId": "t4" }, "labelIds": ["INBOX"] }
                        ]
                    }
                ],
                "nextPageToken": "next",
                "historyId": "10"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let response = client
            .list_history("5", Some("INBOX"), Some("page"), Some(50))
            .await
            .expect("parses list history");

        assert_eq!(response.history.len(), 1);
        assert_eq!(response.next_page_token.as_deref(), Some("next"));
        let record = &response.history[0];
        assert_eq!(record.messages_added.as_ref().unwrap()[0].message.id, "m2");
        assert_eq!(
            record.labels_added.as_ref().unwrap()[0].label_ids,
            vec!["INBOX"]
        );
    }

    #[tokio::test]
    async fn list_messages_builds_expected_query_params() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "newer_than:1h"))
            .and(query_param("pageToken", "token2"))
            .and(query_param("includeSpamTrash", "true"))
            .and(query_param("maxResults", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [],
                "resultSizeEstimate": 0
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store.clone());

        let response = client
            .list_messages(Some("newer_than:1h"), Some("token2"), true, Some(20))
            .await
            .expect("list messages succeeds");

        assert!(response.messages.is_empty());
        let saved = store.saved.lock().await;
        assert!(saved.is_empty(), "tokens should not be refreshed");
    }

    #[tokio::test]
    async fn modify_message_sends_label_changes() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/m1/modify"))
            .and(body_json(json!({
                "addLabelIds": ["INBOX"],
                "removeLabelIds": ["SPAM"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m1",
                "labelIds": ["INBOX"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let message = client
            .modify_message("m1", vec!["INBOX".into()], vec!["SPAM".into()])
            .await
            .expect("modify succeeds");

        assert_eq!(message.label_ids, vec!["INBOX"]);
    }

    #[tokio::test]
    async fn watch_registers_topic_and_returns_expiration() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/watch"))
            .and(body_json(json!({
                "topicName": "projects/p1/topics/mail"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "historyId": "500",
                "expiration": "1700000000000"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let response = client
            .watch(&WatchRequest {
                topic_name: "projects/p1/topics/mail".into(),
                label_ids: vec![],
                label_filter_behavior: None,
            })
            .await
            .expect("watch succeeds");

        assert_eq!(response.history_id, "500");
        assert_eq!(response.expiration, "1700000000000");
    }

    #[tokio::test]
    async fn stop_watch_handles_empty_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/stop"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        client.stop_watch().await.expect("stop succeeds");
    }

    #[tokio::test]
    async fn get_profile_returns_history_id() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "emailAddress": "test@example.com",
                "messagesTotal": 1234,
                "threadsTotal": 567,
                "historyId": "98765"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let profile = client.get_profile().await.expect("get_profile succeeds");

        assert_eq!(profile.email_address, "test@example.com");
        assert_eq!(profile.history_id, "98765");
        assert_eq!(profile.messages_total, Some(1234));
    }

    #[tokio::test]
    async fn returns_decode_error_on_invalid_json() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(RecordingStore::default());
        let client = make_client(&server, fresh_tokens(), store);

        let err = client
            .list_messages(None, None, false, None)
            .await
            .expect_err("should surface decode error");

        assert!(matches!(err, GmailClientError::Decode(_)));
    }
}
