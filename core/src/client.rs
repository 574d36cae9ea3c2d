//! Project-level client for the MemoBase API.
//!
//! # Design
//! `MemoBaseClient` owns the resolved credentials and the transport, and is
//! the only type that sends requests. Every operation composes a request,
//! hands it to the transport once, and unpacks the envelope; nothing is
//! retried or cached. The client is a cheap `Clone` around an `Arc`, so user
//! handles carry their own copy instead of borrowing.
//!
//! `ping` and `update_config` are best-effort checks: they log and return
//! `false` instead of propagating errors. Everything else propagates.

use std::sync::Arc;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::compose::{escape_segment, RequestComposer};
use crate::config::ClientConfig;
use crate::envelope::{unpack, Envelope};
use crate::error::ApiError;
use crate::http::HttpMethod;
use crate::transport::Transport;
use crate::types::{IdData, ProfileConfigData, ProjectUsers, UsageItem, UsersQuery};
use crate::user::UserHandle;

#[derive(Clone)]
pub struct MemoBaseClient {
    inner: Arc<Inner>,
}

struct Inner {
    composer: RequestComposer,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for MemoBaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoBaseClient")
            .field("base_url", &self.base_url())
            .finish_non_exhaustive()
    }
}

impl MemoBaseClient {
    /// Build a client over `transport`.
    ///
    /// Fails with `ApiError::Config` if `config` carries no API key; no
    /// request is made.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ApiError> {
        let composer = RequestComposer::from_config(&config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                composer,
                transport,
            }),
        })
    }

    /// Build a client that talks HTTP through `reqwest`.
    #[cfg(feature = "reqwest")]
    pub fn with_reqwest(config: ClientConfig) -> Result<Self, ApiError> {
        Self::new(config, Arc::new(crate::transport::ReqwestTransport::new()))
    }

    pub fn base_url(&self) -> &str {
        self.inner.composer.base_url()
    }

    /// Send one request and unpack the envelope.
    pub(crate) async fn fetch<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Envelope<T>, ApiError> {
        let request = self.inner.composer.compose(method, path, query, body, &[])?;
        debug!(%method, url = %request.url, "sending request");
        let response = self.inner.transport.send(request).await?;
        debug!(%method, path, status = response.status, "received response");
        unpack(&response)
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Envelope<T>, ApiError> {
        self.fetch(HttpMethod::Get, path, query, None).await
    }

    /// Returns `true` when the server answers the health check. Never fails.
    pub async fn ping(&self) -> bool {
        match self.get::<IgnoredAny>("/healthcheck", &[]).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "healthcheck failed");
                false
            }
        }
    }

    /// The project's profile configuration.
    pub async fn get_config(&self) -> Result<String, ApiError> {
        let data: ProfileConfigData = self
            .get("/project/profile_config", &[])
            .await?
            .into_data("get config")?;
        Ok(data.profile_config)
    }

    /// Replace the project's profile configuration. Returns `false` on any
    /// failure.
    pub async fn update_config(&self, config: &str) -> bool {
        let body = json!({ "profile_config": config });
        match self
            .fetch::<IgnoredAny>(HttpMethod::Post, "/project/profile_config", &[], Some(&body))
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "profile config update failed");
                false
            }
        }
    }

    /// Create a user and return its id. `id` asks the server to use a
    /// caller-chosen id; otherwise one is assigned.
    pub async fn add_user(
        &self,
        data: Option<Map<String, Value>>,
        id: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut body = Map::new();
        if let Some(data) = data {
            body.insert("data".to_string(), Value::Object(data));
        }
        if let Some(id) = id {
            body.insert("id".to_string(), Value::String(id.to_string()));
        }
        let created: IdData = self
            .fetch(HttpMethod::Post, "/users", &[], Some(&Value::Object(body)))
            .await?
            .into_data("add user")?;
        Ok(created.id)
    }

    /// Replace a user's `data` wholesale. `None` clears it.
    pub async fn update_user(
        &self,
        user_id: &str,
        data: Option<Map<String, Value>>,
    ) -> Result<String, ApiError> {
        let body = json!({ "data": data });
        let updated: IdData = self
            .fetch(HttpMethod::Put, &user_path(user_id), &[], Some(&body))
            .await?
            .into_data("update user")?;
        Ok(updated.id)
    }

    /// List the project's users. A response without `data` is an empty page.
    pub async fn get_users(&self, query: &UsersQuery) -> Result<ProjectUsers, ApiError> {
        let envelope: Envelope<ProjectUsers> =
            self.get("/project/users", &query.to_pairs()).await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// A handle for `user_id`.
    ///
    /// Unless `no_fetch` is set the user is looked up first: a missing user
    /// is an error, and the record's fields are attached to the handle.
    /// With `no_fetch` nothing is sent.
    pub async fn get_user(&self, user_id: &str, no_fetch: bool) -> Result<UserHandle, ApiError> {
        if no_fetch {
            return Ok(UserHandle::new(user_id, self.clone(), None));
        }
        let envelope: Envelope<Map<String, Value>> =
            self.get(&user_path(user_id), &[]).await?;
        Ok(UserHandle::new(user_id, self.clone(), envelope.data))
    }

    /// Look the user up, creating it with the same id if the lookup fails
    /// for any reason.
    pub async fn get_or_create_user(&self, user_id: &str) -> Result<UserHandle, ApiError> {
        match self.get_user(user_id, false).await {
            Ok(user) => Ok(user),
            Err(err) => {
                warn!(user_id, error = %err, "user lookup failed, creating user");
                self.add_user(None, Some(user_id)).await?;
                Ok(UserHandle::new(user_id, self.clone(), None))
            }
        }
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<bool, ApiError> {
        self.fetch::<IgnoredAny>(HttpMethod::Delete, &user_path(user_id), &[], None)
            .await?;
        Ok(true)
    }

    /// Daily usage for the last `last_days` days. Empty when the server
    /// returns no `data`.
    pub async fn get_usage(&self, last_days: u32) -> Result<Vec<UsageItem>, ApiError> {
        let query = [("last_days", last_days.to_string())];
        let envelope: Envelope<Vec<UsageItem>> = self.get("/project/usage", &query).await?;
        Ok(envelope.data.unwrap_or_default())
    }
}

fn user_path(user_id: &str) -> String {
    format!("/users/{}", escape_segment(user_id))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::ScriptedTransport;

    fn client() -> (MemoBaseClient, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let config = ClientConfig::new("http://localhost:8019/").api_key("sk-test");
        let client = MemoBaseClient::new(config, transport.clone()).unwrap();
        (client, transport)
    }

    #[test]
    fn new_without_api_key_fails_before_any_request() {
        let transport = Arc::new(ScriptedTransport::new());
        let err = MemoBaseClient::new(ClientConfig::new("http://localhost:8019"), transport.clone())
            .unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn ping_true_on_success() {
        let (client, transport) = client();
        transport.reply_data(json!("pong"));
        assert!(client.ping().await);
        let req = transport.last_request().unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.url, "http://localhost:8019/api/v1/healthcheck");
        assert_eq!(req.header("Authorization"), Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn ping_false_on_every_failure_class() {
        let (client, transport) = client();
        transport
            .fail("connection refused")
            .reply(200, "not json")
            .reply_errno(500, "db down")
            .reply(503, "unavailable");
        for _ in 0..4 {
            assert!(!client.ping().await);
        }
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn get_config_requires_data() {
        let (client, transport) = client();
        transport
            .reply_data(json!({ "profile_config": "overwrite_user_profiles: []" }))
            .reply_empty();
        assert_eq!(client.get_config().await.unwrap(), "overwrite_user_profiles: []");
        assert!(matches!(client.get_config().await, Err(ApiError::Protocol(_))));
    }

    #[tokio::test]
    async fn update_config_swallows_failures() {
        let (client, transport) = client();
        transport.reply_empty().reply_errno(400, "invalid yaml");
        assert!(client.update_config("topics: []").await);
        assert!(!client.update_config("::").await);

        let requests = transport.requests();
        let sent = &requests[0];
        assert_eq!(sent.method, HttpMethod::Post);
        let body: Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "profile_config": "topics: []" }));
    }

    #[tokio::test]
    async fn add_user_returns_id_and_sends_only_present_keys() {
        let (client, transport) = client();
        transport.reply_data(json!({ "id": "abc" }));
        let mut data = Map::new();
        data.insert("name".to_string(), json!("John"));
        let id = client.add_user(Some(data), Some("user123")).await.unwrap();
        assert_eq!(id, "abc");

        let req = transport.last_request().unwrap();
        assert_eq!(req.url, "http://localhost:8019/api/v1/users");
        let body: Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({ "data": { "name": "John" }, "id": "user123" }));
    }

    #[tokio::test]
    async fn add_user_surfaces_domain_errors() {
        let (client, transport) = client();
        transport.reply_errno(409, "user already exists");
        match client.add_user(None, Some("u1")).await.unwrap_err() {
            ApiError::Domain { errno, errmsg } => {
                assert_eq!(errno, 409);
                assert_eq!(errmsg, "user already exists");
            }
            other => panic!("expected Domain, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_user_puts_full_data() {
        let (client, transport) = client();
        transport.reply_data(json!({ "id": "user123" }));
        let id = client.update_user("user123", None).await.unwrap();
        assert_eq!(id, "user123");
        let req = transport.last_request().unwrap();
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(req.url, "http://localhost:8019/api/v1/users/user123");
        assert_eq!(req.body.as_deref(), Some(r#"{"data":null}"#));
    }

    #[tokio::test]
    async fn get_users_without_data_is_empty() {
        let (client, transport) = client();
        transport.reply_empty();
        let users = client.get_users(&UsersQuery::default()).await.unwrap();
        assert_eq!(users, ProjectUsers { users: vec![], count: 0 });
        assert_eq!(
            transport.last_request().unwrap().url,
            "http://localhost:8019/api/v1/project/users?search=&order_by=updated_at&order_desc=true&limit=10&offset=0"
        );
    }

    #[tokio::test]
    async fn get_user_attaches_fields() {
        let (client, transport) = client();
        transport.reply_data(json!({ "data": { "name": "Ann" }, "created_at": "2024-01-01T00:00:00Z" }));
        let user = client.get_user("u1", false).await.unwrap();
        assert_eq!(user.user_id(), "u1");
        assert_eq!(user.fields().unwrap()["data"]["name"], "Ann");
    }

    #[tokio::test]
    async fn get_user_no_fetch_sends_nothing() {
        let (client, transport) = client();
        let user = client.get_user("u1", true).await.unwrap();
        assert_eq!(user.user_id(), "u1");
        assert!(user.fields().is_none());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn get_user_missing_propagates() {
        let (client, transport) = client();
        transport.reply_errno(404, "user not found");
        let err = client.get_user("ghost", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_or_create_user_creates_after_failed_lookup() {
        let (client, transport) = client();
        transport.fail("network down").reply_data(json!({ "id": "u1" }));
        let user = client.get_or_create_user("u1").await.unwrap();
        assert_eq!(user.user_id(), "u1");
        assert!(user.fields().is_none());

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].method, HttpMethod::Post);
        assert_eq!(requests[1].url, "http://localhost:8019/api/v1/users");
        assert_eq!(requests[1].body.as_deref(), Some(r#"{"id":"u1"}"#));
    }

    #[tokio::test]
    async fn get_or_create_user_skips_creation_when_found() {
        let (client, transport) = client();
        transport.reply_data(json!({ "data": {} }));
        client.get_or_create_user("u1").await.unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn delete_user_propagates_failure() {
        let (client, transport) = client();
        transport.reply_empty().reply_errno(404, "user not found");
        assert!(client.delete_user("u1").await.unwrap());
        assert_eq!(transport.requests()[0].method, HttpMethod::Delete);
        assert!(client.delete_user("u1").await.is_err());
    }

    #[tokio::test]
    async fn user_ids_are_escaped_into_one_segment() {
        let (client, transport) = client();
        transport
            .reply_empty()
            .reply_data(json!({ "data": null }))
            .reply_data(json!({ "id": "a b" }));
        client.delete_user("alice?x=1").await.unwrap();
        client.get_user("team/alice", false).await.unwrap();
        client.update_user("a b", None).await.unwrap();

        let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                "http://localhost:8019/api/v1/users/alice%3Fx%3D1",
                "http://localhost:8019/api/v1/users/team%2Falice",
                "http://localhost:8019/api/v1/users/a%20b",
            ]
        );
    }

    #[tokio::test]
    async fn get_usage_sends_last_days() {
        let (client, transport) = client();
        transport
            .reply_data(json!([{ "date": "2024-01-01", "total_insert": 3 }]))
            .reply_empty();
        let usage = client.get_usage(30).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].total_insert, 3);
        assert_eq!(
            transport.last_request().unwrap().url,
            "http://localhost:8019/api/v1/project/usage?last_days=30"
        );
        assert!(client.get_usage(7).await.unwrap().is_empty());
    }
}
