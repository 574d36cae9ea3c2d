//! Per-user handle: blob ingestion, profiles and events for one user id.
//!
//! # Design
//! A `UserHandle` is a capability, not a cache. It holds the user id, a
//! clone of the client, and optionally the fields seen when it was created;
//! every operation issues a fresh request under `/…/{user_id}`. Ids are
//! percent-encoded into a single path segment. Handles are cheap to create
//! and drop and may be shared across tasks.

use serde::de::IgnoredAny;
use serde_json::{json, Map, Value};

use crate::blob::{blob_from_value, Blob, BlobType};
use crate::client::MemoBaseClient;
use crate::compose::escape_segment;
use crate::envelope::Envelope;
use crate::error::ApiError;
use crate::http::HttpMethod;
use crate::types::{
    BufferStatus, ContextData, ContextOptions, EventSearch, EventsData, IdData, IdsData, Profile,
    ProfilesData, UserEvent,
};

#[derive(Debug, Clone)]
pub struct UserHandle {
    user_id: String,
    client: MemoBaseClient,
    fields: Option<Map<String, Value>>,
}

impl UserHandle {
    pub(crate) fn new(
        user_id: &str,
        client: MemoBaseClient,
        fields: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            client,
            fields,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The user record fetched when this handle was created, if any. Never
    /// refreshed.
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.fields.as_ref()
    }

    /// Insert a blob and return its id.
    pub async fn insert(&self, blob: &Blob) -> Result<String, ApiError> {
        self.insert_with(blob, false).await
    }

    /// Insert a blob; with `wait_process` the server processes the buffer
    /// before answering, so profiles are current once this returns.
    pub async fn insert_with(&self, blob: &Blob, wait_process: bool) -> Result<String, ApiError> {
        blob.validate()?;
        let blob_data =
            serde_json::to_value(blob).map_err(|e| ApiError::Serialization(e.to_string()))?;

        let mut body = Map::new();
        body.insert("blob_type".to_string(), json!(blob.blob_type()));
        if let Some(fields) = &blob.fields {
            body.insert("fields".to_string(), Value::Object(fields.clone()));
        }
        if let Some(created_at) = &blob.created_at {
            body.insert("created_at".to_string(), json!(created_at));
        }
        body.insert("blob_data".to_string(), blob_data);

        let inserted: IdData = self
            .client
            .fetch(
                HttpMethod::Post,
                &format!("/blobs/insert/{}", self.uid()),
                &wait_query(wait_process),
                Some(&Value::Object(body)),
            )
            .await?
            .into_data("insert blob")?;
        Ok(inserted.id)
    }

    pub async fn get(&self, blob_id: &str) -> Result<Blob, ApiError> {
        let data: Value = self
            .client
            .get(&self.blob_path(blob_id), &[])
            .await?
            .into_data("get blob")?;
        blob_from_value(data)
    }

    /// One page of blob ids of `blob_type`, in server order.
    pub async fn get_all(
        &self,
        blob_type: BlobType,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<String>, ApiError> {
        let query = [("page", page.to_string()), ("page_size", page_size.to_string())];
        let data: IdsData = self
            .client
            .get(&format!("/users/blobs/{}/{blob_type}", self.uid()), &query)
            .await?
            .into_data("list blobs")?;
        Ok(data.ids)
    }

    pub async fn delete(&self, blob_id: &str) -> Result<bool, ApiError> {
        self.send_ignoring_data(HttpMethod::Delete, &self.blob_path(blob_id), &[])
            .await
    }

    /// Ask the server to process buffered blobs of `blob_type`. Profiles
    /// only reflect inserted blobs once they have been flushed.
    pub async fn flush(&self, blob_type: BlobType) -> Result<bool, ApiError> {
        self.flush_with(blob_type, false).await
    }

    /// `flush`, optionally waiting until processing has finished.
    pub async fn flush_with(&self, blob_type: BlobType, wait_process: bool) -> Result<bool, ApiError> {
        self.send_ignoring_data(
            HttpMethod::Post,
            &format!("/users/buffer/{}/{blob_type}", self.uid()),
            &wait_query(wait_process),
        )
        .await
    }

    /// Ids of buffered blobs of `blob_type` currently in `status`.
    pub async fn buffer(
        &self,
        blob_type: BlobType,
        status: BufferStatus,
    ) -> Result<Vec<String>, ApiError> {
        let query = [("status", status.to_string())];
        let data: IdsData = self
            .client
            .get(&format!("/users/buffer/capacity/{}/{blob_type}", self.uid()), &query)
            .await?
            .into_data("buffer")?;
        Ok(data.ids)
    }

    pub async fn profile(&self) -> Result<Vec<Profile>, ApiError> {
        let data: ProfilesData = self
            .client
            .get(&format!("/users/profile/{}", self.uid()), &[])
            .await?
            .into_data("get profile")?;
        data.profiles
            .into_iter()
            .map(|record| record.into_profile())
            .collect()
    }

    /// Add a profile entry by hand and return its id.
    pub async fn add_profile(
        &self,
        content: &str,
        topic: &str,
        sub_topic: &str,
    ) -> Result<String, ApiError> {
        let body = profile_body(content, topic, sub_topic);
        let added: IdData = self
            .client
            .fetch(
                HttpMethod::Post,
                &format!("/users/profile/{}", self.uid()),
                &[],
                Some(&body),
            )
            .await?
            .into_data("add profile")?;
        Ok(added.id)
    }

    pub async fn update_profile(
        &self,
        profile_id: &str,
        content: &str,
        topic: &str,
        sub_topic: &str,
    ) -> Result<bool, ApiError> {
        let body = profile_body(content, topic, sub_topic);
        self.client
            .fetch::<IgnoredAny>(HttpMethod::Put, &self.profile_path(profile_id), &[], Some(&body))
            .await?;
        Ok(true)
    }

    pub async fn delete_profile(&self, profile_id: &str) -> Result<bool, ApiError> {
        self.send_ignoring_data(HttpMethod::Delete, &self.profile_path(profile_id), &[])
            .await
    }

    /// The memory prompt for this user: profiles and recent events rendered
    /// as text, shaped by `options`.
    pub async fn context(&self, options: &ContextOptions) -> Result<String, ApiError> {
        let data: ContextData = self
            .client
            .get(&format!("/users/context/{}", self.uid()), &options.to_pairs()?)
            .await?
            .into_data("context")?;
        Ok(data.context)
    }

    /// The `topk` most recent events. Empty when the server returns no `data`.
    pub async fn events(&self, topk: u32) -> Result<Vec<UserEvent>, ApiError> {
        let query = [("topk", topk.to_string())];
        let envelope: Envelope<EventsData> = self
            .client
            .get(&format!("/users/event/{}", self.uid()), &query)
            .await?;
        Ok(envelope.data.map(|d| d.events).unwrap_or_default())
    }

    /// Events similar to `search.query`, best match first.
    pub async fn search_event(&self, search: &EventSearch) -> Result<Vec<UserEvent>, ApiError> {
        let envelope: Envelope<EventsData> = self
            .client
            .get(&format!("/users/event/search/{}", self.uid()), &search.to_pairs())
            .await?;
        Ok(envelope.data.map(|d| d.events).unwrap_or_default())
    }

    /// Merge `event_data` (e.g. `{"event_tip": ...}`) into an event.
    pub async fn update_event(
        &self,
        event_id: &str,
        event_data: Map<String, Value>,
    ) -> Result<bool, ApiError> {
        let body = Value::Object(event_data);
        self.client
            .fetch::<IgnoredAny>(HttpMethod::Put, &self.event_path(event_id), &[], Some(&body))
            .await?;
        Ok(true)
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<bool, ApiError> {
        self.send_ignoring_data(HttpMethod::Delete, &self.event_path(event_id), &[])
            .await
    }

    fn uid(&self) -> String {
        escape_segment(&self.user_id)
    }

    fn blob_path(&self, blob_id: &str) -> String {
        format!("/blobs/{}/{}", self.uid(), escape_segment(blob_id))
    }

    fn profile_path(&self, profile_id: &str) -> String {
        format!("/users/profile/{}/{}", self.uid(), escape_segment(profile_id))
    }

    fn event_path(&self, event_id: &str) -> String {
        format!("/users/event/{}/{}", self.uid(), escape_segment(event_id))
    }

    async fn send_ignoring_data(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<bool, ApiError> {
        self.client
            .fetch::<IgnoredAny>(method, path, query, None)
            .await?;
        Ok(true)
    }
}

/// `wait_process` is only sent when set; the server's default is not to wait.
fn wait_query(wait_process: bool) -> Vec<(&'static str, String)> {
    if wait_process {
        vec![("wait_process", "true".to_string())]
    } else {
        Vec::new()
    }
}

fn profile_body(content: &str, topic: &str, sub_topic: &str) -> Value {
    json!({
        "content": content,
        "attributes": { "topic": topic, "sub_topic": sub_topic },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::blob::ChatMessage;
    use crate::config::ClientConfig;
    use crate::testing::ScriptedTransport;

    const BASE: &str = "http://localhost:8019/api/v1";

    fn user() -> (UserHandle, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let config = ClientConfig::new("http://localhost:8019").api_key("sk-test");
        let client = MemoBaseClient::new(config, transport.clone()).unwrap();
        (UserHandle::new("u1", client, None), transport)
    }

    fn sent_body(transport: &ScriptedTransport) -> Value {
        let req = transport.last_request().unwrap();
        serde_json::from_str(req.body.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn insert_sends_tag_fields_and_full_blob() {
        let (user, transport) = user();
        transport.reply_data(json!({ "id": "b1" }));
        let mut fields = Map::new();
        fields.insert("session".to_string(), json!("s-9"));
        let blob = Blob::chat(vec![ChatMessage::user("I live in Paris")]).with_fields(fields);

        assert_eq!(user.insert(&blob).await.unwrap(), "b1");
        assert_eq!(transport.last_request().unwrap().url, format!("{BASE}/blobs/insert/u1"));
        assert_eq!(
            sent_body(&transport),
            json!({
                "blob_type": "chat",
                "fields": { "session": "s-9" },
                "blob_data": {
                    "type": "chat",
                    "messages": [{ "role": "user", "content": "I live in Paris" }],
                    "fields": { "session": "s-9" }
                }
            })
        );
    }

    #[tokio::test]
    async fn insert_rejects_invalid_blob_without_sending() {
        let (user, transport) = user();
        let err = user.insert(&Blob::chat(vec![])).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidBlob(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn get_rebuilds_stored_blob() {
        let (user, transport) = user();
        transport.reply_data(json!({
            "blob_type": "doc",
            "blob_data": { "content": "meeting notes" },
            "created_at": "2024-03-01T08:00:00Z"
        }));
        let blob = user.get("b1").await.unwrap();
        assert_eq!(blob.blob_type(), BlobType::Doc);
        assert_eq!(transport.last_request().unwrap().url, format!("{BASE}/blobs/u1/b1"));
    }

    #[tokio::test]
    async fn get_all_addresses_page_and_keeps_order() {
        let (user, transport) = user();
        transport.reply_data(json!({ "ids": ["c", "a", "b"] }));
        let ids = user.get_all(BlobType::Chat, 1, 20).await.unwrap();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(
            transport.last_request().unwrap().url,
            format!("{BASE}/users/blobs/u1/chat?page=1&page_size=20")
        );
    }

    #[tokio::test]
    async fn delete_and_flush_return_true() {
        let (user, transport) = user();
        transport.reply_empty().reply_empty();
        assert!(user.delete("b1").await.unwrap());
        assert!(user.flush(BlobType::default()).await.unwrap());

        let requests = transport.requests();
        assert_eq!(requests[0].method, HttpMethod::Delete);
        assert_eq!(requests[0].url, format!("{BASE}/blobs/u1/b1"));
        assert_eq!(requests[1].method, HttpMethod::Post);
        assert_eq!(requests[1].url, format!("{BASE}/users/buffer/u1/chat"));
        assert!(requests[1].body.is_none());
    }

    #[tokio::test]
    async fn flush_propagates_domain_error() {
        let (user, transport) = user();
        transport.reply_errno(500, "extraction failed");
        let err = user.flush(BlobType::Chat).await.unwrap_err();
        assert_eq!(err.errno(), Some(500));
    }

    #[tokio::test]
    async fn profile_defaults_topics_and_parses_timestamps() {
        let (user, transport) = user();
        transport.reply_data(json!({
            "profiles": [
                { "id": "p1", "content": "likes tea", "attributes": {}, "updated_at": "2023-01-01T00:00:00Z" },
                { "id": "p2", "content": "Paris", "attributes": { "topic": "basic_info", "sub_topic": "city" }, "updated_at": "2023-01-02T00:00:00Z" }
            ]
        }));
        let profiles = user.profile().await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].topic, "NONE");
        assert_eq!(profiles[0].sub_topic, "NONE");
        assert_eq!(profiles[0].updated_at, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(profiles[1].topic, "basic_info");
        assert_eq!(profiles[1].sub_topic, "city");
    }

    #[tokio::test]
    async fn profile_with_bad_timestamp_is_a_protocol_error() {
        let (user, transport) = user();
        transport.reply_data(json!({
            "profiles": [{ "content": "x", "attributes": {}, "updated_at": "soon" }]
        }));
        assert!(matches!(user.profile().await, Err(ApiError::Protocol(_))));
    }

    #[tokio::test]
    async fn profile_edits_address_profile_paths() {
        let (user, transport) = user();
        transport
            .reply_data(json!({ "id": "p9" }))
            .reply_empty()
            .reply_empty();
        assert_eq!(user.add_profile("tea", "interest", "drink").await.unwrap(), "p9");
        assert!(user.update_profile("p9", "coffee", "interest", "drink").await.unwrap());
        assert!(user.delete_profile("p9").await.unwrap());

        let requests = transport.requests();
        assert_eq!(requests[0].url, format!("{BASE}/users/profile/u1"));
        assert_eq!(requests[1].method, HttpMethod::Put);
        assert_eq!(requests[1].url, format!("{BASE}/users/profile/u1/p9"));
        assert_eq!(requests[2].method, HttpMethod::Delete);
        let body: Value = serde_json::from_str(requests[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({ "content": "coffee", "attributes": { "topic": "interest", "sub_topic": "drink" } })
        );
    }

    #[tokio::test]
    async fn events_are_empty_without_data() {
        let (user, transport) = user();
        transport
            .reply_empty()
            .reply_data(json!({ "events": [{ "id": "e1", "event_data": { "profile_delta": [] } }] }));
        assert!(user.events(5).await.unwrap().is_empty());
        let events = user.events(5).await.unwrap();
        assert_eq!(events[0].id, "e1");
        assert_eq!(transport.last_request().unwrap().url, format!("{BASE}/users/event/u1?topk=5"));
    }

    #[tokio::test]
    async fn wait_process_is_sent_only_when_requested() {
        let (user, transport) = user();
        transport
            .reply_data(json!({ "id": "b1" }))
            .reply_empty()
            .reply_data(json!({ "id": "b2" }));
        user.insert_with(&Blob::doc("notes"), true).await.unwrap();
        assert!(user.flush_with(BlobType::Doc, true).await.unwrap());
        user.insert(&Blob::doc("notes")).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].url, format!("{BASE}/blobs/insert/u1?wait_process=true"));
        assert_eq!(requests[1].url, format!("{BASE}/users/buffer/u1/doc?wait_process=true"));
        assert_eq!(requests[2].url, format!("{BASE}/blobs/insert/u1"));
    }

    #[tokio::test]
    async fn buffer_lists_ids_by_status() {
        let (user, transport) = user();
        transport.reply_data(json!({ "ids": ["b1", "b2"] }));
        let ids = user.buffer(BlobType::Chat, BufferStatus::Processing).await.unwrap();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert_eq!(
            transport.last_request().unwrap().url,
            format!("{BASE}/users/buffer/capacity/u1/chat?status=processing")
        );
    }

    #[tokio::test]
    async fn context_returns_prompt_text() {
        let (user, transport) = user();
        transport
            .reply_data(json!({ "context": "# Memory\n- interest::drink: tea" }))
            .reply_empty();
        let options = ContextOptions {
            max_token_size: 200,
            only_topics: vec!["interest".to_string()],
            ..ContextOptions::default()
        };
        let context = user.context(&options).await.unwrap();
        assert!(context.contains("tea"));
        let req = transport.last_request().unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(
            req.url,
            format!("{BASE}/users/context/u1?max_token_size=200&only_topics=interest")
        );

        assert!(matches!(
            user.context(&ContextOptions::default()).await,
            Err(ApiError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn search_event_encodes_query_and_keeps_similarity() {
        let (user, transport) = user();
        transport.reply_data(json!({
            "events": [{ "id": "e1", "event_data": { "profile_delta": [] }, "similarity": 0.91 }]
        }));
        let mut search = EventSearch::new("New York");
        search.topk = 3;
        let events = user.search_event(&search).await.unwrap();
        assert_eq!(events[0].similarity, Some(0.91));
        assert_eq!(
            transport.last_request().unwrap().url,
            format!(
                "{BASE}/users/event/search/u1?query=New+York&topk=3&similarity_threshold=0.2&time_range_in_days=7"
            )
        );
    }

    #[tokio::test]
    async fn update_event_puts_partial_event_data() {
        let (user, transport) = user();
        transport.reply_empty();
        let mut data = Map::new();
        data.insert("event_tip".to_string(), json!("moved in May"));
        assert!(user.update_event("e1", data).await.unwrap());

        let req = transport.last_request().unwrap();
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(req.url, format!("{BASE}/users/event/u1/e1"));
        assert_eq!(sent_body(&transport), json!({ "event_tip": "moved in May" }));
    }

    #[tokio::test]
    async fn ids_stay_inside_their_segment() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = ClientConfig::new("http://localhost:8019").api_key("sk-test");
        let client = MemoBaseClient::new(config, transport.clone()).unwrap();
        let user = client.get_user("team/alice", true).await.unwrap();
        transport.reply_empty().reply_empty().reply_empty();

        user.delete("b?x=1").await.unwrap();
        user.delete_profile("p#1").await.unwrap();
        user.delete_event("../e1").await.unwrap();

        let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                format!("{BASE}/blobs/team%2Falice/b%3Fx%3D1"),
                format!("{BASE}/users/profile/team%2Falice/p%231"),
                format!("{BASE}/users/event/team%2Falice/..%2Fe1"),
            ]
        );
        assert_eq!(user.user_id(), "team/alice");
    }
}
